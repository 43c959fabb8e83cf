//! redb table definitions for the tunwatch state store.

use redb::TableDefinition;

/// Tunnel state keyed by tunnel name.
pub const TUNNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnels");
