//! tunwatch-state: embedded tunnel state store for tunwatch.
//!
//! Backed by [redb](https://docs.rs/redb), holds one `TunnelState` record
//! per tunnel name: the public URL, the last ping timestamp, the current
//! check interval bucket and the last reported tunnel status.
//!
//! # Architecture
//!
//! Records are JSON-serialized into a single `&str -> &[u8]` table keyed
//! by tunnel name. Field-level accessors (`public_url`, `record_ping`,
//! `set_check_interval`, ...) are the only read/write surface the health
//! scheduler uses; it never keeps its own copy of the state.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
