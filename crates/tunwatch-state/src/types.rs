//! Domain types for the tunwatch state store.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name identifying a tunnel within the store.
pub type TunnelName = String;

// ── Check interval ────────────────────────────────────────────────

/// Coarse classification of how due the next tunnel check is.
///
/// Published by the scheduler so observers (status output, UIs) can show
/// how recently the tunnel was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInterval {
    /// A check is due now, or one just completed.
    #[default]
    Now,
    /// The last check is recent.
    FirstInterval,
    /// The last check is aging but not yet due.
    SecondInterval,
}

impl fmt::Display for CheckInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckInterval::Now => write!(f, "now"),
            CheckInterval::FirstInterval => write!(f, "first_interval"),
            CheckInterval::SecondInterval => write!(f, "second_interval"),
        }
    }
}

// ── Tunnel status ─────────────────────────────────────────────────

/// Last reported health of the tunnel, as recorded by the trigger side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Inactive,
    Active,
    Error,
}

/// Details of the last failed check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelError {
    /// HTTP status of the failing response, if one was received.
    pub status_code: Option<u16>,
    pub message: String,
}

// ── Tunnel ────────────────────────────────────────────────────────

/// Persisted state of a single tunnel session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TunnelState {
    pub name: TunnelName,
    /// Public endpoint of the tunnel. Empty when no tunnel is active.
    pub public_url: String,
    /// Epoch milliseconds of the last completed check. Never decreases.
    pub last_pinged_timestamp: u64,
    pub check_interval: CheckInterval,
    #[serde(default)]
    pub tunnel_status: TunnelStatus,
    #[serde(default)]
    pub last_error: Option<TunnelError>,
}

impl TunnelState {
    /// Fresh state for a tunnel that has never been checked.
    pub fn new(name: impl Into<TunnelName>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build the key for the tunnels table.
    pub fn table_key(&self) -> &str {
        &self.name
    }

    /// Whether a tunnel endpoint is currently known.
    pub fn has_public_url(&self) -> bool {
        !self.public_url.trim().is_empty()
    }
}
