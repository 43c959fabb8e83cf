//! tunwatch-health: tunnel health checking for tunwatch.
//!
//! Decides when a tunnel's public URL should actually be probed, sends the
//! probe, and reports the outcome. Only one check run per tunnel is active
//! at a time: a newer request supersedes the one in flight.
//!
//! # Architecture
//!
//! ```text
//! TunnelMonitor (periodic ticks + check_now)
//!   └── Scheduler (single-flight, generation counter)
//!       ├── StateStore accessors (public_url, last_pinged_timestamp, check_interval)
//!       ├── IntervalThresholds + Clock → CheckInterval
//!       ├── Probe::probe() → ProbeOutcome
//!       └── CheckRequest callbacks (on_success / on_error)
//! ```
//!
//! # Interval gating
//!
//! A non-forced request only probes when the last check is at least 60s
//! old. Younger checks just publish `FirstInterval` (< 20s) or
//! `SecondInterval` and leave the network alone; the caller re-triggers
//! later. A forced request always probes.

pub mod error;
pub mod interval;
pub mod monitor;
pub mod probe;
pub mod scheduler;

pub use error::{HealthError, HealthResult};
pub use interval::{Clock, IntervalThresholds, ManualClock, SystemClock};
pub use monitor::TunnelMonitor;
pub use probe::{HttpProbe, Probe, ProbeOutcome, ResponseInfo, UnhealthyReason};
pub use scheduler::{CheckHandle, CheckOutcome, CheckRequest, Scheduler};
