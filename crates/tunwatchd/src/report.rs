//! Callback adapter that records check results as tunnel status.

use std::sync::Arc;

use tracing::{error, info, warn};
use tunwatch_health::monitor::{ErrorHook, SuccessHook};
use tunwatch_health::{ResponseInfo, UnhealthyReason};
use tunwatch_state::{StateStore, TunnelError, TunnelStatus};

/// Hooks that write `tunnel_status` and `last_error` for `name`.
pub fn status_hooks(state: StateStore, name: String) -> (SuccessHook, ErrorHook) {
    let ok_state = state.clone();
    let ok_name = name.clone();
    let on_success: SuccessHook = Arc::new(move || {
        info!(tunnel = %ok_name, "tunnel reachable");
        if let Err(e) = ok_state.set_tunnel_status(&ok_name, TunnelStatus::Active, None) {
            error!(tunnel = %ok_name, error = %e, "failed to record tunnel status");
        }
    });

    let on_error: ErrorHook = Arc::new(move |info: &ResponseInfo| {
        let (status, error) = tunnel_error(info);
        warn!(tunnel = %name, problem = %error.message, "tunnel check failed");
        if let Err(e) = state.set_tunnel_status(&name, status, Some(error)) {
            error!(tunnel = %name, error = %e, "failed to record tunnel status");
        }
    });

    (on_success, on_error)
}

/// Map a failed check onto the stored status and error.
pub fn tunnel_error(info: &ResponseInfo) -> (TunnelStatus, TunnelError) {
    let status = match info.reason {
        Some(UnhealthyReason::NoActiveTunnel) => TunnelStatus::Inactive,
        _ => TunnelStatus::Error,
    };
    let error = TunnelError {
        status_code: info.status,
        message: info.describe(),
    };
    (status, error)
}
