//! Tunnel probe logic.
//!
//! Sends one HTTP request to the tunnel's public URL and classifies the
//! response against the tunnel provider's known failure signatures. A probe
//! never returns an error: transport failures become `Unhealthy` outcomes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, SERVER};
use serde::Serialize;
use tracing::debug;

use crate::error::HealthResult;

/// Why a tunnel was classified as unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyReason {
    /// HTTP 429: the provider is throttling the tunnel.
    RateLimited,
    /// HTTP 402: the account's quota or session has expired.
    PaymentRequired,
    /// HTTP 500: the tunnel could not reach the local service.
    ServerError,
    /// No `Server` header, so the expected proxy is no longer in front.
    MissingServerHeader,
    /// Connect, DNS, TLS or timeout failure.
    Transport,
    /// No public URL is known for the tunnel.
    NoActiveTunnel,
}

/// What a probe observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseInfo {
    pub url: String,
    /// HTTP status, absent when no response was received.
    pub status: Option<u16>,
    /// Value of the `Server` response header.
    pub server: Option<String>,
    /// Set for unhealthy outcomes only.
    pub reason: Option<UnhealthyReason>,
    /// Underlying transport error text.
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
}

impl ResponseInfo {
    pub fn has_server_header(&self) -> bool {
        self.server.is_some()
    }

    /// Synthesized info for a transport-level failure.
    pub fn transport_failure(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status: None,
            server: None,
            reason: Some(UnhealthyReason::Transport),
            error: Some(error.into()),
            latency_ms: None,
        }
    }

    /// Synthesized info for a check requested while no tunnel is active.
    pub fn no_active_tunnel() -> Self {
        Self {
            url: String::new(),
            status: None,
            server: None,
            reason: Some(UnhealthyReason::NoActiveTunnel),
            error: Some("no active tunnel".to_string()),
            latency_ms: None,
        }
    }

    /// Human-readable summary used for stored errors and logs.
    pub fn describe(&self) -> String {
        match (self.reason, self.status) {
            (Some(UnhealthyReason::Transport), _) => format!(
                "request failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            (Some(UnhealthyReason::NoActiveTunnel), _) => "no active tunnel".to_string(),
            (Some(UnhealthyReason::MissingServerHeader), Some(status)) => {
                format!("status {status} without a Server header")
            }
            (Some(UnhealthyReason::RateLimited), _) => "too many requests (429)".to_string(),
            (Some(UnhealthyReason::PaymentRequired), _) => {
                "tunnel session expired or quota exhausted (402)".to_string()
            }
            (Some(UnhealthyReason::ServerError), _) => {
                "tunnel could not reach the local service (500)".to_string()
            }
            (_, Some(status)) => format!("status {status}"),
            (_, None) => "no response".to_string(),
        }
    }
}

/// Result of a single tunnel probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "health", content = "response", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy(ResponseInfo),
    Unhealthy(ResponseInfo),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy(_))
    }

    pub fn info(&self) -> &ResponseInfo {
        match self {
            ProbeOutcome::Healthy(info) | ProbeOutcome::Unhealthy(info) => info,
        }
    }
}

/// Classify a received response.
///
/// Unhealthy on 429, 402 or 500, or when the `Server` header is missing.
/// Every other response, including other 4xx/5xx codes, is healthy.
pub fn classify(url: &str, status: u16, server: Option<String>, latency_ms: u64) -> ProbeOutcome {
    let reason = match status {
        429 => Some(UnhealthyReason::RateLimited),
        402 => Some(UnhealthyReason::PaymentRequired),
        500 => Some(UnhealthyReason::ServerError),
        _ if server.is_none() => Some(UnhealthyReason::MissingServerHeader),
        _ => None,
    };

    let info = ResponseInfo {
        url: url.to_string(),
        status: Some(status),
        server,
        reason,
        error: None,
        latency_ms: Some(latency_ms),
    };

    match reason {
        None => ProbeOutcome::Healthy(info),
        Some(_) => ProbeOutcome::Unhealthy(info),
    }
}

/// Probe seam used by the scheduler.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probe `url` once. Must not fail; every failure is an outcome.
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// HTTP tunnel probe.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    /// Build a probe whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> HealthResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tunwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        let start = Instant::now();

        let response = match self
            .client
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("timed out after {}ms", self.timeout.as_millis())
                } else {
                    e.to_string()
                };
                debug!(%error, %url, "tunnel probe request failed");
                return ProbeOutcome::Unhealthy(ResponseInfo::transport_failure(url, error));
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status().as_u16();
        let server = response
            .headers()
            .get(SERVER)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        let outcome = classify(url, status, server, latency_ms);
        if !outcome.is_healthy() {
            debug!(status, %url, reason = ?outcome.info().reason, "tunnel probe unhealthy");
        }
        outcome
    }
}
