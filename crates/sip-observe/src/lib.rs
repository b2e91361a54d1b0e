// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability facade for the transport legs.
//!
//! Legs emit low-cardinality events (packet sent/received, errors by stage,
//! connects) through a global sink so deployments can wire in their own
//! metrics backend without the legs depending on one.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{set_leg_metrics, TracingLegMetrics};
//! set_leg_metrics(Arc::new(TracingLegMetrics));
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Metrics sink used by legs to emit observability events.
///
/// Implementations should treat `proto` and `stage` as low-cardinality
/// identifiers ("udp", "recv", "connect") and must not propagate untrusted
/// data into metric labels.
pub trait LegMetrics: Send + Sync + 'static {
    fn on_packet_received(&self, proto: &str);
    fn on_packet_sent(&self, proto: &str);
    fn on_error(&self, proto: &str, stage: &str);
    fn on_connect(&self, proto: &str);
}

#[derive(Debug, Default)]
struct NoopLegMetrics;

impl LegMetrics for NoopLegMetrics {
    fn on_packet_received(&self, _proto: &str) {}
    fn on_packet_sent(&self, _proto: &str) {}
    fn on_error(&self, _proto: &str, _stage: &str) {}
    fn on_connect(&self, _proto: &str) {}
}

static LEG_METRICS: OnceCell<Arc<dyn LegMetrics>> = OnceCell::new();
static NOOP_LEG_METRICS: NoopLegMetrics = NoopLegMetrics;

/// Installs the global metrics sink.
///
/// Returns `false` if a sink was already installed.
pub fn set_leg_metrics(metrics: Arc<dyn LegMetrics>) -> bool {
    LEG_METRICS.set(metrics).is_ok()
}

/// Returns the configured metrics sink, or a no-op one.
pub fn leg_metrics() -> &'static dyn LegMetrics {
    LEG_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_LEG_METRICS)
}

/// Sink that forwards every event to `tracing` at debug/warn level.
#[derive(Debug, Default)]
pub struct TracingLegMetrics;

impl LegMetrics for TracingLegMetrics {
    fn on_packet_received(&self, proto: &str) {
        tracing::debug!(proto, "packet received");
    }

    fn on_packet_sent(&self, proto: &str) {
        tracing::debug!(proto, "packet sent");
    }

    fn on_error(&self, proto: &str, stage: &str) {
        tracing::warn!(proto, stage, "transport error");
    }

    fn on_connect(&self, proto: &str) {
        tracing::debug!(proto, "connect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_sink_is_noop() {
        // Must not panic; the default sink swallows everything.
        leg_metrics().on_packet_received("udp");
        leg_metrics().on_error("tcp", "recv");
    }
}
