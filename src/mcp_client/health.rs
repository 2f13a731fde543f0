//! Health monitor: periodic liveness and responsiveness checks.
//!
//! Runs as a background task holding only a weak reference to the client,
//! so it ends on its own once the client is dropped. It wakes on every probe
//! interval and whenever a receive loop reports a lost transport.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::Inner;
use super::errors::McpError;
use super::types::ConnectionState;

/// Method used for probing. Servers that do not implement it answer with a
/// JSON-RPC error, which still proves the protocol loop is alive.
const PROBE_METHOD: &str = "ping";

pub(super) fn spawn_monitor(
    client: Weak<Inner>,
    lost: Arc<Notify>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the session was just checked.
        ticker.tick().await;

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => "interval",
                _ = lost.notified() => "connection lost",
            };
            let Some(inner) = client.upgrade() else {
                break;
            };
            check(&inner, trigger).await;
        }
        tracing::debug!("health monitor stopped");
    })
}

/// One health check; starts recovery when the connection is unhealthy.
async fn check(inner: &Arc<Inner>, trigger: &str) {
    if inner.published_state() != ConnectionState::Ready {
        return;
    }

    let observed = inner.generation();
    match probe(inner).await {
        Ok(()) => {
            inner.mark_healthy();
            tracing::trace!(server = %inner.server_name, trigger, "health check passed");
        }
        Err(reason) => {
            let idle_ms = inner
                .current_session()
                .and_then(|s| s.idle_for())
                .map(|d| d.as_millis() as u64);
            tracing::warn!(
                server = %inner.server_name,
                trigger,
                reason = %reason,
                idle_ms = ?idle_ms,
                "health check failed"
            );
            if let Err(e) = inner.reconnect(observed, &reason).await {
                tracing::error!(server = %inner.server_name, error = %e, "recovery failed");
            }
        }
    }
}

async fn probe(inner: &Inner) -> Result<(), String> {
    let Some(session) = inner.current_session() else {
        return Err("no session".to_string());
    };
    if !session.is_alive() {
        return Err("server process is not running".to_string());
    }

    let window = inner.health.staleness_window();
    if let Some(since) = inner.since_healthy() {
        if since > window {
            return Err(format!(
                "no successful probe for {}ms",
                since.as_millis()
            ));
        }
    }

    match session
        .correlator()
        .call(PROBE_METHOD, None, inner.timeouts.probe())
        .await
    {
        Ok(_) => Ok(()),
        Err(McpError::Remote { code, .. }) => {
            tracing::trace!(server = %inner.server_name, code, "probe answered with error; responsive");
            Ok(())
        }
        Err(e) => Err(format!("probe failed: {e}")),
    }
}
