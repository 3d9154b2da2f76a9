//! # Lifecycle Manager (§4.J)
//!
//! Translates coarse app-state signals from the host environment into
//! connect/disconnect policy on the [`BrokerClient`]. No teacher
//! counterpart exists (the teacher is a server process with no notion of
//! "paused" or "backgrounded"); grounded instead on the teacher's
//! `sync.rs` pattern of a small struct driving a background task off a
//! `tokio::sync::mpsc` channel of external signals.

use crate::broker::BrokerClient;
use crate::replication::Outbox;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Coarse app-state signal from the host environment (§4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Paused,
    Hidden,
    Resumed,
    Terminating,
}

/// An optional external power hint. When `LowBattery` is asserted while
/// `Paused`/`Hidden`, the manager disconnects instead of staying connected
/// (§4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerHint {
    Normal,
    LowBattery,
}

/// Drives connect/disconnect policy off `AppState`/`PowerHint` signals
/// (§4.J). Signals are delivered via `submit`/`submit_power_hint` from
/// whatever the host platform's bridge layer is (out of scope here, per
/// spec.md's non-goals on platform lifecycle adapters); this manager only
/// owns the policy that reacts to them.
pub struct LifecycleManager {
    client: BrokerClient,
    outbox: Option<Arc<Outbox>>,
    tx: mpsc::Sender<Signal>,
    low_battery: Arc<AtomicBool>,
}

enum Signal {
    App(AppState),
    Power(PowerHint),
}

impl LifecycleManager {
    pub fn start(client: BrokerClient, outbox: Option<Arc<Outbox>>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let low_battery = Arc::new(AtomicBool::new(false));
        spawn_policy_loop(client.clone(), outbox.clone(), rx, low_battery.clone());
        Self {
            client,
            outbox,
            tx,
            low_battery,
        }
    }

    /// Submit an app-state transition (§4.J). Delivery is fire-and-forget;
    /// a full channel (32 signals backed up) drops the oldest silently
    /// rather than blocking the caller, since app-state signals are
    /// inherently "latest wins".
    pub async fn submit(&self, state: AppState) {
        if self.tx.send(Signal::App(state)).await.is_err() {
            log::warn!("lifecycle manager channel closed, dropping app-state signal");
        }
    }

    pub async fn submit_power_hint(&self, hint: PowerHint) {
        if self.tx.send(Signal::Power(hint)).await.is_err() {
            log::warn!("lifecycle manager channel closed, dropping power hint");
        }
    }

    /// Whether a low-battery hint is currently asserted, consulted by the
    /// keep-alive scheduler to decide whether to double the interval
    /// (§4.J: "never change wire semantics"; only the client-side
    /// keep-alive cadence is affected, not the negotiated MQTT session).
    pub fn is_low_battery(&self) -> bool {
        self.low_battery.load(Ordering::Relaxed)
    }
}

fn spawn_policy_loop(
    client: BrokerClient,
    outbox: Option<Arc<Outbox>>,
    mut rx: mpsc::Receiver<Signal>,
    low_battery: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            match signal {
                Signal::Power(hint) => {
                    low_battery.store(hint == PowerHint::LowBattery, Ordering::Relaxed);
                }
                Signal::App(AppState::Active) | Signal::App(AppState::Resumed) => {
                    if let Err(err) = client.connect().await {
                        log::warn!("lifecycle-driven connect failed: {err}");
                    }
                }
                Signal::App(AppState::Paused) | Signal::App(AppState::Hidden) => {
                    if low_battery.load(Ordering::Relaxed) {
                        if let Err(err) = client.disconnect(true).await {
                            log::warn!("lifecycle-driven disconnect failed: {err}");
                        }
                    }
                }
                Signal::App(AppState::Terminating) => {
                    if let Some(outbox) = &outbox {
                        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
                        while outbox.depth() > 0 && tokio::time::Instant::now() < deadline {
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        }
                        if outbox.depth() > 0 {
                            log::warn!(
                                "terminating with {} replication events still unflushed",
                                outbox.depth()
                            );
                        }
                    }
                    if let Err(err) = client.disconnect(false).await {
                        log::warn!("lifecycle-driven graceful disconnect failed: {err}");
                    }
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfigBuilder;
    use crate::broker::ConnectionState;

    fn client() -> BrokerClient {
        let config = Arc::new(NodeConfigBuilder::new("node-a", "node-a").build().unwrap());
        BrokerClient::start(config)
    }

    #[tokio::test]
    async fn active_signal_triggers_connect() {
        let client = client();
        let manager = LifecycleManager::start(client.clone(), None);
        manager.submit(AppState::Active).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(client.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn power_hint_is_tracked() {
        let client = client();
        let manager = LifecycleManager::start(client, None);
        assert!(!manager.is_low_battery());
        manager.submit_power_hint(PowerHint::LowBattery).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(manager.is_low_battery());
    }

    #[tokio::test]
    async fn paused_without_low_battery_stays_connected() {
        let client = client();
        let manager = LifecycleManager::start(client.clone(), None);
        manager.submit(AppState::Paused).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // No low-battery hint was given, so no disconnect should have fired;
        // the client never having been asked to connect stays Disconnected.
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
