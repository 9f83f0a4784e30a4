use std::{sync::Arc, time::Duration};

use log::{info, warn};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::models::LinkHealth;

/// Exponential backoff shape shared by both supervised links (sensor
/// transport and remote store): the delay doubles per consecutive failure
/// up to a bounded maximum.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let delay = self.initial.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }
}

/// Health probe for one link. Probes may block (serial handshake, ping
/// query); the supervisor always runs them under `spawn_blocking`.
pub type LinkProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Owns the reconnect/retry loop for one external link and publishes its
/// health over a watch channel. Both links get the identical treatment:
/// probe on a fixed cadence while healthy, back off exponentially while
/// degraded, publish `Healthy` again on recovery. A link that never
/// recovers stays `Degraded` forever — the system runs in its degraded
/// mode, it does not halt.
pub struct LinkSupervisor;

impl LinkSupervisor {
    pub fn spawn(
        name: &'static str,
        probe: LinkProbe,
        policy: RetryPolicy,
        check_interval: Duration,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, watch::Receiver<LinkHealth>) {
        let (health_tx, health_rx) = watch::channel(LinkHealth::Healthy);

        let handle = tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;

            loop {
                let probe_clone = Arc::clone(&probe);
                let healthy = match tokio::task::spawn_blocking(move || probe_clone()).await {
                    Ok(result) => result,
                    Err(join_err) => {
                        warn!("{name} link probe worker failed: {join_err}");
                        false
                    }
                };

                let delay = if healthy {
                    if consecutive_failures > 0 {
                        info!("{name} link recovered after {consecutive_failures} failed probes");
                    }
                    consecutive_failures = 0;
                    if !health_tx.borrow().is_healthy() {
                        let _ = health_tx.send(LinkHealth::Healthy);
                    }
                    check_interval
                } else {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = policy.delay_for(consecutive_failures);
                    warn!(
                        "{name} link down ({consecutive_failures} consecutive failures), retrying in {delay:?}"
                    );
                    let _ = health_tx.send(LinkHealth::Degraded(format!(
                        "{name} unreachable, {consecutive_failures} consecutive failed probes"
                    )));
                    delay
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        info!("{name} link supervisor shutting down");
                        break;
                    }
                }
            }
        });

        (handle, health_rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(60), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn supervisor_reports_degraded_then_recovers() {
        let up = Arc::new(AtomicBool::new(false));
        let probe_up = up.clone();
        let probe: LinkProbe = Arc::new(move || probe_up.load(Ordering::SeqCst));

        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20));
        let (handle, mut health) = LinkSupervisor::spawn(
            "test",
            probe,
            policy,
            Duration::from_millis(5),
            cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                health.changed().await.unwrap();
                if !health.borrow().is_healthy() {
                    break;
                }
            }
        })
        .await
        .expect("expected degraded status");

        up.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                health.changed().await.unwrap();
                if health.borrow().is_healthy() {
                    break;
                }
            }
        })
        .await
        .expect("expected recovery");

        cancel.cancel();
        let _ = handle.await;
    }
}
