//! Periodic lease maintenance.
//!
//! Runs [`RendezvousManager::tick`] on the configured monitor interval until
//! shutdown, then releases every lease.

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use super::RendezvousManager;

pub struct RendezvousMonitor {
    manager: RendezvousManager,
    shutdown: broadcast::Receiver<()>,
}

impl RendezvousMonitor {
    pub fn new(manager: RendezvousManager, shutdown: broadcast::Receiver<()>) -> Self {
        Self { manager, shutdown }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.manager.config().monitor_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("rendezvous monitor shutting down");
                    self.manager.disconnect_all();
                    return Ok(());
                }

                _ = interval.tick() => {
                    let report = self.manager.tick();
                    if !report.is_idle() {
                        tracing::debug!(
                            expired = report.expired,
                            renewals = report.renewals,
                            lease_requests = report.lease_requests,
                            clients_expired = report.clients_expired,
                            connections = self.manager.connection_count(),
                            "rendezvous monitor tick"
                        );
                    }
                }
            }
        }
    }
}
