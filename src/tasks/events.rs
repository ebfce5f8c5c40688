use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::cluster::MembershipEvent;
use crate::config::Settings;
use crate::metrics::ClusterMetrics;
use crate::reschedule::PermanentListenerRescheduler;

/// Background task turning membership changes and configuration reloads
/// into local reschedule plans.
///
/// Membership event counters belong to the cluster transport; this task only
/// refreshes the member gauge.
pub struct RescheduleEventListener {
    rescheduler: Arc<PermanentListenerRescheduler>,
    membership: broadcast::Receiver<MembershipEvent>,
    reloads: broadcast::Receiver<Arc<Settings>>,
    shutdown: broadcast::Receiver<()>,
}

impl RescheduleEventListener {
    pub fn new(
        rescheduler: Arc<PermanentListenerRescheduler>,
        reloads: broadcast::Receiver<Arc<Settings>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let membership = rescheduler.cluster().subscribe();
        Self {
            rescheduler,
            membership,
            reloads,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        ClusterMetrics::set_members(self.rescheduler.cluster().members().len());
        tracing::info!("Reschedule event listener started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Reschedule event listener received shutdown signal");
                    break;
                }
                event = self.membership.recv() => match event {
                    Ok(event) => self.on_membership_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed = missed, "Membership events lagged");
                        self.rescheduler
                            .plan_reschedule(false, "membership events lagged")
                            .await;
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Membership event channel closed");
                        break;
                    }
                },
                settings = self.reloads.recv() => match settings {
                    Ok(settings) => self.on_reload(settings).await,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        tracing::debug!("Reload channel closed");
                        break;
                    }
                },
            }
        }

        tracing::info!("Reschedule event listener stopped");
    }

    async fn on_membership_event(&self, event: MembershipEvent) {
        ClusterMetrics::set_members(self.rescheduler.cluster().members().len());
        let reason = match &event {
            MembershipEvent::Added(member) => {
                tracing::info!(member = %member, "Member joined");
                "member added"
            }
            MembershipEvent::Removed(member) => {
                tracing::info!(member = %member, "Member left");
                "member removed"
            }
        };
        self.rescheduler.plan_reschedule(false, reason).await;
    }

    async fn on_reload(&self, settings: Arc<Settings>) {
        self.rescheduler
            .registry()
            .update_config(settings.push.clone())
            .await;
        self.rescheduler
            .update_config(settings.reschedule.clone())
            .await;
        self.rescheduler
            .plan_reschedule(false, "configuration reloaded")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterService, InProcessNetwork};
    use crate::config::{PushConfig, RescheduleConfig};
    use crate::push::store::MemoryRegistrationStore;
    use crate::push::{LocalJobQueue, PushManagerRegistry};
    use crate::reschedule::ReschedulePolicy;
    use crate::shutdown::ShutdownSignal;
    use std::time::Duration;

    fn rescheduler(network: &Arc<InProcessNetwork>, signal: &ShutdownSignal) -> Arc<PermanentListenerRescheduler> {
        let registry = Arc::new(PushManagerRegistry::new(
            PushConfig::default(),
            Arc::new(LocalJobQueue::new()),
            Arc::new(MemoryRegistrationStore::new()),
            signal.clone(),
        ));
        PermanentListenerRescheduler::new(
            registry,
            network.join("a", None),
            RescheduleConfig::default(),
            signal.clone(),
        )
    }

    #[tokio::test]
    async fn test_member_join_plans_reschedule() {
        let network = InProcessNetwork::new();
        let signal = ShutdownSignal::new();
        let rescheduler = rescheduler(&network, &signal);
        let (_reload_tx, reload_rx) = broadcast::channel(4);

        let listener = RescheduleEventListener::new(rescheduler.clone(), reload_rx, signal.subscribe());
        let handle = tokio::spawn(listener.run());

        let _peer = network.join("b", None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rescheduler.status().await.pending_remote, Some(false));

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_applies_configuration() {
        let network = InProcessNetwork::new();
        let signal = ShutdownSignal::new();
        let rescheduler = rescheduler(&network, &signal);
        let (reload_tx, reload_rx) = broadcast::channel(4);

        let listener = RescheduleEventListener::new(rescheduler.clone(), reload_rx, signal.subscribe());
        let handle = tokio::spawn(listener.run());

        let mut settings = Settings::default();
        settings.reschedule.policy = ReschedulePolicy::PerNode;
        settings.push.permanent_push_allowed = false;
        reload_tx.send(Arc::new(settings)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rescheduler.config().await.policy, ReschedulePolicy::PerNode);
        assert!(!rescheduler.registry().config().await.permanent_push_allowed);
        assert!(rescheduler.status().await.pending_remote.is_some());
        assert_eq!(rescheduler.cluster().members().len(), 1);

        drop(reload_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
