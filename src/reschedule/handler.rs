//! Requests arriving from other cluster members

use async_trait::async_trait;

use crate::cluster::{ClusterRequest, ClusterRequestHandler, ClusterResponse, Member, ProbeReport};

use super::rescheduler::PermanentListenerRescheduler;

#[async_trait]
impl ClusterRequestHandler for PermanentListenerRescheduler {
    async fn handle_request(
        &self,
        from: &Member,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, String> {
        tracing::debug!(from = %from, request = request.kind(), "Cluster request received");

        match request {
            ClusterRequest::Probe => Ok(ClusterResponse::Probe(ProbeReport {
                has_capable_backend: self.registry.has_capable_backend(),
                all_users_started: self.registry.all_users_started().await,
            })),

            ClusterRequest::StopAllPermanentListeners => {
                let count = self.registry.stop_all_permanent_listeners().await;
                Ok(ClusterResponse::Stopped { count })
            }

            ClusterRequest::StartPermanentListeners { users } => {
                if self.shutdown.is_shutting_down() {
                    return Err("member is shutting down".to_string());
                }
                let assigned = users.len();
                let park = self.config().await.apply_park();
                let started = self
                    .registry
                    .apply_initial_listeners(users, false, park)
                    .await;

                tracing::info!(
                    master = %from,
                    assigned = assigned,
                    started = started.len(),
                    "Applied share assigned by master"
                );

                // Anyone still running one of these is a duplicate
                let count = started.len();
                self.notify_drop(started.into_iter().map(|job| job.push_user().clone()).collect());
                Ok(ClusterResponse::Started { count })
            }

            ClusterRequest::DropPermanentListeners { users } => {
                let count = self.registry.drop_permanent_listeners(&users).await;
                Ok(ClusterResponse::Dropped { count })
            }

            ClusterRequest::PlanReschedule { reason } => {
                self.plan_reschedule(false, &reason).await;
                Ok(ClusterResponse::Accepted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cluster::{ClusterService, InProcessNetwork};
    use crate::config::{PushConfig, RescheduleConfig};
    use crate::push::store::MemoryRegistrationStore;
    use crate::push::{LocalJobQueue, MemoryPushBackend, PushManagerRegistry, PushUser};
    use crate::shutdown::ShutdownSignal;

    use super::*;

    async fn member(
        network: &Arc<InProcessNetwork>,
        name: &str,
    ) -> (Arc<PermanentListenerRescheduler>, Arc<MemoryPushBackend>) {
        let shutdown = ShutdownSignal::new();
        let registry = Arc::new(PushManagerRegistry::new(
            PushConfig::default(),
            Arc::new(LocalJobQueue::new()),
            Arc::new(MemoryRegistrationStore::new()),
            shutdown.clone(),
        ));
        let backend = MemoryPushBackend::new(name);
        registry.add_backend(backend.descriptor()).await;

        let config = RescheduleConfig {
            apply_park_ms: 0,
            remote_timeout_ms: 100,
            ..Default::default()
        };
        let cluster = network.join(name, None);
        let rescheduler = PermanentListenerRescheduler::new(registry, cluster, config, shutdown);
        (rescheduler, backend)
    }

    #[tokio::test]
    async fn test_probe_reports_local_state() {
        let network = InProcessNetwork::new();
        let (a, _) = member(&network, "a").await;
        let (b, _) = member(&network, "b").await;

        let response = a
            .cluster()
            .invoke(&b.cluster().local_member(), ClusterRequest::Probe)
            .await
            .unwrap();
        assert_eq!(
            response,
            ClusterResponse::Probe(ProbeReport {
                has_capable_backend: true,
                all_users_started: false,
            })
        );
    }

    #[tokio::test]
    async fn test_start_share_drops_duplicates_elsewhere() {
        let network = InProcessNetwork::new();
        let (a, backend_a) = member(&network, "a").await;
        let (b, backend_b) = member(&network, "b").await;

        let user = PushUser::new(1, 1);
        a.registry()
            .apply_initial_listeners(vec![user.clone()], false, std::time::Duration::ZERO)
            .await;
        assert!(backend_a.is_running(&user));

        let response = a
            .cluster()
            .invoke(
                &b.cluster().local_member(),
                ClusterRequest::StartPermanentListeners {
                    users: vec![user.clone()],
                },
            )
            .await
            .unwrap();
        assert_eq!(response, ClusterResponse::Started { count: 1 });
        assert!(backend_b.is_running(&user));

        // Drop notice is sent in the background
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!backend_a.is_running(&user));
        assert!(a.registry().tracked_push_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_and_plan_requests() {
        let network = InProcessNetwork::new();
        let (a, _) = member(&network, "a").await;
        let (b, backend_b) = member(&network, "b").await;

        b.registry()
            .apply_initial_listeners(
                vec![PushUser::new(1, 1), PushUser::new(2, 1)],
                false,
                std::time::Duration::ZERO,
            )
            .await;

        let target = b.cluster().local_member();
        let response = a
            .cluster()
            .invoke(&target, ClusterRequest::StopAllPermanentListeners)
            .await
            .unwrap();
        assert_eq!(response, ClusterResponse::Stopped { count: 2 });
        assert!(backend_b.active_users().is_empty());

        let response = a
            .cluster()
            .invoke(
                &target,
                ClusterRequest::PlanReschedule {
                    reason: "test".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(response, ClusterResponse::Accepted);
        assert_eq!(b.status().await.pending_remote, Some(false));
    }
}
