//! Redis-backed cluster.
//!
//! Membership: every member refreshes `{prefix}:cluster:member:{id}` (its
//! JSON description, with a TTL) and adds its id to the set
//! `{prefix}:cluster:members`. Members whose key expired are pruned from the
//! set by whoever notices first.
//!
//! Requests: a request is published to `{prefix}:cluster:rpc:{target_id}`
//! and answered on `{prefix}:cluster:reply:{sender_id}`, correlated by id. A
//! publish that reaches no subscriber means the target has left.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::metrics::ClusterMetrics;
use crate::redis::{PoolError, ReconnectBackoff, RedisPool};
use crate::shutdown::ShutdownSignal;

use super::traits::{ClusterRequestHandler, ClusterService};
use super::types::{
    ClusterBackend, ClusterRequest, ClusterResponse, Member, MembershipEvent, RemoteCallError,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct RpcEnvelope {
    correlation_id: Uuid,
    from: Member,
    request: ClusterRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcReply {
    correlation_id: Uuid,
    result: Result<ClusterResponse, RemoteCallError>,
}

/// Removes a pending reply slot when the waiting call completes or is dropped
struct PendingGuard<'a> {
    pending: &'a DashMap<Uuid, oneshot::Sender<RpcReply>>,
    correlation_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct RedisCluster {
    pool: Arc<RedisPool>,
    config: ClusterConfig,
    member: Member,
    key_prefix: String,
    members: DashMap<Uuid, Member>,
    events: broadcast::Sender<MembershipEvent>,
    handler: OnceLock<Weak<dyn ClusterRequestHandler>>,
    pending: DashMap<Uuid, oneshot::Sender<RpcReply>>,
    shutdown: ShutdownSignal,
}

impl RedisCluster {
    /// Join the cluster: publish the first heartbeat, load the membership and
    /// spawn the heartbeat and subscriber tasks.
    pub async fn start(
        pool: Arc<RedisPool>,
        config: ClusterConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, PoolError> {
        let member = Member::new(config.node_name.clone(), config.advertise_socket_addr());
        let key_prefix = format!("{}:cluster", pool.key_prefix());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let cluster = Arc::new(Self {
            pool,
            config,
            member: member.clone(),
            key_prefix,
            members: DashMap::new(),
            events,
            handler: OnceLock::new(),
            pending: DashMap::new(),
            shutdown,
        });
        cluster.members.insert(member.id, member.clone());

        cluster.heartbeat().await?;
        cluster.refresh_members().await?;

        tokio::spawn(Arc::clone(&cluster).run_heartbeat());
        tokio::spawn(Arc::clone(&cluster).run_subscriber());

        tracing::info!(
            member = %member,
            member_id = %member.id,
            members = cluster.members.len(),
            "Joined Redis cluster"
        );

        Ok(cluster)
    }

    fn members_key(&self) -> String {
        format!("{}:members", self.key_prefix)
    }

    fn member_key(&self, id: Uuid) -> String {
        format!("{}:member:{}", self.key_prefix, id)
    }

    fn rpc_channel(&self, id: Uuid) -> String {
        format!("{}:rpc:{}", self.key_prefix, id)
    }

    fn reply_channel(&self, id: Uuid) -> String {
        format!("{}:reply:{}", self.key_prefix, id)
    }

    async fn heartbeat(&self) -> Result<(), PoolError> {
        let payload = serde_json::to_string(&self.member)
            .map_err(|e| PoolError::ConnectionUnavailable(e.to_string()))?;
        let member_key = self.member_key(self.member.id);
        let members_key = self.members_key();
        let ttl = member_ttl(&self.config).as_secs();
        let id = self.member.id.to_string();

        self.pool
            .execute(|mut conn| async move {
                redis::pipe()
                    .set_ex(&member_key, payload, ttl)
                    .ignore()
                    .sadd(&members_key, id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await
    }

    /// Reload the membership and emit events for the differences
    async fn refresh_members(&self) -> Result<(), PoolError> {
        let members_key = self.members_key();
        let raw_ids: Vec<String> = self
            .pool
            .execute(|mut conn| async move { conn.smembers(&members_key).await })
            .await?;

        let mut expired = Vec::new();
        let mut ids = Vec::with_capacity(raw_ids.len());
        for raw in raw_ids {
            match Uuid::parse_str(&raw) {
                Ok(id) => ids.push(id),
                Err(_) => expired.push(raw),
            }
        }

        let keys: Vec<String> = ids.iter().map(|id| self.member_key(*id)).collect();
        let values: Vec<Option<String>> = if keys.is_empty() {
            Vec::new()
        } else {
            self.pool
                .execute(|mut conn| async move {
                    redis::cmd("MGET").arg(&keys).query_async(&mut conn).await
                })
                .await?
        };

        let mut current: HashMap<Uuid, Member> = HashMap::new();
        for (id, value) in ids.into_iter().zip(values) {
            match value.and_then(|v| serde_json::from_str::<Member>(&v).ok()) {
                Some(member) => {
                    current.insert(member.id, member);
                }
                None => expired.push(id.to_string()),
            }
        }
        current.insert(self.member.id, self.member.clone());

        if !expired.is_empty() {
            let members_key = self.members_key();
            let _ = self
                .pool
                .execute(|mut conn| async move { conn.srem::<_, _, ()>(&members_key, expired).await })
                .await;
        }

        let removed: Vec<Member> = self
            .members
            .iter()
            .filter(|e| !current.contains_key(e.key()))
            .map(|e| e.value().clone())
            .collect();
        for member in removed {
            self.members.remove(&member.id);
            ClusterMetrics::record_member_removed();
            tracing::info!(member = %member, "Cluster member removed");
            let _ = self.events.send(MembershipEvent::Removed(member));
        }

        for (id, member) in current {
            if self.members.insert(id, member.clone()).is_none() {
                ClusterMetrics::record_member_added();
                tracing::info!(member = %member, "Cluster member added");
                let _ = self.events.send(MembershipEvent::Added(member));
            }
        }

        ClusterMetrics::set_members(self.members.len());
        Ok(())
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Cluster heartbeat task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        tracing::warn!(error = %e, "Failed to publish cluster heartbeat");
                        continue;
                    }
                    if let Err(e) = self.refresh_members().await {
                        tracing::warn!(error = %e, "Failed to refresh cluster members");
                    }
                }
            }
        }
    }

    /// Run the request/reply subscriber with automatic reconnection
    async fn run_subscriber(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = ReconnectBackoff::default();

        loop {
            match self.subscription_loop(&mut shutdown, &mut backoff).await {
                Ok(()) => {
                    tracing::info!("Cluster subscriber stopped gracefully");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        error = %e,
                        retry_delay_ms = delay.as_millis(),
                        "Cluster subscription error, reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown requested during reconnect delay");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn subscription_loop(
        self: &Arc<Self>,
        shutdown: &mut broadcast::Receiver<()>,
        backoff: &mut ReconnectBackoff,
    ) -> Result<(), PoolError> {
        let mut pubsub = self.pool.client().get_async_pubsub().await?;
        let rpc_channel = self.rpc_channel(self.member.id);
        let reply_channel = self.reply_channel(self.member.id);

        pubsub.subscribe(&rpc_channel).await?;
        pubsub.subscribe(&reply_channel).await?;
        backoff.reset();

        tracing::info!(
            rpc_channel = %rpc_channel,
            reply_channel = %reply_channel,
            "Subscribed to cluster channels"
        );

        let mut messages = pubsub.on_message();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    return Ok(());
                }

                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Err(PoolError::ConnectionUnavailable(
                            "cluster message stream ended".to_string(),
                        ));
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to get cluster message payload");
                            continue;
                        }
                    };

                    if msg.get_channel_name() == reply_channel {
                        self.dispatch_reply(&payload);
                    } else {
                        let cluster = Arc::clone(self);
                        tokio::spawn(async move { cluster.serve_request(&payload).await });
                    }
                }
            }
        }
    }

    fn dispatch_reply(&self, payload: &str) {
        let reply: RpcReply = match serde_json::from_str(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse cluster reply");
                return;
            }
        };
        match self.pending.remove(&reply.correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => {
                tracing::debug!(
                    correlation_id = %reply.correlation_id,
                    "Dropping reply for abandoned call"
                );
            }
        }
    }

    async fn serve_request(&self, payload: &str) {
        let envelope: RpcEnvelope = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse cluster request");
                return;
            }
        };

        tracing::debug!(
            from = %envelope.from,
            request = envelope.request.kind(),
            "Received cluster request"
        );

        let result = self.handle_locally(&envelope.from, envelope.request).await;
        let reply = RpcReply {
            correlation_id: envelope.correlation_id,
            result,
        };
        let payload = match serde_json::to_string(&reply) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize cluster reply");
                return;
            }
        };

        let channel = self.reply_channel(envelope.from.id);
        if let Err(e) = self
            .pool
            .execute(|mut conn| async move { conn.publish::<_, _, i64>(&channel, payload).await })
            .await
        {
            tracing::warn!(error = %e, to = %envelope.from, "Failed to publish cluster reply");
        }
    }

    async fn handle_locally(
        &self,
        from: &Member,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, RemoteCallError> {
        let handler = self
            .handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| RemoteCallError::Transport("no request handler installed".to_string()))?;
        handler
            .handle_request(from, request)
            .await
            .map_err(RemoteCallError::Handler)
    }
}

#[async_trait]
impl ClusterService for RedisCluster {
    fn local_member(&self) -> Member {
        self.member.clone()
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<_> = self.members.iter().map(|e| e.value().clone()).collect();
        members.sort_by(|a, b| a.cmp_rank(b));
        members
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn set_request_handler(&self, handler: Weak<dyn ClusterRequestHandler>) {
        if self.handler.set(handler).is_err() {
            tracing::warn!("Cluster request handler already set");
        }
    }

    async fn invoke(
        &self,
        target: &Member,
        request: ClusterRequest,
    ) -> Result<ClusterResponse, RemoteCallError> {
        if target.id == self.member.id {
            return self.handle_locally(&self.member, request).await;
        }
        if !self.members.contains_key(&target.id) {
            return Err(RemoteCallError::MemberLeft);
        }

        let correlation_id = Uuid::new_v4();
        let envelope = RpcEnvelope {
            correlation_id,
            from: self.member.clone(),
            request,
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| RemoteCallError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        let channel = self.rpc_channel(target.id);
        let receivers: i64 = self
            .pool
            .execute(|mut conn| async move { conn.publish(&channel, payload).await })
            .await
            .map_err(|e| RemoteCallError::Transport(e.to_string()))?;
        if receivers == 0 {
            return Err(RemoteCallError::MemberLeft);
        }

        match rx.await {
            Ok(reply) => reply.result,
            Err(_) => Err(RemoteCallError::Transport("reply channel closed".to_string())),
        }
    }

    fn backend_type(&self) -> ClusterBackend {
        ClusterBackend::Redis
    }

    async fn leave(&self) {
        let member_key = self.member_key(self.member.id);
        let members_key = self.members_key();
        let id = self.member.id.to_string();

        let result: Result<(), PoolError> = self
            .pool
            .execute(|mut conn| async move {
                redis::pipe()
                    .del(&member_key)
                    .ignore()
                    .srem(&members_key, id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await;

        match result {
            Ok(()) => tracing::info!(member = %self.member, "Left Redis cluster"),
            Err(e) => tracing::warn!(error = %e, "Failed to leave Redis cluster cleanly"),
        }
    }
}

/// Heartbeat TTL, at least two heartbeat intervals
fn member_ttl(config: &ClusterConfig) -> Duration {
    let min = config.heartbeat_interval() * 2;
    Duration::from_secs(config.member_ttl_seconds).max(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_wire_format() {
        let reply = RpcReply {
            correlation_id: Uuid::nil(),
            result: Err(RemoteCallError::Timeout),
        };
        let json = serde_json::to_string(&reply).unwrap();
        let parsed: RpcReply = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.result, Err(RemoteCallError::Timeout));

        let reply = RpcReply {
            correlation_id: Uuid::nil(),
            result: Ok(ClusterResponse::Accepted),
        };
        let parsed: RpcReply = serde_json::from_str(&serde_json::to_string(&reply).unwrap()).unwrap();
        assert_eq!(parsed.result, Ok(ClusterResponse::Accepted));
    }

    #[test]
    fn test_member_ttl_covers_two_heartbeats() {
        let config = ClusterConfig {
            heartbeat_interval_seconds: 10,
            member_ttl_seconds: 5,
            ..Default::default()
        };
        assert_eq!(member_ttl(&config), Duration::from_secs(20));
    }
}
