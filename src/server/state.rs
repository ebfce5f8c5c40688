use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::cluster::ClusterService;
use crate::config::Settings;
use crate::postgres::PostgresPool;
use crate::push::PushManagerRegistry;
use crate::redis::RedisPool;
use crate::reschedule::PermanentListenerRescheduler;
use crate::shutdown::ShutdownSignal;

const RELOAD_CHANNEL_CAPACITY: usize = 8;

#[derive(Clone)]
pub struct AppState {
    /// Settings the process was started with
    pub settings: Arc<Settings>,
    pub registry: Arc<PushManagerRegistry>,
    pub rescheduler: Arc<PermanentListenerRescheduler>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<Arc<PostgresPool>>,
    /// Reloaded settings are published here
    pub reload_tx: broadcast::Sender<Arc<Settings>>,
    pub shutdown: ShutdownSignal,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        rescheduler: Arc<PermanentListenerRescheduler>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (reload_tx, _) = broadcast::channel(RELOAD_CHANNEL_CAPACITY);

        Self {
            settings: Arc::new(settings),
            registry: Arc::clone(rescheduler.registry()),
            rescheduler,
            redis_pool: None,
            postgres_pool: None,
            reload_tx,
            shutdown,
            start_time: Instant::now(),
        }
    }

    pub fn with_redis(mut self, pool: Arc<RedisPool>) -> Self {
        self.redis_pool = Some(pool);
        self
    }

    pub fn with_postgres(mut self, pool: Arc<PostgresPool>) -> Self {
        self.postgres_pool = Some(pool);
        self
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterService> {
        self.rescheduler.cluster()
    }
}
