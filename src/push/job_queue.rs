//! Job queue for permanent listeners.
//!
//! The queue owns the process-local bookkeeping of running permanent
//! listeners: it asks a backend to start a listener and records the resulting
//! job, and it forgets (cancels) jobs on stop. A push user has at most one
//! job per process regardless of how many extended backends are registered.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::backend::{BackendError, PushBackend};
use super::types::{PermanentListenerJob, PushUser};

/// Contract of the permanent listener job queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Start a permanent listener for the user on the given backend.
    ///
    /// Returns `None` if the backend cannot run permanent listeners, declined
    /// to start one, or a job for the user is already running.
    async fn schedule_job(
        &self,
        push_user: &PushUser,
        backend: &PushBackend,
    ) -> Result<Option<PermanentListenerJob>, BackendError>;

    /// Cancel and forget the job of a push user. Returns whether one existed.
    fn cancel_job(&self, push_user: &PushUser) -> bool;

    /// The running job of a push user, if any
    fn job(&self, push_user: &PushUser) -> Option<PermanentListenerJob>;

    /// All running jobs, sorted
    fn jobs(&self) -> Vec<PermanentListenerJob>;
}

/// In-process job queue backed by `DashMap`
#[derive(Default)]
pub struct LocalJobQueue {
    jobs: DashMap<PushUser, PermanentListenerJob>,
    /// Users whose start is in flight; guards against concurrent double starts
    starting: DashSet<PushUser>,
}

impl LocalJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Releases an in-flight start reservation when dropped
struct StartReservation<'a> {
    starting: &'a DashSet<PushUser>,
    push_user: PushUser,
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.push_user);
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn schedule_job(
        &self,
        push_user: &PushUser,
        backend: &PushBackend,
    ) -> Result<Option<PermanentListenerJob>, BackendError> {
        let Some(capability) = backend.permanent_capability() else {
            return Ok(None);
        };

        if self.jobs.contains_key(push_user) || !self.starting.insert(push_user.clone()) {
            tracing::trace!(
                push_user = %push_user,
                backend = %backend.id(),
                "Permanent listener already running or starting"
            );
            return Ok(None);
        }
        let _reservation = StartReservation {
            starting: &self.starting,
            push_user: push_user.clone(),
        };

        let service = Arc::clone(&capability.service);
        if !service.start_permanent_listener(push_user).await? {
            return Ok(None);
        }

        let job = PermanentListenerJob::new(push_user.clone(), backend.id());
        self.jobs.insert(push_user.clone(), job.clone());

        tracing::debug!(
            push_user = %push_user,
            backend = %backend.id(),
            "Permanent listener job scheduled"
        );

        Ok(Some(job))
    }

    fn cancel_job(&self, push_user: &PushUser) -> bool {
        match self.jobs.remove(push_user) {
            Some((_, job)) => {
                job.cancel();
                tracing::debug!(
                    push_user = %push_user,
                    backend = %job.backend_id(),
                    "Permanent listener job cancelled"
                );
                true
            }
            None => false,
        }
    }

    fn job(&self, push_user: &PushUser) -> Option<PermanentListenerJob> {
        self.jobs.get(push_user).map(|j| j.clone())
    }

    fn jobs(&self) -> Vec<PermanentListenerJob> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort();
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::MemoryPushBackend;

    #[tokio::test]
    async fn test_schedule_job_once_per_user() {
        let queue = LocalJobQueue::new();
        let first = MemoryPushBackend::new("first").descriptor();
        let second = MemoryPushBackend::new("second").descriptor();
        let user = PushUser::new(1, 1);

        let job = queue.schedule_job(&user, &first).await.unwrap();
        assert_eq!(job.unwrap().backend_id(), "first");

        // Second backend must not start a duplicate listener
        let job = queue.schedule_job(&user, &second).await.unwrap();
        assert!(job.is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_basic_backend_is_skipped() {
        let queue = LocalJobQueue::new();
        let backend = MemoryPushBackend::basic("basic").descriptor();

        let job = queue.schedule_job(&PushUser::new(1, 1), &backend).await.unwrap();
        assert!(job.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_job_marks_cancelled() {
        let queue = LocalJobQueue::new();
        let backend = MemoryPushBackend::new("mem").descriptor();
        let user = PushUser::new(2, 1);

        let job = queue.schedule_job(&user, &backend).await.unwrap().unwrap();
        assert!(queue.cancel_job(&user));
        assert!(job.is_cancelled());
        assert!(!queue.cancel_job(&user));
        assert!(queue.job(&user).is_none());
    }

    #[tokio::test]
    async fn test_jobs_are_sorted() {
        let queue = LocalJobQueue::new();
        let backend = MemoryPushBackend::new("mem").descriptor();
        for (user, ctx) in [(5, 2), (1, 3), (9, 1)] {
            queue.schedule_job(&PushUser::new(user, ctx), &backend).await.unwrap();
        }

        let users: Vec<_> = queue.jobs().iter().map(|j| j.push_user().clone()).collect();
        assert_eq!(
            users,
            vec![PushUser::new(9, 1), PushUser::new(5, 2), PushUser::new(1, 3)]
        );
    }
}
