// ── Sync job scheduling ──
//
// Sync passes are never started directly: they are requested from a
// `JobScheduler`. `SyncQueue` is the in-process implementation. It keeps at
// most one pending job per (device, kind), runs jobs one at a time in the
// caller's context, retries failed passes and supports cancellation by
// handle or by group. `SyncTrigger` turns "device went Changed" events into
// write requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::PhysicalDevice;
use crate::event::{EventBus, ModelEvent, StatusTarget, SubscriptionId};
use crate::model::{DeviceId, SyncStatus};
use crate::network::Network;
use crate::sync::SyncKind;

/// Group used by jobs that [`SyncTrigger`] schedules.
pub const AUTO_SYNC_GROUP: &str = "auto-sync";

const DEFAULT_MAX_RETRIES: u32 = 2;

// ── Requests and outcomes ───────────────────────────────────────────

/// Opaque handle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobHandle(u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// How a job ended (or, for `Retrying`, that it will run again).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Succeeded,
    Failed { attempts: u32 },
    Cancelled,
    /// Not delivered to completion callbacks.
    Retrying { attempt: u32 },
}

pub type CompletionCallback = Box<dyn FnOnce(JobOutcome) + Send>;

/// A request for one sync pass.
pub struct JobRequest {
    pub description: String,
    pub device: DeviceId,
    pub kind: SyncKind,
    pub force: bool,
    pub group: Option<String>,
    pub priority: JobPriority,
    /// `None` uses the scheduler's default.
    pub max_retries: Option<u32>,
    callbacks: Vec<CompletionCallback>,
}

impl JobRequest {
    pub fn new(device: DeviceId, kind: SyncKind) -> Self {
        Self {
            description: format!("{kind} {device}"),
            device,
            kind,
            force: false,
            group: None,
            priority: JobPriority::default(),
            max_retries: None,
            callbacks: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Call `callback` once the job has finished for good.
    pub fn on_complete(mut self, callback: impl FnOnce(JobOutcome) + Send + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("description", &self.description)
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("force", &self.force)
            .field("group", &self.group)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// The scheduler collaborator sync passes are requested from.
pub trait JobScheduler {
    fn schedule(&self, request: JobRequest) -> JobHandle;

    /// Cancel a pending or running job. `false` if it is unknown or done.
    fn cancel(&self, handle: JobHandle) -> bool;

    /// Cancel every job of `group`; returns how many were affected.
    fn cancel_group(&self, group: &str) -> usize;
}

// ── SyncQueue ───────────────────────────────────────────────────────

/// Summary of a queued job, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingJob {
    pub handle: JobHandle,
    pub description: String,
    pub device: DeviceId,
    pub kind: SyncKind,
    pub priority: JobPriority,
    pub attempts: u32,
}

struct QueuedJob {
    handle: JobHandle,
    request: JobRequest,
    attempts: u32,
    order: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<QueuedJob>,
    groups: HashMap<String, CancellationToken>,
    running: Option<(JobHandle, Option<String>, CancellationToken)>,
    next_handle: u64,
    next_order: u64,
}

impl QueueState {
    fn token_for(&mut self, root: &CancellationToken, group: Option<&str>) -> CancellationToken {
        match group {
            Some(group) => self
                .groups
                .entry(group.to_owned())
                .or_insert_with(|| root.child_token())
                .child_token(),
            None => root.child_token(),
        }
    }

    fn next_order(&mut self) -> u64 {
        self.next_order += 1;
        self.next_order
    }

    /// Index of the job to run next: highest priority, then oldest.
    fn pick(&self) -> Option<usize> {
        self.jobs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.request
                    .priority
                    .cmp(&b.request.priority)
                    .then(b.order.cmp(&a.order))
            })
            .map(|(i, _)| i)
    }
}

/// Totals of a [`SyncQueue::run_pending`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retried: usize,
}

/// Single-flight queue of device sync jobs.
pub struct SyncQueue {
    state: Mutex<QueueState>,
    root: CancellationToken,
    default_max_retries: u32,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl SyncQueue {
    pub fn new(default_max_retries: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            root: CancellationToken::new(),
            default_max_retries,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().jobs.is_empty()
    }

    /// Queued jobs in the order they would run.
    pub fn pending(&self) -> Vec<PendingJob> {
        let state = self.state();
        let mut jobs: Vec<&QueuedJob> = state.jobs.iter().collect();
        jobs.sort_by(|a, b| {
            b.request
                .priority
                .cmp(&a.request.priority)
                .then(a.order.cmp(&b.order))
        });
        jobs.into_iter()
            .map(|job| PendingJob {
                handle: job.handle,
                description: job.request.description.clone(),
                device: job.request.device,
                kind: job.request.kind,
                priority: job.request.priority,
                attempts: job.attempts,
            })
            .collect()
    }

    /// Queue `request`, folding it into a pending job for the same device
    /// and kind if there is one.
    fn enqueue(&self, mut request: JobRequest, attempts: u32, handle: Option<JobHandle>) -> JobHandle {
        let mut state = self.state();
        if let Some(existing) = state
            .jobs
            .iter_mut()
            .find(|j| j.request.device == request.device && j.request.kind == request.kind)
        {
            existing.request.priority = existing.request.priority.max(request.priority);
            existing.request.force |= request.force;
            existing.request.callbacks.append(&mut request.callbacks);
            existing.attempts = existing.attempts.max(attempts);
            debug!(handle = %existing.handle, description = %request.description, "sync job merged");
            return existing.handle;
        }

        let handle = handle.unwrap_or_else(|| {
            state.next_handle += 1;
            JobHandle(state.next_handle)
        });
        let token = state.token_for(&self.root, request.group.as_deref());
        let order = state.next_order();
        debug!(%handle, description = %request.description, priority = %request.priority, "sync job queued");
        state.jobs.push(QueuedJob {
            handle,
            request,
            attempts,
            order,
            token,
        });
        handle
    }

    /// Run the next queued job. `None` when the queue is empty.
    pub async fn run_next<D: PhysicalDevice>(
        &self,
        network: &mut Network,
        driver: &D,
    ) -> Option<(JobHandle, JobOutcome)> {
        let job = {
            let mut state = self.state();
            let index = state.pick()?;
            let job = state.jobs.remove(index);
            state.running = Some((job.handle, job.request.group.clone(), job.token.clone()));
            job
        };
        let QueuedJob {
            handle,
            mut request,
            attempts,
            token,
            ..
        } = job;

        let outcome = if token.is_cancelled() {
            JobOutcome::Cancelled
        } else {
            debug!(%handle, description = %request.description, "sync job started");
            let result = network
                .sync_device(request.device, request.kind, driver, &token, request.force)
                .await;
            match result {
                Ok(true) => JobOutcome::Succeeded,
                Ok(false) if token.is_cancelled() => JobOutcome::Cancelled,
                Ok(false) => {
                    let attempt = attempts + 1;
                    let limit = request.max_retries.unwrap_or(self.default_max_retries);
                    if attempt <= limit {
                        JobOutcome::Retrying { attempt }
                    } else {
                        JobOutcome::Failed { attempts: attempt }
                    }
                }
                Err(error) => {
                    warn!(%handle, %error, "sync job cannot run");
                    JobOutcome::Failed {
                        attempts: attempts + 1,
                    }
                }
            }
        };
        self.state().running = None;

        match outcome {
            JobOutcome::Retrying { attempt } => {
                debug!(%handle, attempt, "sync job will be retried");
                self.enqueue(request, attempt, Some(handle));
            }
            JobOutcome::Succeeded => {
                debug!(%handle, "sync job succeeded");
                finish(std::mem::take(&mut request.callbacks), outcome);
            }
            JobOutcome::Failed { attempts } => {
                warn!(%handle, attempts, description = %request.description, "sync job failed");
                finish(std::mem::take(&mut request.callbacks), outcome);
            }
            JobOutcome::Cancelled => {
                debug!(%handle, "sync job cancelled");
                finish(std::mem::take(&mut request.callbacks), outcome);
            }
        }
        Some((handle, outcome))
    }

    /// Run jobs until the queue is empty, retries included.
    pub async fn run_pending<D: PhysicalDevice>(&self, network: &mut Network, driver: &D) -> RunSummary {
        let mut summary = RunSummary::default();
        while let Some((_, outcome)) = self.run_next(network, driver).await {
            match outcome {
                JobOutcome::Succeeded => summary.succeeded += 1,
                JobOutcome::Failed { .. } => summary.failed += 1,
                JobOutcome::Cancelled => summary.cancelled += 1,
                JobOutcome::Retrying { .. } => summary.retried += 1,
            }
        }
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            retried = summary.retried,
            "sync queue drained"
        );
        summary
    }

    /// Cancel everything, pending and running.
    pub fn cancel_all(&self) -> usize {
        let (removed, running) = {
            let mut state = self.state();
            let removed: Vec<QueuedJob> = state.jobs.drain(..).collect();
            let running = state.running.as_ref().map(|(_, _, token)| token.clone());
            (removed, running)
        };
        let count = removed.len() + usize::from(running.is_some());
        if let Some(token) = running {
            token.cancel();
        }
        for job in removed {
            finish(job.request.callbacks, JobOutcome::Cancelled);
        }
        count
    }
}

impl JobScheduler for SyncQueue {
    fn schedule(&self, request: JobRequest) -> JobHandle {
        self.enqueue(request, 0, None)
    }

    fn cancel(&self, handle: JobHandle) -> bool {
        let removed = {
            let mut state = self.state();
            if let Some((running, _, token)) = &state.running {
                if *running == handle {
                    token.cancel();
                    return true;
                }
            }
            let Some(index) = state.jobs.iter().position(|j| j.handle == handle) else {
                return false;
            };
            state.jobs.remove(index)
        };
        debug!(%handle, "sync job cancelled before running");
        finish(removed.request.callbacks, JobOutcome::Cancelled);
        true
    }

    fn cancel_group(&self, group: &str) -> usize {
        let (removed, running) = {
            let mut state = self.state();
            if let Some(token) = state.groups.remove(group) {
                token.cancel();
            }
            let (removed, kept): (Vec<QueuedJob>, Vec<QueuedJob>) = state
                .jobs
                .drain(..)
                .partition(|j| j.request.group.as_deref() == Some(group));
            state.jobs = kept;
            let running = state
                .running
                .as_ref()
                .is_some_and(|(_, g, _)| g.as_deref() == Some(group));
            (removed, running)
        };
        let count = removed.len() + usize::from(running);
        for job in removed {
            finish(job.request.callbacks, JobOutcome::Cancelled);
        }
        info!(group, count, "sync group cancelled");
        count
    }
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("pending", &self.len())
            .field("default_max_retries", &self.default_max_retries)
            .finish()
    }
}

fn finish(callbacks: Vec<CompletionCallback>, outcome: JobOutcome) {
    for callback in callbacks {
        callback(outcome);
    }
}

// ── SyncTrigger ─────────────────────────────────────────────────────

/// Schedules a write whenever a device's aggregate status turns Changed.
pub struct SyncTrigger {
    bus: EventBus,
    subscription: SubscriptionId,
}

impl SyncTrigger {
    pub fn attach<S>(bus: &EventBus, scheduler: Arc<S>) -> Self
    where
        S: JobScheduler + Send + Sync + 'static,
    {
        let subscription = bus.subscribe(move |envelope| {
            if let ModelEvent::StatusChanged {
                target: StatusTarget::Device(device),
                new: SyncStatus::Changed,
                ..
            } = envelope.event
            {
                scheduler.schedule(
                    JobRequest::new(device, SyncKind::Write)
                        .in_group(AUTO_SYNC_GROUP)
                        .with_description(format!("write pending edits to {device}")),
                );
            }
        });
        Self {
            bus: bus.clone(),
            subscription,
        }
    }
}

impl Drop for SyncTrigger {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

impl fmt::Debug for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTrigger").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceKind, LinkRecord};
    use crate::sim::{SimulatedDevice, SimulatedNetwork};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(n: u8) -> DeviceId {
        DeviceId::new([0x70, 0x00, n])
    }

    fn setup() -> (Network, SimulatedNetwork) {
        let mut net = Network::new(id(0));
        let sim = SimulatedNetwork::default();
        sim.insert(id(0), SimulatedDevice::hub());
        for n in 1..=3 {
            net.add_device(id(n), DeviceKind::Relay).unwrap();
            sim.insert(id(n), SimulatedDevice::new());
        }
        (net, sim)
    }

    #[test]
    fn same_device_and_kind_is_single_flight() {
        let queue = SyncQueue::default();
        let a = queue.schedule(JobRequest::new(id(1), SyncKind::Read));
        let b = queue.schedule(JobRequest::new(id(1), SyncKind::Read).with_priority(JobPriority::High));
        let c = queue.schedule(JobRequest::new(id(1), SyncKind::Write));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending()[0].priority, JobPriority::High);
    }

    #[tokio::test]
    async fn runs_by_priority_then_fifo() {
        let (mut net, sim) = setup();
        let queue = SyncQueue::default();
        let low = queue.schedule(JobRequest::new(id(1), SyncKind::Read).with_priority(JobPriority::Low));
        let first = queue.schedule(JobRequest::new(id(2), SyncKind::Read));
        let second = queue.schedule(JobRequest::new(id(3), SyncKind::Read));

        let mut order = Vec::new();
        while let Some((handle, outcome)) = queue.run_next(&mut net, &sim).await {
            assert_eq!(outcome, JobOutcome::Succeeded);
            order.push(handle);
        }
        assert_eq!(order, vec![first, second, low]);
    }

    #[tokio::test]
    async fn failing_jobs_retry_then_fail() {
        let (mut net, sim) = setup();
        sim.set_reachable(id(1), false);
        let queue = SyncQueue::new(2);
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        queue.schedule(JobRequest::new(id(1), SyncKind::Read).on_complete(move |outcome| {
            assert_eq!(outcome, JobOutcome::Failed { attempts: 3 });
            seen.fetch_add(1, Ordering::Relaxed);
        }));

        let summary = queue.run_pending(&mut net, &sim).await;
        assert_eq!(summary.retried, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancelling_a_group_skips_its_jobs() {
        let (mut net, sim) = setup();
        let queue = SyncQueue::default();
        let cancelled = Arc::new(AtomicUsize::new(0));
        for n in 1..=2 {
            let counter = Arc::clone(&cancelled);
            queue.schedule(
                JobRequest::new(id(n), SyncKind::Read)
                    .in_group("nightly")
                    .on_complete(move |outcome| {
                        if outcome == JobOutcome::Cancelled {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }),
            );
        }
        let other = queue.schedule(JobRequest::new(id(3), SyncKind::Read));

        assert_eq!(queue.cancel_group("nightly"), 2);
        assert_eq!(cancelled.load(Ordering::Relaxed), 2);
        let summary = queue.run_pending(&mut net, &sim).await;
        assert_eq!(summary.succeeded, 1);
        assert!(!queue.cancel(other));

        // The group accepts new work afterwards.
        queue.schedule(JobRequest::new(id(1), SyncKind::Read).in_group("nightly"));
        assert_eq!(queue.run_pending(&mut net, &sim).await.succeeded, 1);
    }

    #[tokio::test]
    async fn trigger_schedules_writes_for_changed_devices() {
        let (mut net, sim) = setup();
        let queue = Arc::new(SyncQueue::default());
        let _trigger = SyncTrigger::attach(net.bus(), Arc::clone(&queue));

        net.device_mut(id(2))
            .unwrap()
            .with_links(|t| t.add_record(LinkRecord::responder(id(0), 1, [0xFF, 0, 1])));
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].device, id(2));
        assert_eq!(pending[0].kind, SyncKind::Write);

        let summary = queue.run_pending(&mut net, &sim).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(sim.links(id(2)).len(), 1);
        assert_eq!(net.device(id(2)).unwrap().links().status(), SyncStatus::Synced);
    }
}
