// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! Bounded-concurrency file uploads.
//!
//! [`UploadCoordinator`] turns each submitted file into an [`UploadTask`] and
//! admits waiting tasks in submission order whenever a slot is free. At most
//! `max_concurrent_uploads` tasks are ever in the
//! [`Uploading`][UploadStatus::Uploading] state.
//!
//! ```text
//!            submit / retry
//!                  │
//!                  ▼
//!   cancel ◄── Queued ──admit──► Uploading ──ok──► Completed ──retention──► pruned
//!     │                             │    │
//!     │              cancel (abort) │    └──err──► Failed ──retry──► Queued
//!     ▼                             ▼                │
//!  Canceled ◄───────────────────────┴────── cancel ──┘
//! ```
//!
//! Canceled tasks are dropped from the task table immediately; completed
//! tasks stay queryable for `completed_retention_ms` so observers can read
//! their final state. Failed tasks stay until they are retried or canceled.
//!
//! State changes are published to an [`UploadObserver`] after the
//! coordinator's own state is updated, never while its lock is held.

use crate::{
    Error,
    settings::UploadConfig,
    transport::{Progress, ProgressFn, Response, Transport, UploadFile, UploadHandle, start_upload},
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Identifier of an upload task, unique for the coordinator's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(String);

impl UploadId {
    pub fn new(id: impl Into<String>) -> Self {
        UploadId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of upload ids.
pub trait IdGenerator: Send + Sync {
    /// Returns an id never returned before by this generator.
    fn next_id(&self) -> UploadId;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> UploadId {
        UploadId(Uuid::new_v4().to_string())
    }
}

/// Monotonic `<prefix>-<n>` ids starting at 1.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        SequentialIds {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        SequentialIds::new("upload")
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> UploadId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        UploadId(format!("{}-{}", self.prefix, n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
    Canceled,
}

impl UploadStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, UploadStatus::Queued | UploadStatus::Uploading)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Canceled => "canceled",
        };
        f.write_str(status)
    }
}

/// Snapshot of one file's upload.
#[derive(Debug, Clone)]
pub struct UploadTask {
    id: UploadId,
    file: UploadFile,
    status: UploadStatus,
    progress: u8,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    attempts: u32,
    error: Option<String>,
    response: Option<Response>,
    handle: Option<UploadHandle>,
    order: u64,
}

impl UploadTask {
    fn new(id: UploadId, file: UploadFile, order: u64) -> Self {
        UploadTask {
            id,
            file,
            status: UploadStatus::Queued,
            progress: 0,
            started_at: None,
            finished_at: None,
            attempts: 0,
            error: None,
            response: None,
            handle: None,
            order,
        }
    }

    pub fn id(&self) -> &UploadId {
        &self.id
    }

    pub fn file(&self) -> &UploadFile {
        &self.file
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    /// Percentage in `0..=100`.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Start of the current attempt.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Number of times the task has been admitted.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Failure message of the last attempt, if it failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Server response of a completed upload.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }
}

/// Notification published by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Progress { id: UploadId, percent: u8 },
    Status { id: UploadId, status: UploadStatus },
}

/// Receives upload progress and status changes. Both methods default to
/// doing nothing.
///
/// Progress is never published for a task after it was canceled or
/// completed. Progress and terminal status notifications are delivered one
/// at a time, so callbacks must not call back into the coordinator.
pub trait UploadObserver: Send + Sync {
    fn on_progress(&self, _id: &UploadId, _percent: u8) {}

    fn on_status(&self, _id: &UploadId, _status: UploadStatus) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

/// Forwards every notification as an [`UploadEvent`] over an unbounded
/// channel. Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelObserver { tx }, rx)
    }
}

impl UploadObserver for ChannelObserver {
    fn on_progress(&self, id: &UploadId, percent: u8) {
        let _ = self.tx.send(UploadEvent::Progress {
            id: id.clone(),
            percent,
        });
    }

    fn on_status(&self, id: &UploadId, status: UploadStatus) {
        let _ = self.tx.send(UploadEvent::Status {
            id: id.clone(),
            status,
        });
    }
}

#[derive(Debug, Default)]
struct State {
    tasks: HashMap<UploadId, UploadTask>,
    waiting: VecDeque<UploadId>,
    active: usize,
    next_order: u64,
}

impl State {
    fn is_idle(&self) -> bool {
        self.active == 0 && self.waiting.is_empty()
    }
}

type StatusEvents = Vec<(UploadId, UploadStatus)>;

/// Schedules file uploads with bounded concurrency.
///
/// Cheap to clone; clones share the same task table. Submitting, retrying and
/// canceling must happen inside a Tokio runtime since admitted uploads are
/// driven by spawned tasks.
///
/// # Examples
///
/// ```rust,no_run
/// use courier_client::{HttpTransport, UploadConfig, UploadCoordinator, UploadFile};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), courier_client::Error> {
/// let uploads = UploadCoordinator::new(Arc::new(HttpTransport::new()?), UploadConfig::default())
///     .with_base_url("https://chat.example")?;
///
/// let ids = uploads.submit(vec![UploadFile::from_path("photo.jpg")?]);
/// uploads.wait_idle().await;
///
/// for task in uploads.tasks() {
///     println!("{} {} {}%", task.id(), task.status(), task.progress());
/// }
/// # let _ = ids;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UploadCoordinator {
    state: Arc<Mutex<State>>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn UploadObserver>,
    ids: Arc<dyn IdGenerator>,
    config: Arc<UploadConfig>,
    endpoint: String,
    idle: Arc<Notify>,
    // orders progress against terminal status notifications
    delivery: Arc<Mutex<()>>,
}

impl fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("UploadCoordinator")
            .field("endpoint", &self.endpoint)
            .field("max_concurrent_uploads", &self.max_concurrent())
            .field("tasks", &state.tasks.len())
            .field("active", &state.active)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl UploadCoordinator {
    /// Creates a coordinator posting to `config.endpoint` as given.
    /// Use [`with_base_url`](Self::with_base_url) for relative endpoints.
    pub fn new(transport: Arc<dyn Transport>, config: UploadConfig) -> Self {
        debug!(
            "Upload coordinator - endpoint={}, max_concurrent_uploads={}",
            config.endpoint, config.max_concurrent_uploads
        );
        UploadCoordinator {
            state: Arc::default(),
            transport,
            observer: Arc::new(NoopObserver),
            ids: Arc::new(UuidGenerator),
            endpoint: config.endpoint.clone(),
            config: Arc::new(config),
            idle: Arc::default(),
            delivery: Arc::default(),
        }
    }

    /// Resolves a relative upload endpoint against `base_url`.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, Error> {
        let base = url::Url::parse(base_url)?;
        self.endpoint = crate::gateway::resolve_endpoint(Some(&base), &self.config.endpoint)?;
        Ok(self)
    }

    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn max_concurrent(&self) -> usize {
        self.config.max_concurrent_uploads.max(1)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: StatusEvents) {
        for (id, status) in events {
            self.observer.on_status(&id, status);
        }
    }

    /// Accepts `files`, one task each, and starts as many as capacity allows.
    /// Returns the new task ids in submission order.
    pub fn submit(&self, files: Vec<UploadFile>) -> Vec<UploadId> {
        let ids: Vec<UploadId> = {
            let mut state = self.lock();
            files
                .into_iter()
                .map(|file| {
                    let id = self.ids.next_id();
                    debug!("Queued upload {} ({})", id, file.name());
                    let order = state.next_order;
                    state.next_order += 1;
                    state
                        .tasks
                        .insert(id.clone(), UploadTask::new(id.clone(), file, order));
                    state.waiting.push_back(id.clone());
                    id
                })
                .collect()
        };

        self.publish(
            ids.iter()
                .map(|id| (id.clone(), UploadStatus::Queued))
                .collect(),
        );
        self.admit_next();
        ids
    }

    /// Starts waiting tasks, oldest first, until every slot is taken or no
    /// task waits. Safe to call at any time.
    fn admit_next(&self) {
        let mut admitted = Vec::new();
        {
            let mut state = self.lock();
            while state.active < self.max_concurrent() {
                let Some(id) = state.waiting.pop_front() else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if task.status != UploadStatus::Queued {
                    continue;
                }

                task.status = UploadStatus::Uploading;
                task.progress = 0;
                task.attempts += 1;
                task.started_at = Some(Utc::now());
                task.finished_at = None;
                task.error = None;

                let attempt = task.attempts;
                let (handle, exchange) = start_upload(
                    self.transport.as_ref(),
                    task.file.clone(),
                    self.endpoint.clone(),
                    self.progress_fn(id.clone(), attempt),
                );
                task.handle = Some(handle);
                state.active += 1;

                debug!(
                    "Admitted upload {} (attempt {}, {} active)",
                    id, attempt, state.active
                );
                admitted.push((id, attempt, exchange));
            }
        }

        for (id, attempt, exchange) in admitted {
            self.observer.on_status(&id, UploadStatus::Uploading);
            tokio::spawn(self.clone().drive(id, attempt, exchange));
        }
    }

    fn progress_fn(&self, id: UploadId, attempt: u32) -> ProgressFn {
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let delivery = self.delivery.clone();
        let observer = self.observer.clone();

        Arc::new(move |progress: Progress| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let percent = progress.percent();
            let _delivery = delivery.lock().unwrap_or_else(PoisonError::into_inner);
            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match state.tasks.get_mut(&id) {
                    Some(task)
                        if task.status == UploadStatus::Uploading && task.attempts == attempt =>
                    {
                        task.progress = percent;
                    }
                    _ => return,
                }
            }
            observer.on_progress(&id, percent);
        })
    }

    #[cfg_attr(feature = "profiling", tracing::instrument(skip(self, exchange)))]
    async fn drive(
        self,
        id: UploadId,
        attempt: u32,
        exchange: BoxFuture<'static, Result<Response, Error>>,
    ) {
        let outcome = exchange.await;
        self.finish(&id, attempt, outcome);
    }

    /// Records the outcome of attempt `attempt` of `id`, frees its slot and
    /// admits the next waiting task. Outcomes of canceled or superseded
    /// attempts are ignored.
    fn finish(&self, id: &UploadId, attempt: u32, outcome: Result<Response, Error>) {
        let delivery = self.delivery();
        let (status, idle) = {
            let mut state = self.lock();
            let Some(task) = state.tasks.get_mut(id) else {
                debug!("Dropping outcome of removed upload {}", id);
                return;
            };
            if task.status != UploadStatus::Uploading || task.attempts != attempt {
                debug!("Dropping stale outcome of upload {} attempt {}", id, attempt);
                return;
            }

            task.handle = None;
            task.finished_at = Some(Utc::now());
            match outcome {
                Ok(response) => {
                    task.status = UploadStatus::Completed;
                    task.progress = 100;
                    task.response = Some(response);
                    debug!("Upload {} completed", id);
                }
                Err(err) => {
                    task.status = UploadStatus::Failed;
                    let err = Error::Upload(format!("{}: {}", task.file.name(), err));
                    warn!("Upload {} failed: {}", id, err);
                    task.error = Some(err.to_string());
                }
            }
            let status = task.status;
            state.active -= 1;
            (status, state.is_idle())
        };

        self.observer.on_status(id, status);
        drop(delivery);

        if status == UploadStatus::Completed {
            self.schedule_prune(id.clone(), attempt);
        }
        self.admit_next();
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn schedule_prune(&self, id: UploadId, attempt: u32) {
        let state = Arc::downgrade(&self.state);
        let retention = self.config.completed_retention();

        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let completed = state.tasks.get(&id).is_some_and(|task| {
                task.status == UploadStatus::Completed && task.attempts == attempt
            });
            if completed {
                state.tasks.remove(&id);
                debug!("Pruned completed upload {}", id);
            }
        });
    }

    /// Cancels a queued, uploading or failed task and drops it from the task
    /// table. An uploading task is aborted and its slot goes to the next
    /// waiting task before this returns.
    pub fn cancel(&self, id: &UploadId) -> Result<(), Error> {
        let delivery = self.delivery();
        let (handle, idle) = {
            let mut state = self.lock();
            let status = state
                .tasks
                .get(id)
                .map(UploadTask::status)
                .ok_or_else(|| Error::UnknownUpload(id.clone()))?;

            let mut handle = None;
            match status {
                UploadStatus::Uploading => {
                    handle = state.tasks.get_mut(id).and_then(|t| t.handle.take());
                    state.active -= 1;
                }
                UploadStatus::Queued => state.waiting.retain(|waiting| waiting != id),
                UploadStatus::Failed => {}
                UploadStatus::Completed | UploadStatus::Canceled => {
                    return Err(Error::InvalidUploadState {
                        id: id.clone(),
                        status,
                    });
                }
            }
            state.tasks.remove(id);
            debug!("Canceled upload {} while {}", id, status);
            (handle, state.is_idle())
        };
        self.observer.on_status(id, UploadStatus::Canceled);
        drop(delivery);

        if let Some(handle) = handle {
            handle.abort();
        }
        self.admit_next();
        if idle {
            self.idle.notify_waiters();
        }
        Ok(())
    }

    /// Cancels every queued and uploading task. Failed and completed tasks
    /// are left alone. Returns how many tasks were canceled.
    pub fn cancel_all(&self) -> usize {
        let delivery = self.delivery();
        let (canceled, handles) = {
            let mut state = self.lock();
            let mut canceled: Vec<UploadId> = state.waiting.drain(..).collect();
            let mut handles = Vec::new();
            for task in state.tasks.values_mut() {
                if task.status == UploadStatus::Uploading {
                    handles.extend(task.handle.take());
                    canceled.push(task.id.clone());
                }
            }
            for id in &canceled {
                state.tasks.remove(id);
            }
            state.active = 0;
            (canceled, handles)
        };

        if !canceled.is_empty() {
            debug!("Canceled {} upload(s)", canceled.len());
        }
        let count = canceled.len();
        self.publish(
            canceled
                .into_iter()
                .map(|id| (id, UploadStatus::Canceled))
                .collect(),
        );
        drop(delivery);

        for handle in handles {
            handle.abort();
        }
        self.idle.notify_waiters();
        count
    }

    /// Puts a failed task back in the waiting list with its progress reset.
    pub fn retry(&self, id: &UploadId) -> Result<(), Error> {
        {
            let mut state = self.lock();
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| Error::UnknownUpload(id.clone()))?;
            if task.status != UploadStatus::Failed {
                return Err(Error::InvalidUploadState {
                    id: id.clone(),
                    status: task.status,
                });
            }

            task.status = UploadStatus::Queued;
            task.progress = 0;
            task.error = None;
            task.started_at = None;
            task.finished_at = None;
            state.waiting.push_back(id.clone());
            debug!("Retrying upload {}", id);
        }

        self.observer.on_status(id, UploadStatus::Queued);
        self.admit_next();
        Ok(())
    }

    pub fn task(&self, id: &UploadId) -> Option<UploadTask> {
        self.lock().tasks.get(id).cloned()
    }

    /// Every tracked task in submission order.
    pub fn tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.order);
        tasks
    }

    /// Number of tasks currently uploading.
    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Number of tasks waiting for a slot.
    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Resolves once no task is queued or uploading.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
