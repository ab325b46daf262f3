//! Per-job stream channels
//!
//! Each running job owns a [`JobChannel`]: a broadcast sender for content
//! deltas and a watch cell holding the latest progress snapshot. The hub maps
//! job ids to channels and retires them some time after the job settles.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

use super::event::{ProgressSnapshot, StreamEvent};
use super::subscription::{DeltaSubscription, ProgressSubscription};
use crate::jobs::GenerationJob;

pub struct JobChannel {
    job_id: Uuid,
    deltas: broadcast::Sender<StreamEvent>,
    /// Set once a terminal delta has been published
    deltas_closed: Mutex<bool>,
    progress: watch::Sender<ProgressSnapshot>,
}

impl JobChannel {
    fn new(snapshot: ProgressSnapshot, buffer: usize) -> Self {
        let (deltas, _) = broadcast::channel(buffer.max(1));
        let (progress, _) = watch::channel(snapshot.clone());
        Self {
            job_id: snapshot.job_id,
            deltas,
            deltas_closed: Mutex::new(false),
            progress,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Publish a delta event. Returns false once the stream has terminated.
    pub fn publish(&self, event: StreamEvent) -> bool {
        let mut closed = self
            .deltas_closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *closed {
            return false;
        }
        if event.is_terminal() {
            *closed = true;
        }
        // No subscribers is fine; deltas are not retained
        let _ = self.deltas.send(event);
        true
    }

    pub fn subscribe_deltas(&self) -> DeltaSubscription {
        let closed = self
            .deltas_closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *closed {
            DeltaSubscription::closed(self.job_id)
        } else {
            DeltaSubscription::new(self.job_id, self.deltas.subscribe())
        }
    }

    pub fn delta_subscribers(&self) -> usize {
        self.deltas.receiver_count()
    }

    /// Replace the progress snapshot.
    ///
    /// Progress never moves backwards and a terminal snapshot is final.
    /// Returns false when the update was dropped.
    pub fn publish_progress(&self, snapshot: ProgressSnapshot) -> bool {
        self.progress.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            let sequence = current.sequence + 1;
            let floor = current.progress;
            *current = snapshot;
            current.progress = current.progress.max(floor);
            current.sequence = sequence;
            true
        })
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.progress.borrow().is_terminal()
    }

    pub fn subscribe_progress(&self) -> ProgressSubscription {
        ProgressSubscription::live(self.progress.subscribe())
    }
}

pub struct StreamHub {
    channels: DashMap<Uuid, Arc<JobChannel>>,
    buffer: usize,
    retention: Duration,
}

impl StreamHub {
    pub fn new(buffer: usize, retention: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            buffer,
            retention,
        }
    }

    /// Open the channel for a freshly created job
    pub fn open(&self, job: &GenerationJob) -> Arc<JobChannel> {
        let channel = Arc::new(JobChannel::new(
            ProgressSnapshot::from_job(job),
            self.buffer,
        ));
        self.channels.insert(job.id, Arc::clone(&channel));
        channel
    }

    pub fn get(&self, job_id: Uuid) -> Option<Arc<JobChannel>> {
        self.channels.get(&job_id).map(|c| Arc::clone(c.value()))
    }

    pub fn remove(&self, job_id: Uuid) -> Option<Arc<JobChannel>> {
        self.channels.remove(&job_id).map(|(_, channel)| channel)
    }

    /// Drop the channel once the retention window has passed
    pub fn retire_later(self: &Arc<Self>, job_id: Uuid) {
        let hub = Arc::clone(self);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if hub.remove(job_id).is_some() {
                debug!(job_id = %job_id, "Stream channel retired");
            }
        });
    }

    /// Channels whose job is still running
    pub fn active(&self) -> usize {
        self.channels.iter().filter(|c| !c.is_settled()).count()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
