//! Cancellable subscription handles
//!
//! Both handles yield a finite sequence: it ends after the first terminal
//! event, after `unsubscribe`, or when the job channel goes away.

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::warn;
use uuid::Uuid;

use super::event::{ProgressEvent, ProgressSnapshot, StreamEvent};

/// Content-delta subscription. Not resumable: events missed while not
/// subscribed are gone.
pub struct DeltaSubscription {
    job_id: Uuid,
    receiver: Option<broadcast::Receiver<StreamEvent>>,
}

impl DeltaSubscription {
    pub(crate) fn new(job_id: Uuid, receiver: broadcast::Receiver<StreamEvent>) -> Self {
        Self {
            job_id,
            receiver: Some(receiver),
        }
    }

    /// A subscription to a stream that has already terminated
    pub(crate) fn closed(job_id: Uuid) -> Self {
        Self {
            job_id,
            receiver: None,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn is_open(&self) -> bool {
        self.receiver.is_some()
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(event) => {
                if event.is_terminal() {
                    self.receiver = None;
                }
                Some(event)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(job_id = %self.job_id, skipped, "Delta subscriber fell behind");
                self.receiver = None;
                Some(StreamEvent::error("stream fell behind"))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                None
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }

    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        stream::unfold(self, |mut sub| async move { sub.next().await.map(|e| (e, sub)) }).boxed()
    }
}

enum ProgressSource {
    Live {
        receiver: watch::Receiver<ProgressSnapshot>,
        primed: bool,
    },
    Settled(Option<ProgressSnapshot>),
    Done,
}

/// Progress subscription. The first `next` yields the current snapshot, so a
/// reconnecting client is caught up immediately.
pub struct ProgressSubscription {
    source: ProgressSource,
}

impl ProgressSubscription {
    pub(crate) fn live(receiver: watch::Receiver<ProgressSnapshot>) -> Self {
        Self {
            source: ProgressSource::Live {
                receiver,
                primed: false,
            },
        }
    }

    /// One final snapshot of a job whose channel is already retired
    pub fn settled(snapshot: ProgressSnapshot) -> Self {
        Self {
            source: ProgressSource::Settled(Some(snapshot)),
        }
    }

    pub async fn next(&mut self) -> Option<ProgressEvent> {
        let snapshot = match &mut self.source {
            ProgressSource::Live { receiver, primed } => {
                if *primed {
                    if receiver.changed().await.is_err() {
                        self.source = ProgressSource::Done;
                        return None;
                    }
                } else {
                    *primed = true;
                }
                receiver.borrow_and_update().clone()
            }
            ProgressSource::Settled(snapshot) => snapshot.take()?,
            ProgressSource::Done => return None,
        };

        let event = ProgressEvent::for_snapshot(snapshot);
        if event.is_terminal() {
            self.source = ProgressSource::Done;
        }
        Some(event)
    }

    pub fn unsubscribe(&mut self) {
        self.source = ProgressSource::Done;
    }

    pub fn into_stream(self) -> BoxStream<'static, ProgressEvent> {
        stream::unfold(self, |mut sub| async move { sub.next().await.map(|e| (e, sub)) }).boxed()
    }
}
