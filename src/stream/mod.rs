//! Stream delivery
//!
//! Two transports are fed by every running job:
//!
//! - the content-delta stream, an ordered and non-resumable sequence of
//!   [`StreamEvent`]s ending with a completion marker or an error
//! - the progress stream, cumulative [`ProgressSnapshot`]s as named events
//!   (`progress`, `complete`, `error`); any emission is enough to catch up
//!
//! The two are independent; nothing ties the position of one to the other.

pub mod event;
pub mod hub;
pub mod sse;
pub mod subscription;

pub use event::{ProgressEvent, ProgressSnapshot, StreamEvent, StreamEventType, COMPLETION_MARKER};
pub use hub::{JobChannel, StreamHub};
pub use sse::{sse_body, SseFrame, SseParser};
pub use subscription::{DeltaSubscription, ProgressSubscription};
