//! Client-side sync layer
//!
//! - `api` - typed client for the HTTP surface
//! - `cache` - local identity cache
//! - `backoff` - reconnect pacing
//! - `progress` - resumable progress-stream follower
//! - `store` - the state container presentation code reads

pub mod api;
pub mod backoff;
pub mod cache;
pub mod progress;
pub mod store;

pub use api::{ApiClient, ByteStream, HttpApiClient};
pub use backoff::Backoff;
pub use cache::{FileIdentityCache, IdentityCache, MemoryIdentityCache};
pub use progress::follow_progress;
pub use store::{AuthState, ClientState, ClientSyncStore, SyncConfig};
