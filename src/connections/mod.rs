//! Per-user OAuth connections to data-source services
//!
//! - `model` - connection state machine and token status
//! - `vault` - sealed credential storage behind opaque handles
//! - `provider` - OAuth provider seam (HTTP and loopback implementations)
//! - `store` - connection persistence seam
//! - `manager` - grant, refresh (single-flight), revoke, sweep
//! - `health` - per-service and aggregate health

pub mod error;
pub mod health;
pub mod manager;
pub mod model;
pub mod provider;
pub mod store;
pub mod vault;

pub use error::ConnectionError;
pub use health::{ConnectionHealthReport, OverallHealth, ServiceHealth};
pub use manager::{
    spawn_connection_sweep_task, ConnectionConfig, ConnectionLifecycleManager, GrantOutcome,
    ProviderCallback, SweepReport,
};
pub use model::{ConnectionKey, ConnectionStatus, ServiceConnection, ServiceName, TokenStatus};
pub use provider::{
    HttpOAuthProvider, LoopbackProvider, OAuthClientConfig, OAuthProvider, ProviderError,
    ProviderProfile, ProviderRegistry, TokenGrant,
};
pub use store::{ConnectionMutation, ConnectionStore, InMemoryConnectionStore};
pub use vault::{CredentialHandle, CredentialVault};
