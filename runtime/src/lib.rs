//! # Driftsync Runtime
//!
//! The async shell around [`driftsync_engine`]: providers, background loops
//! and the [`SyncEngine`] facade.
//!
//! ## Loops
//!
//! - **Push** ([`PushLoop`]): drains the outbox in coalesced batches after
//!   the debounce window, retries transient failures with jittered backoff
//!   and parks terminal failures as `failed` ops.
//! - **Pull** ([`PullLoop`]): pages changes per table from the provider's
//!   cursor, applies them through the conflict resolver and rescans a table
//!   from a full snapshot when its cursor expires. Realtime notices trigger
//!   an early pull.
//! - **GC** ([`GcManager`]): purges expired tombstones once the provider
//!   confirms every replica has moved past them, behind a
//!   [`CircuitBreaker`].
//!
//! All three share one [`context::SyncContext`] and stop on a
//! cancellation token. Provider calls are cancelled when the engine switches
//! tenant.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use driftsync_engine::{LocalStore, Schema};
//! use driftsync_runtime::{
//!     Credential, MemoryProvider, ProviderRegistry, SyncConfig, SyncEngine,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> driftsync_runtime::Result<()> {
//! driftsync_runtime::telemetry::init_tracing();
//!
//! let registry = ProviderRegistry::new_shared();
//! registry.register(MemoryProvider::new_shared("memory"));
//!
//! let store = LocalStore::with_capture(Schema::new(1), "device-1");
//! let engine = SyncEngine::new(SyncConfig::from_env()?, store, registry);
//! engine.set_credential(Credential::new("token", "default"));
//! engine.start()?;
//!
//! engine.put("threads", "t-1", json!({"title": "Hello"}))?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Events
//!
//! [`SyncEngine::events`] hands out a broadcast receiver of [`SyncEvent`]s
//! (`sync:conflict`, `sync:retry`, `sync:error`, `sync:rescan:*`,
//! `sync:stats`, `sync:auth:*`, `sync:visibility`, `sync:unhealthy`).

pub mod auth;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod gc;
pub mod memory;
pub mod provider;
pub mod pull;
pub mod push;
pub mod registry;
pub mod telemetry;
pub mod throttle;
pub mod time;

pub use auth::{AuthGate, Credential};
pub use config::{ConfigError, SyncConfig};
pub use engine::{Health, SyncEngine, SyncEngineBuilder, Visibility};
pub use error::{ProviderError, Result, SyncError};
pub use events::{ErrorNotice, EventBus, RetryNotice, SyncEvent};
pub use gc::{CircuitBreaker, GcManager, GcReport, SkipReason};
pub use memory::{Call, MemoryProvider};
pub use provider::{
    Capabilities, ChangeNotice, ChangeSink, GcCandidate, Provider, ProviderResult, PullResponse,
    PushAck, PushRejection, PushResponse, RejectionReason, Scope, SubscriptionId, Supported,
};
pub use pull::{PullLoop, PullReport};
pub use push::{PushLoop, PushReport};
pub use registry::ProviderRegistry;
pub use throttle::{RateGovernor, RateLimit};
pub use time::{ManualTime, SystemTime, TimeSource};
