//! Credential rotation for rate-limited, key-authenticated upstreams
//!
//! Runs caller operations through a pool of interchangeable credentials,
//! classifying failures per upstream family and rotating, cooling down or
//! retiring credentials as they fail.
//!
//! Credential lifecycle:
//! 1. Credentials are supplied at construction, status `Available`
//! 2. The engine binds one via round-robin selection and keeps it while it works
//! 3. Rate-limit failure → `RateLimited` until the cooldown passes, engine rotates
//! 4. Auth failure → `Invalid`; quota-period failure → `QuotaExceeded`; both permanent
//! 5. Cooldown passed → `Available` again, noticed lazily at the next selection
//! 6. Operators may `reset_key` a retired credential back to `Available`

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;

pub use config::{ClassifierFamily, CredentialsConfig, EngineConfig, RotationConfig};
pub use engine::{
    ClientFactory, DEFAULT_MAX_RETRIES, EngineOptions, ExecutionEngine, ResponseHeaders,
};
pub use error::{Error, ExecuteError, Result};
pub use metrics::ExecutionMetrics;
pub use pool::{Credential, CredentialPool, KeyMetadata, KeyStatus, SelectedKey, StatusCounts};
