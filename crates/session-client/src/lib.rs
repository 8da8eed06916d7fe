//! Authenticated HTTP access layer
//!
//! Attaches the session's access token to outbound requests, notices when the
//! server rejects it, and runs one coordinated refresh no matter how many
//! requests were rejected at once. Every rejected request is replayed once
//! with the refreshed token. When the refresh itself fails the credentials
//! are cleared and every affected caller gets `Error::SessionTerminated`.
//!
//! Request lifecycle:
//! 1. `Dispatcher::send` reads the credential store and attaches `Bearer <token>`
//! 2. Non-401 responses and transport errors go straight back to the caller
//! 3. A 401 calls `RefreshCoordinator::refresh_stale`; concurrent callers share one exchange
//! 4. The request is replayed once with the new token and that response is returned
//! 5. A failed refresh clears the store and publishes `SessionEvent::Terminated`

pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod error;
mod metrics;
pub mod refresh;

pub use classify::{ResponseClass, classify_status};
pub use config::ClientConfig;
pub use dispatcher::{Dispatcher, RequestSpec, Response};
pub use error::{Error, Result};
pub use refresh::{RefreshCoordinator, SessionEvent};
pub use session_auth::{Credential, CredentialStore};
