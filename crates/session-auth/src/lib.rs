//! Session credential storage and refresh exchange
//!
//! Holds the access token, refresh token and user profile for one session,
//! mirrors them to a durable key-value file, and performs the HTTP exchange
//! that trades the refresh token for a new access token. Coordination of
//! concurrent refreshes lives in `session-client`; this crate only knows how
//! to store a credential and how to ask the server for a new one.
//!
//! Credential flow:
//! 1. Login installs tokens via `CredentialStore::login()`
//! 2. Requests read `CredentialStore::get()` and attach the access token
//! 3. On a 401, `token::refresh_access_token()` exchanges the refresh cookie
//! 4. The new token is written with `CredentialStore::set()`
//! 5. A failed exchange ends the session with `CredentialStore::clear()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use token::{RefreshedToken, refresh_access_token};
