//! Response classification
//!
//! Decides which responses the access layer acts on. Only an authorization
//! failure triggers the refresh-and-retry path; everything else is handed to
//! the caller untouched.

use reqwest::StatusCode;

/// What the access layer should do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx
    Success,
    /// The credential was rejected (expired or invalid access token)
    AuthorizationFailure,
    /// Any other non-2xx, not the access layer's concern
    Application,
}

/// Classify a response by HTTP status.
///
/// 403 is deliberately `Application`: the credential was accepted but the
/// user lacks permission, and a new token would not change that.
pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status == StatusCode::UNAUTHORIZED {
        ResponseClass::AuthorizationFailure
    } else {
        ResponseClass::Application
    }
}
