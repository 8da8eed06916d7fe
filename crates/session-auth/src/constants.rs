//! Fixed names shared with the API server
//!
//! The storage keys match the layout written by the web client, so a
//! credential file can be seeded from an existing browser session.

/// Storage key holding the current access token
pub const TOKEN_KEY: &str = "token";

/// Storage key holding the serialized user profile
pub const USER_KEY: &str = "user";

/// Storage key holding the persisted refresh cookie value
pub const REFRESH_COOKIE_KEY: &str = "refresh_token";

/// Cookie name the refresh endpoint reads the refresh token from
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Default refresh endpoint path, relative to the API base URL
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// JSON pointer to the new access token inside the refresh envelope
pub const TOKEN_POINTER: &str = "/data/token";
