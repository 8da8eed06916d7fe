//! Refresh token exchange
//!
//! The refresh endpoint takes no body. The refresh token travels as a cookie
//! and the new access token comes back inside a JSON envelope at `data.token`.
//! If the server rotates the refresh cookie, the new value is returned so the
//! caller can persist it.

use std::time::Duration;

use reqwest::header::{COOKIE, HeaderMap, HeaderValue, SET_COOKIE};
use serde_json::Value;

use crate::constants::{REFRESH_COOKIE_NAME, TOKEN_POINTER};
use crate::error::{Error, Result};

/// Outcome of a successful refresh exchange.
#[derive(Debug)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Set when the response rotated the refresh cookie
    pub refresh_token: Option<String>,
}

/// Exchange a refresh token for a new access token.
///
/// `timeout` bounds the whole exchange including the body read. A missing
/// response, an elapsed deadline, a non-2xx status and an envelope without
/// `data.token` are all errors; the caller decides what they mean for the
/// session.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<RefreshedToken> {
    let cookie = HeaderValue::from_str(&format!("{REFRESH_COOKIE_NAME}={refresh}"))
        .map_err(|e| Error::Http(format!("refresh token is not a valid cookie value: {e}")))?;

    let response = client
        .post(endpoint)
        .header(COOKIE, cookie)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let rotated = rotated_refresh_cookie(response.headers());

    let envelope: Value = response
        .json()
        .await
        .map_err(|e| Error::InvalidResponse(format!("refresh body is not JSON: {e}")))?;

    let access_token = envelope
        .pointer(TOKEN_POINTER)
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::InvalidResponse(format!("missing {TOKEN_POINTER} in envelope")))?
        .to_string();

    Ok(RefreshedToken {
        access_token,
        refresh_token: rotated,
    })
}

/// Find a rotated refresh cookie among the response's `Set-Cookie` headers.
fn rotated_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            (name.trim() == REFRESH_COOKIE_NAME).then(|| value.trim().to_string())
        })
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn endpoint(server: &MockServer) -> String {
        format!("{}/auth/refresh", server.uri())
    }

    #[tokio::test]
    async fn returns_token_from_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(header("cookie", "refresh_token=rt_1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"token": "at_2"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let refreshed = refresh_access_token(&client, &endpoint(&server), "rt_1", TIMEOUT)
            .await
            .unwrap();

        assert_eq!(refreshed.access_token, "at_2");
        assert!(refreshed.refresh_token.is_none());
    }

    #[tokio::test]
    async fn picks_up_rotated_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "theme=dark; Path=/")
                    .append_header("set-cookie", "refresh_token=rt_2; HttpOnly; Path=/")
                    .set_body_json(serde_json::json!({"data": {"token": "at_2"}})),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let refreshed = refresh_access_token(&client, &endpoint(&server), "rt_1", TIMEOUT)
            .await
            .unwrap();

        assert_eq!(refreshed.refresh_token.as_deref(), Some("rt_2"));
    }

    #[tokio::test]
    async fn rejected_refresh_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string("refresh expired"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = refresh_access_token(&client, &endpoint(&server), "rt_old", TIMEOUT)
            .await
            .unwrap_err();

        match err {
            Error::Rejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "refresh expired");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn envelope_without_token_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = refresh_access_token(&client, &endpoint(&server), "rt_1", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_endpoint_hits_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(serde_json::json!({"data": {"token": "at_2"}})),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = refresh_access_token(
            &client,
            &endpoint(&server),
            "rt_1",
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_http_error() {
        let client = reqwest::Client::new();
        let err = refresh_access_token(&client, "http://127.0.0.1:1/auth/refresh", "rt_1", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
    }

    #[test]
    fn rotated_cookie_ignores_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("session=abc; Path=/"));
        assert_eq!(rotated_refresh_cookie(&headers), None);

        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("refresh_token=rt_9; Max-Age=604800"),
        );
        assert_eq!(rotated_refresh_cookie(&headers).as_deref(), Some("rt_9"));
    }

    #[test]
    fn cleared_cookie_is_not_a_rotation() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("refresh_token=; Max-Age=0"),
        );
        assert_eq!(rotated_refresh_cookie(&headers), None);
    }
}
