//! Request dispatch with bearer injection and one refresh-and-retry
//!
//! Every outbound call goes through `Dispatcher::send`. The current access
//! token is attached when there is one. A 401 sends the request through the
//! refresh coordinator once; the replay carries the new token and whatever
//! comes back is returned as-is, so a request is transmitted at most twice.
//! Requests that never see a 401 are untouched, and a request that gets no
//! response at all never triggers a refresh.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use session_auth::{Credential, CredentialStore};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::classify::{ResponseClass, classify_status};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::refresh::{RefreshCoordinator, SessionEvent};

/// Description of one outbound call.
///
/// The body is held as `Bytes` so the request can be replayed after a
/// refresh without the caller rebuilding it.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RequestSpec {
    /// `path` is resolved against the configured base URL unless absolute.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add every header from `headers`, replacing existing values.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::Request(format!("serializing JSON body: {e}")))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A fully read upstream response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Turn a non-2xx response into `Authorization` (401) or `Application`.
    pub fn error_for_status(self) -> Result<Self> {
        match classify_status(self.status) {
            ResponseClass::Success => Ok(self),
            ResponseClass::AuthorizationFailure => Err(Error::Authorization {
                status: self.status.as_u16(),
                body: self.text(),
            }),
            ResponseClass::Application => Err(Error::Application {
                status: self.status.as_u16(),
                body: self.text(),
            }),
        }
    }
}

/// Authenticated HTTP access for one session.
///
/// Cloning is cheap; clones share the HTTP client, the credential store and
/// the refresh coordinator.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    coordinator: RefreshCoordinator,
}

impl Dispatcher {
    pub fn new(store: Arc<CredentialStore>, config: ClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), store, config)
    }

    /// Build a dispatcher on an existing HTTP client. The same client is used
    /// for the refresh exchange.
    pub fn with_client(
        client: reqwest::Client,
        store: Arc<CredentialStore>,
        config: ClientConfig,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(
            store,
            client.clone(),
            config.refresh_url(),
            config.refresh_timeout,
        );
        Self {
            client,
            config: Arc::new(config),
            coordinator,
        }
    }

    /// Send a request with the current access token attached.
    ///
    /// Returns the upstream response whatever its status, except that a 401
    /// is answered by one refresh and one replay. Errors are limited to no
    /// response (`Transport`/`Timeout`), a failed refresh
    /// (`SessionTerminated`), and a request that could not be built.
    #[instrument(skip_all, fields(method = %spec.method, path = %spec.path))]
    pub async fn send(&self, spec: RequestSpec) -> Result<Response> {
        let url = self.config.url_for(&spec.path);

        let sent_with = self.coordinator.store().get().access_token().map(str::to_owned);
        let response = self
            .transmit(&spec, &url, sent_with.as_deref())
            .await
            .inspect_err(|_| metrics::record_request("transport_error"))?;

        if classify_status(response.status) != ResponseClass::AuthorizationFailure {
            metrics::record_request("ok");
            return Ok(response);
        }

        debug!("authorization failure, refreshing credential");
        let credential = match self.coordinator.refresh_stale(sent_with.as_deref()).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "session terminated while refreshing");
                metrics::record_request("terminated");
                return Err(e);
            }
        };
        let token = credential.access_token().ok_or_else(|| {
            metrics::record_request("terminated");
            Error::SessionTerminated("refresh produced no access token".into())
        })?;

        debug!("replaying request with refreshed credential");
        let replayed = self
            .transmit(&spec, &url, Some(token))
            .await
            .inspect_err(|_| metrics::record_request("transport_error"))?;
        metrics::record_request("retried");
        Ok(replayed)
    }

    /// Send, require 2xx, and decode the body as JSON.
    pub async fn send_json<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T> {
        self.send(spec).await?.error_for_status()?.json()
    }

    /// Current credential snapshot.
    pub fn credentials(&self) -> Credential {
        self.coordinator.store().get()
    }

    /// Clear the session (logout).
    pub async fn clear(&self) -> Result<()> {
        self.coordinator.logout().await
    }

    /// Subscribe to refresh and termination events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn transmit(&self, spec: &RequestSpec, url: &str, token: Option<&str>) -> Result<Response> {
        let mut headers = spec.headers.clone();
        headers.remove(AUTHORIZATION);
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Request(format!("access token is not a valid header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut request = self
            .client
            .request(spec.method.clone(), url)
            .headers(headers)
            .timeout(self.config.request_timeout);
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_builder() {
        Error::Request(e.to_string())
    } else if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Transport(e.to_string())
    }
}
