//! Request Pipeline
//!
//! Issues authenticated calls against the backend, renewing the access token
//! once on an unauthorized answer and retrying the original call once.

use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{TokenStore, UserRecord};
use crate::config::Config;
use crate::error::{RequestError, Result};
use crate::http::response::RawResponse;
use crate::models::{list_items, AuthResponse, LoginRequest, RefreshRequest, RefreshResponse};

// == Endpoints ==
/// Token renewal endpoint, relative to the base URL
pub const REFRESH_PATH: &str = "/auth/token/refresh/";
pub const LOGIN_PATH: &str = "/auth/login/";
pub const LOGOUT_PATH: &str = "/auth/logout/";

/// Where a logical request stands in the renewal protocol.
///
/// `Initial --401--> (refreshing) --> Retried --401--> AuthExpired`.
/// The refresh itself is the awaited step between the two states, so one
/// logical request can never reach a second refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    Initial,
    Retried,
}

// == Request Pipeline ==
/// Authenticated HTTP client for the backend API.
pub struct RequestPipeline {
    http: Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    /// Single-flight guard: concurrent 401s queue here and reuse the first renewal
    refresh_gate: Mutex<()>,
}

impl RequestPipeline {
    // == Constructors ==
    /// Creates a pipeline with a client built from the configuration.
    pub fn new(config: &Config, tokens: Arc<TokenStore>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(format!("campus-sync/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(&config.api_base_url, http, tokens))
    }

    /// Creates a pipeline around an existing reqwest client.
    pub fn with_client(base_url: &str, http: Client, tokens: Arc<TokenStore>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Absolute URL of a path relative to the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    // == Request ==
    /// Performs one logical request and decodes the success body.
    ///
    /// # Errors
    /// - `Network` when no response was received (never retried here)
    /// - `AuthExpired` when the credentials could not be renewed
    /// - `Api` for any other non-success answer
    /// - `Decode` when the success body does not match `T`
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        self.execute(method, path, body.as_ref()).await?.decode()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(serde_json::to_value(body)?)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PUT, path, Some(serde_json::to_value(body)?)).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PATCH, path, Some(serde_json::to_value(body)?)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::DELETE, path, None).await
    }

    /// GET a list endpoint, accepting bare arrays and paginated envelopes.
    pub async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let payload: Value = self.get(path).await?;
        list_items(payload)
    }

    async fn execute(&self, method: Method, path: &str, body: Option<&Value>) -> Result<RawResponse> {
        let url = self.url(path);
        let mut phase = AuthPhase::Initial;

        loop {
            let sent_with = self.tokens.access_token();
            let response = self.send(method.clone(), &url, body, sent_with.as_deref()).await?;

            if !response.is_unauthorized() {
                if response.status.is_success() {
                    return Ok(response);
                }
                debug!("{} {} failed with status {}", method, path, response.status);
                return Err(response.into_api_error());
            }

            phase = match phase {
                AuthPhase::Initial => {
                    debug!("{} {} unauthorized, renewing access token", method, path);
                    self.renew_access(sent_with.as_deref()).await?;
                    AuthPhase::Retried
                }
                AuthPhase::Retried => {
                    warn!("{} {} still unauthorized after renewal", method, path);
                    self.tokens.clear();
                    return Err(RequestError::AuthExpired);
                }
            };
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        access: Option<&str>,
    ) -> Result<RawResponse> {
        let mut req = self
            .http
            .request(method, url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = access {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| RequestError::Network(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| RequestError::Network(e.to_string()))?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }

    // == Token Renewal ==
    /// Makes sure the store holds an access token newer than `stale`.
    ///
    /// Runs at most one refresh call at a time. A caller that queued behind a
    /// renewal which already replaced `stale` returns without calling the
    /// endpoint; one that queued behind a failed renewal finds the store
    /// cleared and fails too.
    async fn renew_access(&self, stale: Option<&str>) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        let Some(pair) = self.tokens.get() else {
            info!("No refresh token available");
            self.tokens.clear();
            return Err(RequestError::AuthExpired);
        };

        if stale != Some(pair.access.as_str()) {
            debug!("Access token already renewed by a concurrent request");
            return Ok(());
        }

        info!("Refreshing access token");
        let body = serde_json::to_value(RefreshRequest {
            refresh: &pair.refresh,
        })?;
        let outcome = self
            .send(Method::POST, &self.url(REFRESH_PATH), Some(&body), None)
            .await;

        let failure = match outcome {
            Ok(resp) if resp.status.is_success() => {
                let renewed = resp.decode::<RefreshResponse>().unwrap_or_default();
                match renewed.access() {
                    Some(access) => {
                        let rotated = renewed.refresh().map(str::to_string);
                        self.tokens.set(pair.renewed(access.to_string(), rotated));
                        info!("Access token refreshed");
                        return Ok(());
                    }
                    None => "response carried no access token".to_string(),
                }
            }
            Ok(resp) => format!("rejected with status {}", resp.status),
            Err(e) => e.to_string(),
        };

        warn!("Token refresh failed: {}", failure);
        self.tokens.clear();
        Err(RequestError::AuthExpired)
    }

    // == Session ==
    /// Signs in and stores the new session.
    ///
    /// Sent without credentials and outside the renewal protocol, so a 401
    /// here is reported as an `Api` error (bad email or password).
    pub async fn login(&self, credentials: &LoginRequest) -> Result<Option<UserRecord>> {
        let body = serde_json::to_value(credentials)?;
        let resp = self
            .send(Method::POST, &self.url(LOGIN_PATH), Some(&body), None)
            .await?;
        if !resp.status.is_success() {
            return Err(resp.into_api_error());
        }

        let auth: AuthResponse = resp.decode()?;
        let pair = auth
            .credentials()
            .ok_or_else(|| RequestError::Decode("login response is missing tokens".to_string()))?;

        self.tokens.set_session(pair, auth.user.clone());
        info!("Signed in as {}", auth.user.as_ref().map_or("<unknown>", |u| u.email.as_str()));
        Ok(auth.user)
    }

    /// Signs out on the server (best effort) and always clears credentials.
    ///
    /// Sent once with the current access token; an expired token is not
    /// refreshed just to be thrown away.
    pub async fn logout(&self) -> Result<()> {
        let outcome = match self.tokens.access_token() {
            Some(access) => {
                let body = serde_json::json!({});
                match self
                    .send(Method::POST, &self.url(LOGOUT_PATH), Some(&body), Some(access.as_str()))
                    .await
                {
                    Ok(resp) if resp.status.is_success() => Ok(()),
                    Ok(resp) => Err(resp.into_api_error()),
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };

        if let Err(e) = &outcome {
            warn!("Server logout failed, clearing local session anyway: {}", e);
        }
        self.tokens.clear();
        outcome
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("base_url", &self.base_url)
            .field("tokens", &self.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialPair;

    fn pipeline(base: &str) -> RequestPipeline {
        RequestPipeline::with_client(base, Client::new(), Arc::new(TokenStore::in_memory()))
    }

    #[test]
    fn test_url_joining() {
        let p = pipeline("http://school.local/api/");
        assert_eq!(p.url("/students/"), "http://school.local/api/students/");
        assert_eq!(p.url("students/1/"), "http://school.local/api/students/1/");
    }

    #[tokio::test]
    async fn test_network_error_is_not_retried() {
        // Port 9 (discard) on localhost is closed in test environments
        let p = pipeline("http://127.0.0.1:9");
        p.tokens().set(CredentialPair::new("a", "r"));

        let result: Result<Value> = p.get("/students/").await;
        assert!(matches!(result, Err(RequestError::Network(_))));
        // Credentials untouched by transport failures
        assert!(p.tokens().get().is_some());
    }

    #[tokio::test]
    async fn test_logout_without_session_is_ok() {
        let p = pipeline("http://127.0.0.1:9");
        assert!(p.logout().await.is_ok());
        assert!(p.tokens().get().is_none());
    }
}
