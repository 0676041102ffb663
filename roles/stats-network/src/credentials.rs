//! Authorization for the network API.
//!
//! The network API wants a bearer token. It either comes straight from configuration
//! or is obtained by logging in, and then has to be refreshed before it expires.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::sources::RetryPolicy;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("login failed: {0}")]
    Login(String),

    #[error("login response did not contain a token")]
    MissingToken,

    #[error("token is not a valid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Headers to attach to every authenticated request.
    async fn auth_headers(&self) -> Result<HeaderMap, CredentialError>;
}

fn bearer(token: &str) -> Result<HeaderMap, CredentialError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
    Ok(headers)
}

/// A fixed token from configuration. Without a token no Authorization header is sent.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn auth_headers(&self) -> Result<HeaderMap, CredentialError> {
        match &self.token {
            Some(token) => bearer(token),
            None => Ok(HeaderMap::new()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    user_name: &'a str,
    password: &'a str,
    two_factor_code: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

/// Logs in with username and password and caches the resulting token.
pub struct LoginTokenProvider {
    client: reqwest::Client,
    login_url: String,
    username: String,
    password: String,
    policy: RetryPolicy,
    token: RwLock<Option<String>>,
}

impl LoginTokenProvider {
    pub fn new(
        client: reqwest::Client,
        network_base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            login_url: format!("{}/Auth/Login", network_base_url.trim_end_matches('/')),
            username: username.into(),
            password: password.into(),
            policy,
            token: RwLock::new(None),
        }
    }

    /// Log in again and replace the cached token.
    pub async fn refresh(&self) -> Result<String, CredentialError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        let token = loop {
            match self.login().await {
                Ok(token) => break token,
                Err(LoginAttempt::Retry(reason)) if attempt < max_attempts => {
                    warn!(
                        "Login attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, max_attempts, reason, self.policy.backoff_delay
                    );
                    tokio::time::sleep(self.policy.backoff_delay).await;
                    attempt += 1;
                }
                Err(LoginAttempt::Retry(reason)) => return Err(CredentialError::Login(reason)),
                Err(LoginAttempt::Fatal(e)) => return Err(e),
            }
        };

        *self.token.write().await = Some(token.clone());
        info!("Network API token refreshed");
        Ok(token)
    }

    async fn login(&self) -> Result<String, LoginAttempt> {
        let response = self
            .client
            .post(&self.login_url)
            .json(&LoginRequest {
                user_name: &self.username,
                password: &self.password,
                two_factor_code: "",
            })
            .send()
            .await
            .map_err(|e| LoginAttempt::Retry(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LoginAttempt::Retry(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoginAttempt::Fatal(CredentialError::Login(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            ))));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| LoginAttempt::Fatal(CredentialError::Login(e.to_string())))?;

        body.token
            .filter(|t| !t.is_empty())
            .ok_or(LoginAttempt::Fatal(CredentialError::MissingToken))
    }

    /// Refresh the token every `interval` until `shutdown` flips to true.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the first token is fetched lazily
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            error!("Failed to refresh network API token: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Token refresh loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

enum LoginAttempt {
    Retry(String),
    Fatal(CredentialError),
}

#[async_trait::async_trait]
impl CredentialProvider for LoginTokenProvider {
    async fn auth_headers(&self) -> Result<HeaderMap, CredentialError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return bearer(token);
        }
        let token = self.refresh().await?;
        bearer(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str) -> LoginTokenProvider {
        LoginTokenProvider::new(
            reqwest::Client::new(),
            base_url,
            "miner@example.com",
            "hunter2",
            RetryPolicy {
                max_attempts: 3,
                backoff_delay: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn test_static_token() {
        let headers = StaticTokenProvider::new(Some("abc".into())).auth_headers().await.unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");

        let empty = StaticTokenProvider::default().auth_headers().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_login_once_then_cached() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Auth/Login"))
            .and(body_json(json!({
                "userName": "miner@example.com",
                "password": "hunter2",
                "twoFactorCode": ""
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok-1" })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = provider(&mock_server.uri());
        for _ in 0..3 {
            let headers = provider.auth_headers().await.unwrap();
            assert_eq!(headers[AUTHORIZATION], "Bearer tok-1");
        }
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Auth/Login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server.uri()).auth_headers().await.unwrap_err();
        assert!(matches!(err, CredentialError::Login(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_login_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Auth/Login"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server.uri()).refresh().await.unwrap_err();
        assert!(matches!(err, CredentialError::Login(msg) if msg.contains("429")));
    }

    #[tokio::test]
    async fn test_login_retries_server_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Auth/Login"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server.uri()).refresh().await.unwrap_err();
        assert!(matches!(err, CredentialError::Login(_)));
    }

    #[tokio::test]
    async fn test_missing_token_in_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Auth/Login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": false })))
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server.uri()).refresh().await.unwrap_err();
        assert!(matches!(err, CredentialError::MissingToken));
    }
}
