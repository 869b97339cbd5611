//! Token Endpoint Client
//!
//! [`RefreshClient`] is the seam between the interceptor and the identity
//! provider. [`HttpRefreshClient`] speaks the standard `refresh_token` grant
//! over HTTP; tests substitute their own implementations.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::config::OAuthConfig;
use crate::identity::SecretString;

/// Lifetime assumed when the endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Refresh failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// Endpoint refused the refresh token (invalid, expired or revoked)
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    #[error("session has no refresh token")]
    MissingRefreshToken,

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("refresh timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("malformed token response: {0}")]
    Malformed(String),

    /// An earlier refresh failed; the session needs re-authentication
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("credential refresh is not configured")]
    NotConfigured,
}

/// Tokens returned by a successful refresh
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    /// Rotated refresh token, if the endpoint issued one
    pub refresh_token: Option<SecretString>,
    pub expires_in: Duration,
}

/// Exchanges a refresh token for a new credential pair
#[async_trait]
pub trait RefreshClient: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, RefreshError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// `refresh_token` grant against an HTTP token endpoint
#[derive(Debug, Clone)]
pub struct HttpRefreshClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<SecretString>,
}

impl HttpRefreshClient {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<SecretString>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Build from configuration; fails if no token endpoint is configured
    pub fn from_config(config: &OAuthConfig) -> Result<Self, RefreshError> {
        let token_url = config
            .token_url
            .clone()
            .ok_or(RefreshError::NotConfigured)?;
        let client_secret = config
            .client_secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .map(SecretString::from);
        Ok(Self::new(token_url, config.client_id.clone(), client_secret))
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl RefreshClient for HttpRefreshClient {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, RefreshError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose()));
        }

        debug!(token_url = %self.token_url, "Requesting credential refresh");
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.without_url().to_string()))?;

        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            let code = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| status.to_string());
            return Err(RefreshError::Rejected(code));
        }
        if !status.is_success() {
            return Err(RefreshError::Transport(format!("token endpoint returned {}", status)));
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| RefreshError::Malformed(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(RefreshError::Malformed("empty access_token".to_string()));
        }

        Ok(TokenGrant {
            access_token: SecretString::new(parsed.access_token),
            refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()).map(SecretString::new),
            expires_in: Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
        })
    }
}

/// Client used when no token endpoint is configured; every refresh fails
#[derive(Debug, Clone, Default)]
pub struct DisabledRefreshClient;

#[async_trait]
impl RefreshClient for DisabledRefreshClient {
    async fn refresh(&self, _refresh_token: &SecretString) -> Result<TokenGrant, RefreshError> {
        Err(RefreshError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response and hand back the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    #[tokio::test]
    async fn test_successful_refresh() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"access_token":"new-access","refresh_token":"new-refresh","expires_in":120}"#,
        )
        .await;
        let client = HttpRefreshClient::new(url, "execgate", Some("s3cret".into()));

        let grant = client.refresh(&"old-refresh".into()).await.unwrap();
        assert_eq!(grant.access_token.expose(), "new-access");
        assert_eq!(grant.refresh_token.unwrap().expose(), "new-refresh");
        assert_eq!(grant.expires_in, Duration::from_secs(120));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /token"));
        assert!(request.contains("grant_type=refresh_token"));
        assert!(request.contains("refresh_token=old-refresh"));
        assert!(request.contains("client_secret=s3cret"));
    }

    #[tokio::test]
    async fn test_refresh_without_rotation() {
        let (url, _server) = serve_once("200 OK", r#"{"access_token":"a"}"#).await;
        let client = HttpRefreshClient::new(url, "execgate", None);

        let grant = client.refresh(&"r".into()).await.unwrap();
        assert!(grant.refresh_token.is_none());
        assert_eq!(grant.expires_in, Duration::from_secs(DEFAULT_EXPIRES_IN_SECS));
    }

    #[tokio::test]
    async fn test_invalid_grant_is_rejected() {
        let (url, _server) = serve_once("400 Bad Request", r#"{"error":"invalid_grant"}"#).await;
        let client = HttpRefreshClient::new(url, "execgate", None);

        let err = client.refresh(&"expired".into()).await.unwrap_err();
        assert_eq!(err, RefreshError::Rejected("invalid_grant".to_string()));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let (url, _server) = serve_once("503 Service Unavailable", "{}").await;
        let client = HttpRefreshClient::new(url, "execgate", None);

        let err = client.refresh(&"r".into()).await.unwrap_err();
        assert!(matches!(err, RefreshError::Transport(_)));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let (url, _server) = serve_once("200 OK", r#"{"token":"x"}"#).await;
        let client = HttpRefreshClient::new(url, "execgate", None);

        let err = client.refresh(&"r".into()).await.unwrap_err();
        assert!(matches!(err, RefreshError::Malformed(_)));
    }

    #[test]
    fn test_from_config_requires_token_url() {
        let err = HttpRefreshClient::from_config(&OAuthConfig::default()).unwrap_err();
        assert_eq!(err, RefreshError::NotConfigured);

        let config = OAuthConfig {
            token_url: Some("https://idp.example.com/token".to_string()),
            ..OAuthConfig::default()
        };
        let client = HttpRefreshClient::from_config(&config).unwrap();
        assert_eq!(client.token_url(), "https://idp.example.com/token");
    }

    #[tokio::test]
    async fn test_disabled_client() {
        let err = DisabledRefreshClient.refresh(&"r".into()).await.unwrap_err();
        assert_eq!(err, RefreshError::NotConfigured);
    }
}
