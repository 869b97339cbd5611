//! Refresh Interceptor
//!
//! Wraps an operation that needs a valid bearer credential. Expired
//! credentials are refreshed before the call; an unauthorized result triggers
//! one refresh and exactly one retry. Concurrent callers on the same session
//! share a single refresh call.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{RefreshClient, RefreshError};
use super::config::OAuthConfig;
use super::session::{RefreshState, Session};
use crate::error::GatewayError;
use crate::identity::CredentialPair;

/// What a wrapped operation reports back
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished (successfully or not) with no authorization problem
    Completed(T),
    /// Downstream rejected the credential
    Unauthorized(T),
}

/// Credential-refreshing wrapper
#[derive(Clone)]
pub struct OAuthInterceptor {
    client: Arc<dyn RefreshClient>,
    refresh_timeout: Duration,
    expiry_skew: Duration,
}

impl std::fmt::Debug for OAuthInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthInterceptor")
            .field("refresh_timeout", &self.refresh_timeout)
            .field("expiry_skew", &self.expiry_skew)
            .finish_non_exhaustive()
    }
}

impl OAuthInterceptor {
    pub fn new(client: Arc<dyn RefreshClient>) -> Self {
        Self::with_config(client, &OAuthConfig::default())
    }

    pub fn with_config(client: Arc<dyn RefreshClient>, config: &OAuthConfig) -> Self {
        Self {
            client,
            refresh_timeout: config.refresh_timeout(),
            expiry_skew: config.expiry_skew(),
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    /// Run `op` with a valid credential for `session`
    ///
    /// `op` is invoked at most twice. An `Unauthorized` result after a
    /// refresh already happened in this call is returned as is.
    pub async fn call<T, F, Fut>(&self, session: &Session, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(Arc<CredentialPair>) -> Fut,
        Fut: Future<Output = Result<Attempt<T>, GatewayError>>,
    {
        if let RefreshState::Failed { reason } = session.state() {
            return Err(GatewayError::CredentialRefreshFailed { reason });
        }

        let mut credential = session.credential();
        let mut refreshed = false;
        if credential.is_expired(Utc::now(), self.expiry_skew) {
            debug!(principal = %session.principal(), "Credential expired; refreshing before call");
            credential = self.refresh(session, credential.generation).await?;
            refreshed = true;
        }

        match op(credential.clone()).await? {
            Attempt::Completed(value) => Ok(value),
            Attempt::Unauthorized(value) if refreshed => {
                warn!(principal = %session.principal(), "Unauthorized with a freshly refreshed credential");
                Ok(value)
            }
            Attempt::Unauthorized(_) => {
                info!(principal = %session.principal(), "Downstream rejected credential; refreshing and retrying once");
                let credential = self.refresh(session, credential.generation).await?;
                match op(credential).await? {
                    Attempt::Completed(value) | Attempt::Unauthorized(value) => Ok(value),
                }
            }
        }
    }

    /// Refresh the session's credential unless someone already replaced `stale_generation`
    pub async fn refresh(
        &self,
        session: &Session,
        stale_generation: u64,
    ) -> Result<Arc<CredentialPair>, RefreshError> {
        let _flight = session.flight.lock().await;

        if let RefreshState::Failed { reason } = session.state() {
            return Err(RefreshError::SessionInvalid(reason));
        }
        let current = session.credential();
        if current.generation != stale_generation {
            debug!(principal = %session.principal(), generation = current.generation, "Joined completed refresh");
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            session.fail(RefreshError::MissingRefreshToken.to_string());
            crate::metrics::record_refresh(false);
            return Err(RefreshError::MissingRefreshToken);
        };

        session.set_state(RefreshState::Refreshing);
        info!(principal = %session.principal(), generation = current.generation, "Refreshing credential");

        let result = match tokio::time::timeout(self.refresh_timeout, self.client.refresh(&refresh_token)).await {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Timeout(self.refresh_timeout)),
        };

        match result {
            Ok(grant) => {
                let next = Arc::new(current.successor(
                    grant.access_token,
                    grant.refresh_token,
                    grant.expires_in,
                    Utc::now(),
                ));
                session.install(next.clone());
                crate::metrics::record_refresh(true);
                info!(principal = %session.principal(), generation = next.generation, "Credential refreshed");
                Ok(next)
            }
            Err(err) => {
                session.fail(err.to_string());
                crate::metrics::record_refresh(false);
                warn!(principal = %session.principal(), error = %err, "Credential refresh failed; session invalid");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, SecretString};
    use crate::oauth::client::TokenGrant;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        delay: Duration,
        fail: Option<RefreshError>,
    }

    impl CountingClient {
        fn ok(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: None,
            })
        }

        fn failing(err: RefreshError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: Some(err),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshClient for CountingClient {
        async fn refresh(&self, _refresh_token: &SecretString) -> Result<TokenGrant, RefreshError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(TokenGrant {
                access_token: SecretString::new(format!("fresh-{}", n)),
                refresh_token: None,
                expires_in: Duration::from_secs(3600),
            })
        }
    }

    fn completed<T>(value: T) -> Result<Attempt<T>, GatewayError> {
        Ok(Attempt::Completed(value))
    }

    fn unauthorized<T>(value: T) -> Result<Attempt<T>, GatewayError> {
        Ok(Attempt::Unauthorized(value))
    }

    fn expired_session() -> Arc<Session> {
        Arc::new(Session::new(
            Identity::new("alice"),
            CredentialPair::new("stale", Some("refresh".into()), Utc::now() - ChronoDuration::minutes(5)),
        ))
    }

    fn valid_session() -> Arc<Session> {
        Arc::new(Session::new(
            Identity::new("alice"),
            CredentialPair::new("current", Some("refresh".into()), Utc::now() + ChronoDuration::hours(1)),
        ))
    }

    #[tokio::test]
    async fn test_valid_credential_passes_through() {
        let client = CountingClient::ok(Duration::ZERO);
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = valid_session();

        let token = interceptor
            .call(&session, |c| async move { completed(c.access_token.expose().to_string()) })
            .await
            .unwrap();

        assert_eq!(token, "current");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_refreshed_before_call() {
        let client = CountingClient::ok(Duration::ZERO);
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = expired_session();

        let token = interceptor
            .call(&session, |c| async move { completed(c.access_token.expose().to_string()) })
            .await
            .unwrap();

        assert_eq!(token, "fresh-1");
        assert_eq!(client.calls(), 1);
        assert_eq!(session.state(), RefreshState::Valid);
        assert_eq!(session.credential().generation, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let client = CountingClient::ok(Duration::from_millis(50));
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = expired_session();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let interceptor = interceptor.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    interceptor
                        .call(&session, |c| async move {
                            completed(c.access_token.expose().to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "fresh-1");
        }
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_retries_once() {
        let client = CountingClient::ok(Duration::ZERO);
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = valid_session();
        let attempts = AtomicUsize::new(0);

        let token = interceptor
            .call(&session, |c| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    let token = c.access_token.expose().to_string();
                    if n == 0 {
                        unauthorized(token)
                    } else {
                        completed(token)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(token, "fresh-1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_persistent_unauthorized_retries_only_once() {
        let client = CountingClient::ok(Duration::ZERO);
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = valid_session();
        let attempts = AtomicUsize::new(0);

        let result = interceptor
            .call(&session, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { unauthorized("denied") }
            })
            .await
            .unwrap();

        assert_eq!(result, "denied");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_after_proactive_refresh() {
        let client = CountingClient::ok(Duration::ZERO);
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = expired_session();
        let attempts = AtomicUsize::new(0);

        interceptor
            .call(&session, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { unauthorized(()) }
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_fails_without_running_operation() {
        let client = CountingClient::failing(RefreshError::Rejected("invalid_grant".to_string()));
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = expired_session();
        let attempts = AtomicUsize::new(0);

        let err = interceptor
            .call(&session, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { completed(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "credential_refresh_failed");
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(!session.is_valid());

        // Failed sessions are not retried automatically
        let err = interceptor
            .call(&session, |_| async { completed(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "credential_refresh_failed");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_waiters_receive_the_failure() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
            fail: Some(RefreshError::Rejected("invalid_grant".to_string())),
        });
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = expired_session();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let interceptor = interceptor.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    interceptor
                        .call(&session, |_| async { completed(()) })
                        .await
                })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.code(), "credential_refresh_failed");
        }
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout() {
        let client = CountingClient::ok(Duration::from_secs(120));
        let interceptor = OAuthInterceptor::new(client).with_refresh_timeout(Duration::from_secs(10));
        let session = expired_session();

        let err = interceptor.refresh(&session, 0).await.unwrap_err();
        assert_eq!(err, RefreshError::Timeout(Duration::from_secs(10)));
        assert!(!session.is_valid());
    }

    #[tokio::test]
    async fn test_missing_refresh_token() {
        let client = CountingClient::ok(Duration::ZERO);
        let interceptor = OAuthInterceptor::new(client.clone());
        let session = Session::new(
            Identity::new("svc"),
            CredentialPair::new("stale", None, Utc::now() - ChronoDuration::minutes(1)),
        );

        let err = interceptor
            .call(&session, |_| async { completed(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "credential_refresh_failed");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_reauthentication_recovers_failed_session() {
        let client = CountingClient::failing(RefreshError::Rejected("invalid_grant".to_string()));
        let interceptor = OAuthInterceptor::new(client);
        let session = expired_session();
        assert!(interceptor.refresh(&session, 0).await.is_err());

        session.reauthenticate(CredentialPair::new(
            "relogin",
            Some("r2".into()),
            Utc::now() + ChronoDuration::hours(1),
        ));
        let token = interceptor
            .call(&session, |c| async move { completed(c.access_token.expose().to_string()) })
            .await
            .unwrap();
        assert_eq!(token, "relogin");
    }
}
