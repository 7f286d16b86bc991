//! Collaborators the engine calls out to.

use async_trait::async_trait;
use msgr_delta::{NoopResolver, Resolver};
use reqwest::header::{COOKIE, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::context::SessionContext;
use crate::ServiceError;

/// Home page probed for account liveness
pub const HOME_URL: &str = "https://www.facebook.com/";

/// Session level collaborators
#[async_trait]
pub trait SessionServices: Send + Sync {
    /// Fetch a fresh sequence id before a reconnect.
    ///
    /// `Ok(None)` keeps the cursor as is. [`ServiceError::NotLoggedIn`]
    /// ends the session.
    async fn refresh_sequence_id(&self, _ctx: &SessionContext) -> Result<Option<u64>, ServiceError> {
        Ok(None)
    }

    /// Whether the account still looks usable; asked once when the engine
    /// cannot connect and will not retry
    async fn check_account_alive(&self, _ctx: &SessionContext) -> Result<bool, ServiceError> {
        Ok(true)
    }

    /// Resolver for the decoder's dependent fetches
    fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::new(NoopResolver)
    }
}

/// No collaborators
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServices;

impl SessionServices for NoServices {}

/// Account liveness over HTTP.
///
/// Requests the home page with the session cookies and without following
/// redirects; a redirect to the login page or a checkpoint means the
/// account is not usable.
#[derive(Debug, Clone)]
pub struct HttpAccountProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpAccountProbe {
    /// Probe against the default home page
    pub fn new() -> Result<Self, ServiceError> {
        Self::with_url(HOME_URL)
    }

    /// Probe against a custom URL
    pub fn with_url(url: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// Whether a redirect target points at login or a checkpoint
pub fn is_login_redirect(location: &str) -> bool {
    location.contains("login") || location.contains("checkpoint")
}

#[async_trait]
impl SessionServices for HttpAccountProbe {
    async fn check_account_alive(&self, ctx: &SessionContext) -> Result<bool, ServiceError> {
        let response = self
            .client
            .get(&self.url)
            .header(COOKIE, ctx.cookie_header())
            .header(USER_AGENT, ctx.user_agent.as_str())
            .send()
            .await?;
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        debug!("Account probe: {} {}", status, location);

        if status.is_redirection() {
            return Ok(!is_login_redirect(location));
        }
        if status.is_success() {
            return Ok(true);
        }
        Err(ServiceError::Unexpected(format!("status {}", status)))
    }
}
