//! Dependent fetches the decoder needs to complete some deltas.
//!
//! Photo attachments sometimes arrive with an id only, replies may omit the
//! replied-to message and forced fetches are pure references. A
//! [`Resolver`] supplies the missing pieces; the decoder awaits it inline so
//! the consumer only ever sees the completed event.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::ResolveError;

/// Source of data referenced but not carried by a delta
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve the full-size URL of a photo attachment
    async fn resolve_photo_url(&self, photo_id: &str) -> Result<String, ResolveError>;

    /// Fetch a message node by thread and message id.
    ///
    /// The node is returned as-is; it carries a `__typename` the decoder
    /// uses to pick the event shape (`UserMessage`, `ThreadImageMessage`).
    async fn fetch_message(&self, thread_id: &str, message_id: &str)
        -> Result<Value, ResolveError>;
}

/// Resolver used when no collaborator is configured; every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

#[async_trait]
impl Resolver for NoopResolver {
    async fn resolve_photo_url(&self, _photo_id: &str) -> Result<String, ResolveError> {
        Err(ResolveError::Unavailable)
    }

    async fn fetch_message(
        &self,
        _thread_id: &str,
        _message_id: &str,
    ) -> Result<Value, ResolveError> {
        Err(ResolveError::Unavailable)
    }
}

/// Run a resolver call bounded by `limit`
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ResolveError>
where
    F: Future<Output = Result<T, ResolveError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::Timeout),
    }
}
