//! Platform adapter interface
//!
//! The scheduler never talks HTTP itself. Each platform is an opaque
//! capability behind [`PlatformAdapter`]: publish a payload with an access
//! token, or exchange a refresh token for a new grant. The executor and
//! credential manager route to the right adapter through an
//! [`AdapterRegistry`] and never match on platform identity beyond that.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libsyndicate::platforms::{AdapterRegistry, mock::MockAdapter};
//! use libsyndicate::types::Platform;
//!
//! let mut registry = AdapterRegistry::new();
//! registry.register(Arc::new(MockAdapter::new(Platform::TikTok)));
//!
//! assert!(registry.get(Platform::TikTok).is_some());
//! assert!(registry.get(Platform::Reddit).is_none());
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::credentials::{AccessToken, OAuthGrant, RefreshRequest};
use crate::error::{AdapterError, RefreshError};
use crate::types::{JobPayload, Platform, PublishReceipt};

// Available outside tests so integration tests and dry-run embedders can use it
pub mod mock;

/// One platform's publish and token-refresh capability
///
/// Implementations must be safe to call from many worker tasks at once.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform this adapter serves
    fn platform(&self) -> Platform;

    /// Publish `payload` on behalf of the account owning `token`
    ///
    /// # Errors
    ///
    /// - `AdapterError::RateLimited` for HTTP 429 or an explicit quota response
    /// - `AdapterError::Transient` for 5xx, network errors and ambiguous states
    /// - `AdapterError::Permanent` when the content itself is rejected
    /// - `AdapterError::Unauthorized` when the access token is refused
    async fn publish(
        &self,
        token: &AccessToken,
        payload: &JobPayload,
    ) -> std::result::Result<PublishReceipt, AdapterError>;

    /// Exchange a refresh token for a new grant
    ///
    /// Return `RefreshError::Revoked` when the grant is gone for good
    /// (`invalid_grant` and friends) so the account is disconnected instead of
    /// retried.
    async fn refresh_token(
        &self,
        request: &RefreshRequest,
    ) -> std::result::Result<OAuthGrant, RefreshError>;
}

/// Adapters keyed by platform
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same platform
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) -> &mut Self {
        self.adapters.insert(adapter.platform(), adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    /// Registered platforms in a stable order
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
