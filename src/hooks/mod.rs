//! Hooks Module
//!
//! Extensibility points for credential checks, topic authorization and
//! event notification. The routing core consults [`Hooks::check_acl`] before
//! a publish is matched or a subscription is admitted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::QoS;


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authentication failed
    AuthenticationFailed,
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Operation an ACL check is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclAccess {
    /// Publishing to a topic name
    Publish,
    /// Subscribing to a topic filter
    Subscribe,
}

impl AclAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            AclAccess::Publish => "publish",
            AclAccess::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for AclAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker hooks trait
///
/// All methods have default implementations that allow everything.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Check a client's credentials
    ///
    /// # Returns
    /// * `Ok(true)` - Credentials accepted
    /// * `Ok(false)` - Credentials rejected
    /// * `Err(_)` - Internal error occurred
    async fn check_credentials(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Check whether a client may publish to a topic or subscribe to a filter
    ///
    /// For [`AclAccess::Publish`] `topic` is a concrete topic name; for
    /// [`AclAccess::Subscribe`] it is the requested filter and may contain
    /// wildcards.
    async fn check_acl(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _access: AclAccess,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Look up the pre-shared key for a TLS-PSK identity
    async fn get_preshared_key(
        &self,
        _identity: &str,
        _hint: Option<&str>,
    ) -> HookResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Called after a client session is attached
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// Called after a client disconnects
    async fn on_client_disconnected(&self, _client_id: &str, _clean_session: bool) {}

    /// Called after a message has been routed to subscribers
    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Arc-wrapped hook providers can be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn check_credentials(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .check_credentials(client_id, username, password)
            .await
    }

    async fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: AclAccess,
    ) -> HookResult<bool> {
        (**self).check_acl(client_id, username, topic, access).await
    }

    async fn get_preshared_key(
        &self,
        identity: &str,
        hint: Option<&str>,
    ) -> HookResult<Option<Vec<u8>>> {
        (**self).get_preshared_key(identity, hint).await
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_client_connected(client_id, username).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, clean_session: bool) {
        (**self)
            .on_client_disconnected(client_id, clean_session)
            .await;
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        (**self).on_message_published(topic, payload, qos).await;
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// Credential and ACL checks pass only if every hook returns `Ok(true)`.
/// The first hook that knows a pre-shared key wins. Events reach all hooks
/// in order.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn check_credentials(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks
                .check_credentials(client_id, username, password)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: AclAccess,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.check_acl(client_id, username, topic, access).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn get_preshared_key(
        &self,
        identity: &str,
        hint: Option<&str>,
    ) -> HookResult<Option<Vec<u8>>> {
        for hooks in &self.hooks {
            if let Some(key) = hooks.get_preshared_key(identity, hint).await? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, clean_session: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, clean_session).await;
        }
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        for hooks in &self.hooks {
            hooks.on_message_published(topic, payload, qos).await;
        }
    }
}
