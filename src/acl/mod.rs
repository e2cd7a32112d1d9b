//! ACL (Access Control List) Module
//!
//! Default in-process implementation of [`Hooks::check_acl`] with support for:
//! - MQTT wildcards (# and +) in permission patterns
//! - Variable substitution (%c = client_id, %u = username)
//! - Role-based permissions assigned per username
//!
//! Publish checks match the concrete topic name against the patterns.
//! Subscribe checks require the requested filter to be covered by a pattern,
//! so `sensors/+/temp` is allowed by `sensors/#` but `#` is not.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::AclConfig;
use crate::hooks::{AclAccess, HookResult, Hooks};
use crate::topic::{filter_within_pattern, topic_matches_filter};


/// ACL provider
pub struct AclProvider {
    /// Whether ACL is enabled
    enabled: bool,
    /// Role definitions (name -> role)
    roles: HashMap<String, AclRoleEntry>,
    /// Username -> role name
    user_roles: HashMap<String, String>,
    /// Default permissions for users without explicit role (including anonymous)
    default: AclRoleEntry,
}

/// Patterns granted to one role
#[derive(Debug, Default)]
struct AclRoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl AclRoleEntry {
    fn patterns(&self, access: AclAccess) -> &[String] {
        match access {
            AclAccess::Publish => &self.publish,
            AclAccess::Subscribe => &self.subscribe,
        }
    }
}

impl AclProvider {
    /// Create a new ACL provider from configuration
    pub fn new(config: &AclConfig) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclRoleEntry {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        let user_roles = config
            .users
            .iter()
            .map(|user| (user.username.clone(), user.role.clone()))
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            user_roles,
            default: AclRoleEntry {
                publish: config.default.publish.clone(),
                subscribe: config.default.subscribe.clone(),
            },
        }
    }

    /// Check if ACL is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check a topic or filter against one pattern after variable substitution
    fn matches_pattern(
        pattern: &str,
        topic: &str,
        access: AclAccess,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        let pattern = pattern
            .replace("%c", client_id)
            .replace("%u", username.unwrap_or(""));

        match access {
            AclAccess::Publish => topic_matches_filter(topic, &pattern),
            AclAccess::Subscribe => filter_within_pattern(topic, &pattern),
        }
    }

    fn check_patterns(
        patterns: &[String],
        topic: &str,
        access: AclAccess,
        client_id: &str,
        username: Option<&str>,
    ) -> bool {
        patterns
            .iter()
            .any(|p| Self::matches_pattern(p, topic, access, client_id, username))
    }

    /// Get role permissions for a username
    fn role_for(&self, username: Option<&str>) -> Option<&AclRoleEntry> {
        let role_name = self.user_roles.get(username?)?;
        self.roles.get(role_name)
    }

    /// Evaluate an access request without going through the async hook
    pub fn is_allowed(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: AclAccess,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        if let Some(role) = self.role_for(username) {
            if Self::check_patterns(role.patterns(access), topic, access, client_id, username) {
                return true;
            }
        }

        // Default permissions apply to everyone, including users with a role
        Self::check_patterns(
            self.default.patterns(access),
            topic,
            access,
            client_id,
            username,
        )
    }
}

#[async_trait]
impl Hooks for AclProvider {
    async fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: AclAccess,
    ) -> HookResult<bool> {
        Ok(self.is_allowed(client_id, username, topic, access))
    }
}
