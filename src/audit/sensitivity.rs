//! Classification of audit events into plain and sensitive.
//!
//! Sensitive entries get chained and archived; plain entries are just rows.
//! Classification is by exact action name, by substring keyword, or by
//! entity type, all case-insensitive. The default table covers the
//! security-relevant actions this crate emits; deployments extend it for
//! their own action vocabulary.

use std::collections::HashSet;

const DEFAULT_ACTIONS: &[&str] = &[
    "account_locked",
    "account_unlocked",
    "failed_attempts_reset",
    "change_password",
    "password_reset",
    "sessions_invalidated",
    "sessions_revoked",
    "logout_other_devices",
    "token_revoked",
    "update_role",
    "change_role",
    "update_permissions",
    "assign_permission",
    "revoke_permission",
    "grant_access",
    "revoke_access",
    "export_data",
    "download_bulk_data",
    "update_system_config",
    "modify_security_settings",
    "delete_audit_log",
    "purge_data",
];

const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "user_role",
    "permission",
    "system_config",
    "security_settings",
];

const DEFAULT_KEYWORDS: &[&str] = &[
    "delete",
    "remove",
    "export",
    "purge",
    "blacklist",
    "terminate",
    "suspend",
    "revoke",
];

/// Decides which audit events are sensitive.
#[derive(Debug, Clone)]
pub struct SensitivityPolicy {
    actions: HashSet<String>,
    entity_types: HashSet<String>,
    keywords: Vec<String>,
}

impl Default for SensitivityPolicy {
    fn default() -> Self {
        Self {
            actions: DEFAULT_ACTIONS.iter().map(|s| (*s).to_string()).collect(),
            entity_types: DEFAULT_ENTITY_TYPES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            keywords: DEFAULT_KEYWORDS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl SensitivityPolicy {
    /// Policy with empty tables; nothing classifies as sensitive until added.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            actions: HashSet::new(),
            entity_types: HashSet::new(),
            keywords: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: &str) -> Self {
        self.actions.insert(action.trim().to_lowercase());
        self
    }

    #[must_use]
    pub fn with_entity_type(mut self, entity_type: &str) -> Self {
        self.entity_types.insert(entity_type.trim().to_lowercase());
        self
    }

    #[must_use]
    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keywords.push(keyword.trim().to_lowercase());
        self
    }

    /// Whether an action against an entity type is sensitive.
    #[must_use]
    pub fn is_sensitive(&self, action: &str, entity_type: &str) -> bool {
        let action = action.trim().to_lowercase();
        if action.is_empty() {
            return false;
        }
        if self.actions.contains(&action) {
            return true;
        }
        if self.keywords.iter().any(|keyword| action.contains(keyword)) {
            return true;
        }
        let entity_type = entity_type.trim().to_lowercase();
        !entity_type.is_empty() && self.entity_types.contains(&entity_type)
    }
}
