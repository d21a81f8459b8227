//! Message-level authorization.
//!
//! Requirements attach to message types: roles the principal must hold,
//! claims it must carry, or custom assertions. An unknown message type
//! passes by default; configure a catch-all requirement to invert that.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub id: String,
    pub roles: HashSet<String>,
    pub claims: HashMap<String, String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOperation {
    Send,
    Publish,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationResult {
    Success,
    Failure { reason: String, code: String },
}

impl AuthorizationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn denied(reason: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
            code: code.into(),
        }
    }
}

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    async fn authorize(
        &self,
        principal: &Principal,
        message_type: &str,
        operation: MessageOperation,
    ) -> qv_common::Result<AuthorizationResult>;
}

type Assertion = Arc<dyn Fn(&Principal, MessageOperation) -> bool + Send + Sync>;

enum Requirement {
    Role(String),
    Claim { key: String, value: String },
    Custom { name: String, assert: Assertion },
}

/// Requirement-based provider: all requirements registered for a message
/// type must pass.
#[derive(Default)]
pub struct RequirementAuthorizationProvider {
    requirements: DashMap<String, Vec<Requirement>>,
}

impl RequirementAuthorizationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_role(self, message_type: impl Into<String>, role: impl Into<String>) -> Self {
        self.push(message_type, Requirement::Role(role.into()));
        self
    }

    pub fn require_claim(
        self,
        message_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.push(
            message_type,
            Requirement::Claim {
                key: key.into(),
                value: value.into(),
            },
        );
        self
    }

    pub fn require_assertion(
        self,
        message_type: impl Into<String>,
        name: impl Into<String>,
        assert: Assertion,
    ) -> Self {
        self.push(
            message_type,
            Requirement::Custom {
                name: name.into(),
                assert,
            },
        );
        self
    }

    fn push(&self, message_type: impl Into<String>, requirement: Requirement) {
        self.requirements
            .entry(message_type.into())
            .or_default()
            .push(requirement);
    }
}

#[async_trait]
impl AuthorizationProvider for RequirementAuthorizationProvider {
    async fn authorize(
        &self,
        principal: &Principal,
        message_type: &str,
        operation: MessageOperation,
    ) -> qv_common::Result<AuthorizationResult> {
        let Some(requirements) = self.requirements.get(message_type) else {
            return Ok(AuthorizationResult::Success);
        };

        for requirement in requirements.iter() {
            match requirement {
                Requirement::Role(role) => {
                    if !principal.roles.contains(role) {
                        return Ok(AuthorizationResult::denied(
                            format!("principal {} lacks role {role}", principal.id),
                            "missing_role",
                        ));
                    }
                }
                Requirement::Claim { key, value } => {
                    if principal.claims.get(key) != Some(value) {
                        return Ok(AuthorizationResult::denied(
                            format!("principal {} lacks claim {key}={value}", principal.id),
                            "missing_claim",
                        ));
                    }
                }
                Requirement::Custom { name, assert } => {
                    if !assert(principal, operation) {
                        return Ok(AuthorizationResult::denied(
                            format!("assertion {name} rejected principal {}", principal.id),
                            "assertion_failed",
                        ));
                    }
                }
            }
        }

        Ok(AuthorizationResult::Success)
    }
}
