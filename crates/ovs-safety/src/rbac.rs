//! RBAC validator. Deny-by-default.
//!
//! The validator consults a [`PolicyProvider`] for the actor's capabilities
//! and applies two hard rules on top:
//! - the tool's required permissions must all be held;
//! - production writes additionally require the `prod.write` capability and
//!   a decided approval id.
//!
//! Every allow/deny decision is appended to the execution's event stream for
//! audit.

use async_trait::async_trait;
use ovs_schemas::{ActionClass, EventKind, OvsError};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use ovs_audit::EventWriter;

pub const PROD_WRITE_CAPABILITY: &str = "prod.write";

// ---------------------------------------------------------------------------
// AccessRequest
// ---------------------------------------------------------------------------

/// One authorization question.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub tenant_id: String,
    pub actor_id: String,
    /// Resource being touched, e.g. `asset:web-prod-01`.
    pub resource: String,
    /// Tool-level action, e.g. `restart_service`.
    pub action: String,
    pub environment: String,
    pub action_class: ActionClass,
    /// Permissions the selected tool demands.
    pub required_permissions: Vec<String>,
    /// The APPROVED approval backing this run, if any.
    pub approval_id: Option<Uuid>,
}

impl AccessRequest {
    fn is_production_write(&self) -> bool {
        self.action_class.is_write() && self.environment.eq_ignore_ascii_case("production")
    }
}

// ---------------------------------------------------------------------------
// PolicyProvider
// ---------------------------------------------------------------------------

/// Source of actor capabilities. Deny-by-default: an unknown actor has none.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn capabilities(&self, tenant_id: &str, actor_id: &str)
        -> Result<HashSet<String>, OvsError>;
}

/// In-memory provider keyed by `(tenant, actor)`. Default provider for tests
/// and single-box deployments; production wires an external policy service
/// behind the same trait.
#[derive(Debug, Default)]
pub struct StaticPolicyProvider {
    grants: HashMap<(String, String), HashSet<String>>,
}

impl StaticPolicyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, tenant_id: &str, actor_id: &str, caps: &[&str]) -> Self {
        self.grants
            .entry((tenant_id.to_string(), actor_id.to_string()))
            .or_default()
            .extend(caps.iter().map(|c| c.to_string()));
        self
    }
}

#[async_trait]
impl PolicyProvider for StaticPolicyProvider {
    async fn capabilities(
        &self,
        tenant_id: &str,
        actor_id: &str,
    ) -> Result<HashSet<String>, OvsError> {
        Ok(self
            .grants
            .get(&(tenant_id.to_string(), actor_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// RbacValidator
// ---------------------------------------------------------------------------

pub struct RbacValidator {
    provider: Box<dyn PolicyProvider>,
}

impl RbacValidator {
    pub fn new(provider: Box<dyn PolicyProvider>) -> Self {
        Self { provider }
    }

    /// Evaluate `req`, audit the decision, and return `POLICY` on deny.
    pub async fn authorize(
        &self,
        req: &AccessRequest,
        execution_id: Uuid,
        events: &EventWriter,
    ) -> Result<(), OvsError> {
        let caps = self
            .provider
            .capabilities(&req.tenant_id, &req.actor_id)
            .await?;

        let denial = self.evaluate(req, &caps);

        events
            .append(
                execution_id,
                &req.tenant_id,
                EventKind::RbacDecision,
                json!({
                    "actor": req.actor_id,
                    "resource": req.resource,
                    "action": req.action,
                    "environment": req.environment,
                    "allowed": denial.is_none(),
                    "deny_reason": denial,
                }),
            )
            .await?;

        match denial {
            None => Ok(()),
            Some(reason) => Err(OvsError::policy(reason)),
        }
    }

    /// Pure decision logic; `None` means allowed.
    fn evaluate(&self, req: &AccessRequest, caps: &HashSet<String>) -> Option<String> {
        for needed in &req.required_permissions {
            if !caps.contains(needed) {
                return Some(format!(
                    "actor '{}' lacks required permission '{}'",
                    req.actor_id, needed
                ));
            }
        }

        if req.is_production_write() {
            if !caps.contains(PROD_WRITE_CAPABILITY) {
                return Some(format!(
                    "production write requires the '{PROD_WRITE_CAPABILITY}' capability"
                ));
            }
            if req.approval_id.is_none() {
                return Some("production write requires a decided approval".to_string());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(action_class: ActionClass, environment: &str, approval: Option<Uuid>) -> AccessRequest {
        AccessRequest {
            tenant_id: "t1".into(),
            actor_id: "u1".into(),
            resource: "asset:web-prod-01".into(),
            action: "restart_service".into(),
            environment: environment.into(),
            action_class,
            required_permissions: vec!["service.restart".into()],
            approval_id: approval,
        }
    }

    fn validator() -> RbacValidator {
        RbacValidator::new(Box::new(
            StaticPolicyProvider::new().grant("t1", "u1", &["service.restart", "prod.write"]),
        ))
    }

    #[test]
    fn unknown_actor_is_denied() {
        let v = RbacValidator::new(Box::new(StaticPolicyProvider::new()));
        let r = req(ActionClass::Read, "staging", None);
        let caps = HashSet::new();
        assert!(v.evaluate(&r, &caps).is_some());
    }

    #[test]
    fn production_write_needs_prod_write_and_approval() {
        let v = validator();
        let caps: HashSet<String> =
            ["service.restart".to_string(), "prod.write".to_string()].into();

        // approval missing → denied
        let r = req(ActionClass::Mutate, "production", None);
        assert!(v.evaluate(&r, &caps).unwrap().contains("approval"));

        // with approval → allowed
        let r = req(ActionClass::Mutate, "production", Some(Uuid::new_v4()));
        assert!(v.evaluate(&r, &caps).is_none());
    }

    #[test]
    fn production_read_does_not_need_prod_write() {
        let v = validator();
        let caps: HashSet<String> = ["service.restart".to_string()].into();
        let r = req(ActionClass::Read, "production", None);
        assert!(v.evaluate(&r, &caps).is_none());
    }

    #[test]
    fn staging_write_skips_the_production_rules() {
        let v = validator();
        let caps: HashSet<String> = ["service.restart".to_string()].into();
        let r = req(ActionClass::Mutate, "staging", None);
        assert!(v.evaluate(&r, &caps).is_none());
    }
}
