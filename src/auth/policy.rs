//! Declarative policy evaluation.
//!
//! Rules are written in Rego and grouped in two namespaces, one consulted
//! while authenticating a token and one consulted while authorizing an
//! action. Each namespace is parsed once when the evaluator is built; every
//! evaluation runs on a private copy of the prepared engine.
//!
//! Evaluation is fail-closed. A query is allowed only when it yields exactly
//! one result whose output binding is the boolean `true`. Parse errors,
//! evaluation errors, unknown rules, empty results and non-boolean values
//! all deny.

use crate::types::{AppError, Result};
use regorus::{Engine, Value};
use serde::Serialize;
use tracing::warn;

/// Source of the authentication namespace.
pub const AUTHENTICATION_REGO: &str = include_str!("rego/authentication.rego");
/// Source of the authorization namespace.
pub const AUTHORIZATION_REGO: &str = include_str!("rego/authorization.rego");

/// Rule evaluated for every bearer token.
pub const RULE_AUTHENTICATE: &str = "auth";
/// Allows any caller holding a known role.
pub const RULE_ANY: &str = "rule_any";
/// Allows callers holding the ADMIN role.
pub const RULE_ADMIN_ONLY: &str = "rule_admin_only";
/// Allows callers holding the USER role.
pub const RULE_USER_ONLY: &str = "rule_user_only";
/// Allows admins, or users acting on their own identity.
pub const RULE_ADMIN_OR_SUBJECT: &str = "rule_admin_or_subject";

/// Variable every query binds its verdict to.
const OUTPUT_VAR: &str = "x";

/// The rule namespaces known to the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Token acceptance rules.
    Authentication,
    /// Role and subject rules for actions.
    Authorization,
}

impl Namespace {
    fn package(self) -> &'static str {
        match self {
            Namespace::Authentication => "gatehouse.authentication",
            Namespace::Authorization => "gatehouse.authorization",
        }
    }
}

/// Evaluates named rules against structured input.
///
/// Shared freely across tasks; each evaluation clones the prepared engine.
pub struct PolicyEvaluator {
    authentication: Engine,
    authorization: Engine,
}

impl PolicyEvaluator {
    /// Builds an evaluator over the embedded rule sets.
    pub fn new() -> Result<Self> {
        Self::with_modules(AUTHENTICATION_REGO, AUTHORIZATION_REGO)
    }

    /// Builds an evaluator over caller-supplied rule sets.
    ///
    /// Each module must declare the package of its namespace.
    pub fn with_modules(authentication: &str, authorization: &str) -> Result<Self> {
        Ok(Self {
            authentication: prepare("authentication.rego", authentication)?,
            authorization: prepare("authorization.rego", authorization)?,
        })
    }

    /// Evaluates `rule` within `namespace`.
    ///
    /// Returns `Ok(())` on an explicit allow and `Unauthenticated` for every
    /// other outcome.
    pub fn evaluate<I: Serialize>(&self, namespace: Namespace, rule: &str, input: &I) -> Result<()> {
        match self.verdict(namespace, rule, input) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AppError::Unauthenticated(format!(
                "policy denied: rule[{}]",
                rule
            ))),
            Err(reason) => {
                warn!(rule, %reason, "policy evaluation failed closed");
                Err(AppError::Unauthenticated(format!(
                    "policy evaluation failed: rule[{}]: {}",
                    rule, reason
                )))
            }
        }
    }

    /// Convenience wrapper answering only allow or deny.
    pub fn is_allowed<I: Serialize>(&self, namespace: Namespace, rule: &str, input: &I) -> bool {
        self.evaluate(namespace, rule, input).is_ok()
    }

    fn verdict<I: Serialize>(&self, namespace: Namespace, rule: &str, input: &I) -> anyhow::Result<bool> {
        if !is_rule_name(rule) {
            anyhow::bail!("rule name is not an identifier");
        }

        let mut engine = match namespace {
            Namespace::Authentication => self.authentication.clone(),
            Namespace::Authorization => self.authorization.clone(),
        };

        let input = Value::from_json_str(&serde_json::to_string(input)?)?;
        engine.set_input(input);

        let query = format!("{} = data.{}.{}", OUTPUT_VAR, namespace.package(), rule);
        let results = engine.eval_query(query, false)?;

        if results.result.len() != 1 {
            anyhow::bail!("expected one result, got {}", results.result.len());
        }

        match &results.result[0].bindings[OUTPUT_VAR] {
            Value::Bool(allowed) => Ok(*allowed),
            other => anyhow::bail!("non-boolean result: {}", other),
        }
    }
}

fn prepare(path: &str, source: &str) -> Result<Engine> {
    let mut engine = Engine::new();
    engine
        .add_policy(path.to_string(), source.to_string())
        .map_err(|e| AppError::Internal(format!("compiling {}: {}", path, e)))?;
    Ok(engine)
}

fn is_rule_name(rule: &str) -> bool {
    let mut chars = rule.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
