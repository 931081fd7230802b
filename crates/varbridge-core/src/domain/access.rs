//! Per-variable access rules
//!
//! The variable owner always passes. Otherwise rules are evaluated in
//! declaration order and the first one matching caller, permission and
//! conditions grants access. A variable without any rules falls back to the
//! configured [`DefaultAccess`]. Every check is reported to the audit sink.

use globset::{Glob, GlobMatcher};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::collaborators::AuditSink;
use super::events::AuditEvent;
use super::variable::{Caller, SessionId, Variable};
use crate::error::{VarError, VarResult};

/// Attributes of a caller matched against rule conditions
pub type AccessContext = HashMap<String, Json>;

/// Operation class being authorised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read the current value
    Read,
    /// Commit a new value
    Write,
    /// Subscribe to changes; not implied by `Read`
    Observe,
    /// Take an optimization lock
    Optimize,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => f.write_str("read"),
            Permission::Write => f.write_str("write"),
            Permission::Observe => f.write_str("observe"),
            Permission::Optimize => f.write_str("optimize"),
        }
    }
}

/// Caller-id glob, compiled on first use and reused afterwards
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CallerGlob {
    pattern: String,
    compiled: OnceCell<Result<GlobMatcher, String>>,
}

impl CallerGlob {
    /// Wrap a glob pattern
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            compiled: OnceCell::new(),
        }
    }

    /// The pattern text
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Compiled matcher; compile errors are cached too
    pub fn matcher(&self) -> VarResult<&GlobMatcher> {
        self.compiled
            .get_or_init(|| {
                Glob::new(&self.pattern)
                    .map(|glob| glob.compile_matcher())
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| VarError::ValidationFailed(format!("invalid pattern '{}': {}", self.pattern, e)))
    }

    #[cfg(test)]
    fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

impl From<String> for CallerGlob {
    fn from(pattern: String) -> Self {
        Self::new(pattern)
    }
}

impl From<CallerGlob> for String {
    fn from(glob: CallerGlob) -> Self {
        glob.pattern
    }
}

impl PartialEq for CallerGlob {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for CallerGlob {}

impl fmt::Debug for CallerGlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallerGlob").field(&self.pattern).finish()
    }
}

/// Which callers a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPattern {
    /// Every caller
    Any,
    /// Callers whose id matches the glob
    Glob(CallerGlob),
}

impl SessionPattern {
    fn matches(&self, caller_id: &str) -> VarResult<bool> {
        match self {
            SessionPattern::Any => Ok(true),
            SessionPattern::Glob(glob) => Ok(glob.matcher()?.is_match(caller_id)),
        }
    }
}

/// What a variable falls back to when it has no rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAccess {
    /// Grant everything
    #[default]
    Open,
    /// Deny every non-owner
    Closed,
}

/// One access rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Callers the rule applies to
    pub session_pattern: SessionPattern,
    /// Permissions granted
    pub permissions: BTreeSet<Permission>,
    /// Context attributes that must all be equal
    #[serde(default)]
    pub conditions: BTreeMap<String, Json>,
}

impl AccessRule {
    /// Rule applying to every caller
    pub fn any(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            session_pattern: SessionPattern::Any,
            permissions: permissions.into_iter().collect(),
            conditions: BTreeMap::new(),
        }
    }

    /// Rule applying to callers matching a glob
    pub fn glob(pattern: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            session_pattern: SessionPattern::Glob(CallerGlob::new(pattern)),
            permissions: permissions.into_iter().collect(),
            conditions: BTreeMap::new(),
        }
    }

    /// Require a context attribute
    pub fn with_condition(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    /// Reject rules whose pattern does not compile
    pub fn validate(&self) -> VarResult<()> {
        match &self.session_pattern {
            SessionPattern::Any => Ok(()),
            SessionPattern::Glob(glob) => glob.matcher().map(|_| ()),
        }
    }

    /// Whether this rule grants `permission` to `caller`
    pub fn matches(&self, caller: &Caller, permission: Permission) -> bool {
        if !self.permissions.contains(&permission) {
            return false;
        }
        let pattern_matches = match self.session_pattern.matches(&caller.id) {
            Ok(matched) => matched,
            Err(e) => {
                warn!("Skipping access rule with bad pattern: {}", e);
                false
            }
        };
        pattern_matches
            && self
                .conditions
                .iter()
                .all(|(key, expected)| caller.context.get(key) == Some(expected))
    }
}

/// Outcome of an access evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// Caller owns the variable
    Owner,
    /// Rule at this index granted access
    Rule(usize),
    /// No rules attached and the default is open
    DefaultOpen,
    /// Nothing granted access
    Denied,
}

impl AccessDecision {
    /// Whether access is granted
    pub fn granted(&self) -> bool {
        !matches!(self, AccessDecision::Denied)
    }
}

/// Evaluates access rules and reports every check
#[derive(Clone)]
pub struct AccessControl {
    audit: Arc<dyn AuditSink>,
    default_access: DefaultAccess,
}

impl AccessControl {
    /// Create an access controller
    pub fn new(audit: Arc<dyn AuditSink>, default_access: DefaultAccess) -> Self {
        Self { audit, default_access }
    }

    /// Evaluate without auditing
    pub fn evaluate(&self, variable: &Variable, caller: &Caller, permission: Permission) -> AccessDecision {
        if variable.owner == caller.id {
            return AccessDecision::Owner;
        }
        if variable.access_rules.is_empty() {
            return match self.default_access {
                DefaultAccess::Open => AccessDecision::DefaultOpen,
                DefaultAccess::Closed => AccessDecision::Denied,
            };
        }
        variable
            .access_rules
            .iter()
            .position(|rule| rule.matches(caller, permission))
            .map(AccessDecision::Rule)
            .unwrap_or(AccessDecision::Denied)
    }

    /// Evaluate, audit, and return `AccessDenied` on refusal
    pub fn check(
        &self,
        session_id: &SessionId,
        variable: &Variable,
        caller: &Caller,
        permission: Permission,
    ) -> VarResult<AccessDecision> {
        let decision = self.evaluate(variable, caller, permission);
        debug!(
            "Access check: session={}, variable={}, caller={}, permission={}, decision={:?}",
            session_id, variable.name, caller.id, permission, decision
        );

        self.audit.record(AuditEvent::AccessChecked {
            session_id: session_id.clone(),
            var_id: variable.id.clone(),
            variable: variable.name.clone(),
            caller: caller.id.clone(),
            permission,
            granted: decision.granted(),
        });

        if decision.granted() {
            Ok(decision)
        } else {
            Err(VarError::AccessDenied {
                caller: caller.id.clone(),
                permission: permission.to_string(),
                variable: variable.name.clone(),
            })
        }
    }
}

impl fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessControl")
            .field("default_access", &self.default_access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TypeTag;
    use crate::domain::value::{Constraints, VariableValue};
    use crate::domain::variable::{CallerKind, VariableId};
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for CountingSink {
        fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn variable(rules: Vec<AccessRule>) -> Variable {
        Variable {
            id: VariableId("var_1".to_string()),
            name: "temperature".to_string(),
            type_tag: TypeTag::Float,
            value: VariableValue::Float(0.7),
            constraints: Constraints::new(),
            metadata: HashMap::new(),
            description: None,
            read_only: false,
            version: 0,
            owner: "orchestrator".to_string(),
            created_by: CallerKind::Owner,
            access_rules: rules,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_owner_always_passes() {
        let sink = Arc::new(CountingSink::default());
        let access = AccessControl::new(sink.clone(), DefaultAccess::Closed);
        let var = variable(vec![]);

        assert_eq!(
            access.check(&"s".into(), &var, &Caller::owner("orchestrator"), Permission::Write).unwrap(),
            AccessDecision::Owner
        );
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_default_access_applies_without_rules() {
        let sink = Arc::new(CountingSink::default());
        let var = variable(vec![]);
        let caller = Caller::consumer("worker-1");

        let open = AccessControl::new(sink.clone(), DefaultAccess::Open);
        assert!(open.check(&"s".into(), &var, &caller, Permission::Write).is_ok());

        let closed = AccessControl::new(sink.clone(), DefaultAccess::Closed);
        assert!(matches!(
            closed.check(&"s".into(), &var, &caller, Permission::Read),
            Err(VarError::AccessDenied { .. })
        ));
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_first_matching_rule_governs() {
        let access = AccessControl::new(Arc::new(CountingSink::default()), DefaultAccess::Open);
        let var = variable(vec![
            AccessRule::glob("worker-*", [Permission::Read]),
            AccessRule::any([Permission::Read, Permission::Write]).with_condition("role", "tuner"),
        ]);

        let worker = Caller::consumer("worker-7");
        assert_eq!(access.evaluate(&var, &worker, Permission::Read), AccessDecision::Rule(0));
        assert_eq!(access.evaluate(&var, &worker, Permission::Write), AccessDecision::Denied);

        let tuner = Caller::consumer("worker-7").with_context("role", "tuner");
        assert_eq!(access.evaluate(&var, &tuner, Permission::Write), AccessDecision::Rule(1));
    }

    #[test]
    fn test_read_does_not_imply_observe() {
        let access = AccessControl::new(Arc::new(CountingSink::default()), DefaultAccess::Open);
        let var = variable(vec![AccessRule::any([Permission::Read])]);

        assert_eq!(
            access.evaluate(&var, &Caller::consumer("w"), Permission::Observe),
            AccessDecision::Denied
        );
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        assert!(AccessRule::glob("worker-[", [Permission::Read]).validate().is_err());
        assert!(AccessRule::glob("worker-*", [Permission::Read]).validate().is_ok());
    }

    #[test]
    fn test_glob_compiles_once_and_survives_clone() {
        let rule = AccessRule::glob("worker-*", [Permission::Read]);
        let SessionPattern::Glob(glob) = &rule.session_pattern else {
            panic!("expected a glob pattern");
        };
        assert!(!glob.is_compiled());

        assert!(rule.matches(&Caller::consumer("worker-1"), Permission::Read));
        assert!(glob.is_compiled());
        let first: *const GlobMatcher = glob.matcher().unwrap();
        let second: *const GlobMatcher = glob.matcher().unwrap();
        assert_eq!(first, second);

        let copy = rule.clone();
        let SessionPattern::Glob(copied) = &copy.session_pattern else {
            panic!("expected a glob pattern");
        };
        assert!(copied.is_compiled());
        assert!(!copy.matches(&Caller::consumer("reader-1"), Permission::Read));
    }

    #[test]
    fn test_glob_rule_serializes_as_plain_pattern() {
        let rule = AccessRule::glob("worker-*", [Permission::Read, Permission::Observe]);
        rule.validate().unwrap();

        let encoded = serde_json::to_value(&rule).unwrap();
        assert_eq!(encoded["session_pattern"], serde_json::json!({ "glob": "worker-*" }));

        let decoded: AccessRule = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, rule);
        assert!(decoded.matches(&Caller::consumer("worker-9"), Permission::Observe));
    }
}
