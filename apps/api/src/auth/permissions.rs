//! Permission model: parses flat permission strings and answers
//! capability-check queries. Pure, no dependencies on the store or transport.
//!
//! Grammar: `resource:action`, with either half allowed to be `*`, plus the
//! literals `admin` and `*` which grant everything, plus legacy bare-action
//! tokens (e.g. `"read"`). Matching is exact-token or single-sided wildcard;
//! never case-insensitive, never prefix-based.

use serde::{Deserialize, Serialize};

/// An ordered set of permission strings resolved for one call.
/// Immutable once attached to an execution context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    grants: Vec<String>,
}

impl PermissionSet {
    pub fn new(grants: Vec<String>) -> Self {
        Self { grants }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn grants(&self) -> &[String] {
        &self.grants
    }

    /// Whether this set contains a grant-everything token.
    pub fn is_admin(&self) -> bool {
        self.grants.iter().any(|g| g == "admin" || g == "*")
    }

    /// Capability check for one `resource:action` requirement.
    ///
    /// Resolution order (first match wins; all rules are equivalent grants):
    /// 1. `admin` or `*`
    /// 2. exact `resource:action`
    /// 3. `resource:*`
    /// 4. `*:action`
    /// 5. legacy bare `action` token
    pub fn check(&self, resource: &str, action: &str) -> bool {
        if self.is_admin() {
            return true;
        }
        let exact = format!("{resource}:{action}");
        let any_action = format!("{resource}:*");
        let any_resource = format!("*:{action}");
        self.grants.iter().any(|g| {
            g == &exact || g == &any_action || g == &any_resource || g == action
        })
    }

    /// Returns the requirements in `required` that this set does NOT
    /// satisfy; empty means fully authorized. Each requirement is a
    /// `resource:action` pair. Admin short-circuits to fully authorized.
    pub fn check_all<'a>(&self, required: &'a [(String, String)]) -> Vec<&'a (String, String)> {
        if self.is_admin() {
            return Vec::new();
        }
        required
            .iter()
            .filter(|(resource, action)| !self.check(resource, action))
            .collect()
    }
}

/// Splits a `resource:action` requirement string. A bare token is treated
/// as a resource with the implied action `read`.
pub fn parse_requirement(requirement: &str) -> (String, String) {
    match requirement.split_once(':') {
        Some((resource, action)) => (resource.to_string(), action.to_string()),
        None => (requirement.to_string(), "read".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(grants: &[&str]) -> PermissionSet {
        PermissionSet::new(grants.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_admin_grants_everything() {
        let perms = set(&["admin"]);
        assert!(perms.check("anything", "whatever"));
        assert!(perms.check("projects", "delete"));
    }

    #[test]
    fn test_star_grants_everything() {
        let perms = set(&["*"]);
        assert!(perms.check("x", "y"));
    }

    #[test]
    fn test_exact_match() {
        let perms = set(&["experience:read"]);
        assert!(perms.check("experience", "read"));
        assert!(!perms.check("experience", "write"));
        assert!(!perms.check("projects", "read"));
    }

    #[test]
    fn test_resource_wildcard() {
        let perms = set(&["resource:*"]);
        assert!(perms.check("resource", "delete"));
        assert!(perms.check("resource", "read"));
        assert!(!perms.check("other", "read"));
    }

    #[test]
    fn test_action_wildcard() {
        let perms = set(&["*:read"]);
        assert!(perms.check("anything", "read"));
        assert!(!perms.check("anything", "write"));
    }

    #[test]
    fn test_legacy_bare_action_grant() {
        let perms = set(&["read"]);
        assert!(perms.check("projects", "read"));
        assert!(!perms.check("projects", "write"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let perms = set(&["Projects:Read"]);
        assert!(!perms.check("projects", "read"));
    }

    #[test]
    fn test_no_prefix_matching() {
        let perms = set(&["projects:readonly"]);
        assert!(!perms.check("projects", "read"));
    }

    #[test]
    fn test_check_all_reports_unsatisfied() {
        let perms = set(&["projects:read"]);
        let required = vec![
            ("projects".to_string(), "read".to_string()),
            ("projects".to_string(), "write".to_string()),
            ("skills".to_string(), "read".to_string()),
        ];
        let missing = perms.check_all(&required);
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].1, "write");
    }

    #[test]
    fn test_check_all_admin_short_circuits() {
        let perms = set(&["admin"]);
        let required = vec![("a".to_string(), "b".to_string())];
        assert!(perms.check_all(&required).is_empty());
    }

    #[test]
    fn test_parse_requirement_bare_token_implies_read() {
        assert_eq!(
            parse_requirement("projects"),
            ("projects".to_string(), "read".to_string())
        );
        assert_eq!(
            parse_requirement("projects:write"),
            ("projects".to_string(), "write".to_string())
        );
    }
}
