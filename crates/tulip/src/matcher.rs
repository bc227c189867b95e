//! Enforcement decision functions.
//!
//! A matcher is a plain function value: it receives a read-only
//! [`PolicyView`] over the cached rule sets and the request, and returns
//! allow/deny. The manager invokes it under its cache mutex, so matchers must
//! only read and must not block. Alternative models (role-only, domain-only)
//! are new functions, not new types.

use crate::rules::{Rule, RuleSet};

/// Decision function evaluated against the cached policies.
pub type Matcher = fn(&PolicyView<'_>, &[&str]) -> bool;

/// Read-only view of the base (`p`) and grouping (`g`) rule sets, valid for
/// the duration of one enforcement call.
pub struct PolicyView<'a> {
    p: &'a RuleSet,
    g: &'a RuleSet,
}

impl<'a> PolicyView<'a> {
    pub(crate) fn new(p: &'a RuleSet, g: &'a RuleSet) -> Self {
        Self { p, g }
    }

    /// The base policy whose leading positions equal `rule` exactly, if any.
    pub fn find_exact(&self, rule: &[&str]) -> Option<&Rule> {
        self.p.find(rule)
    }

    /// Base policies matching a wildcard pattern.
    pub fn filter(&self, pattern: &[&str]) -> Vec<Rule> {
        self.p.filter(pattern)
    }

    /// Grouping policies matching a wildcard pattern.
    pub fn filter_groups(&self, pattern: &[&str]) -> Vec<Rule> {
        self.g.filter(pattern)
    }

    /// For each grouping rule, collect the base policies whose position
    /// `policy_value_index` equals the group's `group_value_index` value
    /// (earlier positions wildcard), concatenated in group order.
    pub fn filter_with_groups(
        &self,
        policy_value_index: usize,
        groups: &[Rule],
        group_value_index: usize,
    ) -> Vec<Rule> {
        if groups.is_empty() {
            return Vec::new();
        }
        let mut pattern = vec![""; policy_value_index + 1];
        let mut result = Vec::new();
        for group in groups {
            pattern[policy_value_index] = group.get(group_value_index);
            result.extend(self.p.filter(&pattern));
        }
        result
    }
}

/// Reference matcher for the RBAC-with-domain model:
///
/// ```text
/// r = sub, dom, obj, act
/// p = sub, dom, obj, act
/// g = _, _, _
/// e = some(where (p.eft == allow))
/// m = (r.sub == p.sub || g(r.sub, p.sub, r.dom)) && r.dom == p.dom && r.obj == p.obj && r.act == p.act
/// ```
///
/// # Panics
/// Panics when the request has fewer than four positions.
pub fn rbac_with_domain(view: &PolicyView<'_>, request: &[&str]) -> bool {
    let (sub, dom, obj, act) = (request[0], request[1], request[2], request[3]);
    if view.find_exact(&[sub, dom, obj, act]).is_some() {
        return true;
    }
    // Roles held by the subject in this domain: g = (user, role, domain).
    let groups = view.filter_groups(&[sub, "", dom]);
    let candidates = view.filter_with_groups(0, &groups, 1);
    if candidates.is_empty() {
        return false;
    }
    // The concatenated candidates are not sorted, but a leading wildcard
    // makes the narrowing purely linear.
    candidates
        .iter()
        .any(|policy| policy.matches(&["", dom, obj, act]))
}
