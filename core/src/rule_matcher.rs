//! Rule matching (spec.md §4.4).
//!
//! Given `(host, path)` and a listener's rule list, picks the single most
//! specific match. Specificity, most to least:
//! 1. Host-bearing rules beat host-less rules (among those whose host
//!    actually matches).
//! 2. Among equal host-specificity, path-bearing rules beat path-less.
//! 3. Among equal path-specificity, a longer `rule.path` beats a shorter
//!    one.
//! Ties keep the first match in configuration order.

use crate::config::Rule;

/// Picks the best-matching rule, or `None` if nothing matches.
///
/// `path` is `None` for CONNECT tunnels, where only host-only rules (no
/// `rule.path`) are eligible.
pub fn match_rule<'a>(rules: &'a [Rule], host: Option<&str>, path: Option<&str>) -> Option<&'a Rule> {
    match_rule_index(rules, host, path).map(|i| &rules[i])
}

/// Same as [`match_rule`] but returns the index into `rules`, for callers
/// that need to look up the matching rule's [`crate::rule_runtime::RuleRuntime`]
/// by position rather than by reference.
pub fn match_rule_index(rules: &[Rule], host: Option<&str>, path: Option<&str>) -> Option<usize> {
    let mut best: Option<(usize, (u8, u8, usize))> = None;
    for (i, rule) in rules.iter().enumerate() {
        let Some(rank) = rank(rule, host, path) else {
            continue;
        };
        match &best {
            Some((_, best_rank)) if *best_rank >= rank => {}
            _ => best = Some((i, rank)),
        }
    }
    best.map(|(i, _)| i)
}

/// `None` means the rule is disqualified for this request. Otherwise a
/// tuple ordered so a plain `>` comparison implements the spec's
/// specificity order: (host-bearing, path-bearing, path length).
fn rank(rule: &Rule, host: Option<&str>, path: Option<&str>) -> Option<(u8, u8, usize)> {
    let host_rank = match &rule.host {
        Some(expected) => {
            let actual = host?;
            if !expected.eq_ignore_ascii_case(actual) {
                return None;
            }
            1
        }
        None => 0,
    };

    match (&rule.path, path) {
        // CONNECT tunnels (path == None): only host-only rules qualify.
        (Some(_), None) => None,
        (None, _) => Some((host_rank, 0, 0)),
        (Some(rule_path), Some(request_path)) => {
            if path_matches(rule_path, request_path) {
                Some((host_rank, 1, rule_path.len()))
            } else {
                None
            }
        }
    }
}

/// `rule.path` matches `request_path` iff they're equal, `rule.path` is
/// `"/"`, or `request_path` begins with `rule.path` followed immediately
/// by `/` — so `/app` matches `/app/x` but not `/apple`.
fn path_matches(rule_path: &str, request_path: &str) -> bool {
    if rule_path == "/" || rule_path == request_path {
        return true;
    }
    request_path
        .strip_prefix(rule_path)
        .is_some_and(|rest| rest.starts_with('/'))
}
