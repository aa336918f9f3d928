//! Policy engine: branch/author/time-window/parameter/required-approval/
//! OPA rules evaluated in ascending priority order, with a deny
//! short-circuiting the rest. `required-approval` never denies; it
//! accumulates an [`ApprovalOverride`] the caller merges onto the stage's
//! approval config.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::time::Duration;

use anyhow::Result;
use chengis_environment::Clock;
use chengis_process::{ProcessSpec, SecretMasker, command_exists, run};
use chengis_types::{ApprovalOverride, ParameterOperator, PolicyAction, PolicyResult, PolicyRule};
use regex::Regex;

/// Everything a policy rule needs to read about the build it is gating.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub build_id: String,
    pub job_id: String,
    pub org_id: String,
    pub branch: Option<String>,
    pub author: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub stage_name: Option<String>,
}

/// Translate a glob pattern (`*` and `?` wildcards) into an anchored
/// regex and test it against `text`. Malformed patterns never match.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut regex_src = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            other => regex_src.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).is_ok_and(|re| re.is_match(text))
}

fn branch_restriction(branches: &[String], action: PolicyAction, ctx: &PolicyContext) -> bool {
    let Some(branch) = &ctx.branch else { return false };
    let matched = branches.iter().any(|pattern| glob_match(pattern, branch));
    match action {
        PolicyAction::Allow => !matched,
        PolicyAction::Deny => matched,
    }
}

fn author_restriction(authors: &[String], action: PolicyAction, ctx: &PolicyContext) -> bool {
    let Some(author) = &ctx.author else { return false };
    let matched = authors.iter().any(|pattern| glob_match(pattern, author));
    match action {
        PolicyAction::Allow => !matched,
        PolicyAction::Deny => matched,
    }
}

fn time_window(timezone: &str, days: &[u8], start_hour: u8, end_hour: u8, action: PolicyAction, clock: &dyn Clock) -> bool {
    let tz: chrono_tz::Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    let now = clock.now().with_timezone(&tz);
    let day = now.format("%w").to_string().parse::<u8>().unwrap_or(0);
    let day_matches = days.is_empty() || days.contains(&day);
    let hour = now.format("%H").to_string().parse::<u8>().unwrap_or(0);
    let in_window = day_matches && hour >= start_hour && hour < end_hour;
    match action {
        PolicyAction::Allow => !in_window,
        PolicyAction::Deny => in_window,
    }
}

fn parameter_restriction(parameter: &str, operator: ParameterOperator, value: &str, ctx: &PolicyContext) -> bool {
    let Some(actual) = ctx.parameters.get(parameter) else { return false };
    match operator {
        ParameterOperator::Equals => actual == value,
        ParameterOperator::NotEquals => actual != value,
        ParameterOperator::Matches => Regex::new(value).is_ok_and(|re| re.is_match(actual)),
    }
}

#[derive(Debug, serde::Serialize)]
struct OpaInput<'a> {
    build_id: &'a str,
    job_id: &'a str,
    org_id: &'a str,
    branch: Option<&'a str>,
    author: Option<&'a str>,
    parameters: &'a BTreeMap<String, String>,
    stage_name: Option<&'a str>,
}

/// Invoke `opa eval` against `policy_path` with the build context as JSON
/// input. Exit 127 / missing binary allows (OPA unavailable is not a
/// deny); timeout or an unparseable result denies.
fn opa_allows(policy_path: &str, timeout_ms: u64, ctx: &PolicyContext) -> Result<bool> {
    if !command_exists("opa") {
        return Ok(true);
    }

    let input = OpaInput {
        build_id: &ctx.build_id,
        job_id: &ctx.job_id,
        org_id: &ctx.org_id,
        branch: ctx.branch.as_deref(),
        author: ctx.author.as_deref(),
        parameters: &ctx.parameters,
        stage_name: ctx.stage_name.as_deref(),
    };

    let mut input_file = tempfile::NamedTempFile::new()?;
    input_file.write_all(serde_json::to_string(&input)?.as_bytes())?;
    let input_path = input_file.path().to_string_lossy().to_string();

    let workdir = std::env::temp_dir();
    let spec = ProcessSpec::new("opa", workdir)
        .args(["eval", "--format", "raw", "--input", &input_path, "--data", policy_path, "data.chengis.allow"])
        .timeout(Duration::from_millis(timeout_ms));

    let result = run(&spec, &SecretMasker::default(), |_, _| {}, |_| {})?;
    if result.timed_out {
        return Ok(false);
    }
    match result.stdout.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Ok(false),
    }
}

/// Evaluate every rule in ascending priority order. A `Deny` short-circuits
/// immediately; `required-approval` rules accumulate into a single merged
/// override returned once all rules have run.
pub fn evaluate(rules: &[PolicyRule], ctx: &PolicyContext, clock: &dyn Clock) -> Result<PolicyResult> {
    let mut ordered: Vec<&PolicyRule> = rules.iter().collect();
    ordered.sort_by_key(|r| r.priority());

    let mut override_acc: Option<ApprovalOverride> = None;

    for (index, rule) in ordered.iter().enumerate() {
        match rule {
            PolicyRule::BranchRestriction { branches, action, .. } => {
                if branch_restriction(branches, *action, ctx) {
                    return Ok(PolicyResult::Deny { rule_index: index, reason: "branch restriction".into() });
                }
            }
            PolicyRule::AuthorRestriction { authors, action, .. } => {
                if author_restriction(authors, *action, ctx) {
                    return Ok(PolicyResult::Deny { rule_index: index, reason: "author restriction".into() });
                }
            }
            PolicyRule::TimeWindow { timezone, days, start_hour, end_hour, action, .. } => {
                if time_window(timezone, days, *start_hour, *end_hour, *action, clock) {
                    return Ok(PolicyResult::Deny { rule_index: index, reason: "time window restriction".into() });
                }
            }
            PolicyRule::ParameterRestriction { parameter, operator, value, action, .. } => {
                let matches = parameter_restriction(parameter, *operator, value, ctx);
                let deny = match action {
                    PolicyAction::Deny => matches,
                    PolicyAction::Allow => !matches,
                };
                if deny {
                    return Ok(PolicyResult::Deny { rule_index: index, reason: format!("parameter restriction on {parameter}") });
                }
            }
            PolicyRule::RequiredApproval { min_approvals, approver_group, .. } => {
                let entry = override_acc.get_or_insert_with(|| ApprovalOverride { min_approvals: 0, approver_group: vec![] });
                entry.min_approvals = entry.min_approvals.max(*min_approvals);
                for approver in approver_group {
                    if !entry.approver_group.contains(approver) {
                        entry.approver_group.push(approver.clone());
                    }
                }
            }
            PolicyRule::Opa { policy_path, timeout_ms, .. } => {
                if !opa_allows(policy_path, *timeout_ms, ctx)? {
                    return Ok(PolicyResult::Deny { rule_index: index, reason: "opa policy denied".into() });
                }
            }
        }
    }

    Ok(override_acc.map(PolicyResult::ApprovalOverride).unwrap_or(PolicyResult::Allow))
}

/// `policy-engine` feature flag off: always proceed without evaluating
/// any rule.
pub fn evaluate_if_enabled(enabled: bool, rules: &[PolicyRule], ctx: &PolicyContext, clock: &dyn Clock) -> Result<PolicyResult> {
    if !enabled {
        return Ok(PolicyResult::Allow);
    }
    evaluate(rules, ctx, clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_environment::SystemClock;

    fn ctx() -> PolicyContext {
        PolicyContext {
            build_id: "b1".into(),
            job_id: "j1".into(),
            org_id: "acme".into(),
            branch: Some("feature/foo".into()),
            author: Some("bob".into()),
            parameters: BTreeMap::new(),
            stage_name: Some("deploy".into()),
        }
    }

    #[test]
    fn glob_matches_wildcard_prefix() {
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("release/*", "feature/foo"));
    }

    #[test]
    fn branch_restriction_denies_on_deny_match() {
        let rule = PolicyRule::BranchRestriction { priority: 0, branches: vec!["feature/*".into()], action: PolicyAction::Deny };
        let result = evaluate(&[rule], &ctx(), &SystemClock).unwrap();
        assert!(matches!(result, PolicyResult::Deny { rule_index: 0, .. }));
    }

    #[test]
    fn branch_restriction_allows_when_branch_matches_allow_list() {
        let rule = PolicyRule::BranchRestriction { priority: 0, branches: vec!["feature/*".into()], action: PolicyAction::Allow };
        let result = evaluate(&[rule], &ctx(), &SystemClock).unwrap();
        assert!(matches!(result, PolicyResult::Allow));
    }

    #[test]
    fn lower_priority_deny_short_circuits_before_later_rules() {
        let deny = PolicyRule::AuthorRestriction { priority: 0, authors: vec!["bob".into()], action: PolicyAction::Deny };
        let approval = PolicyRule::RequiredApproval { priority: 1, stages: vec!["deploy".into()], min_approvals: 2, approver_group: vec!["alice".into()] };
        let result = evaluate(&[approval, deny], &ctx(), &SystemClock).unwrap();
        assert!(matches!(result, PolicyResult::Deny { rule_index: 0, .. }));
    }

    #[test]
    fn required_approval_rules_merge_max_and_union() {
        let a = PolicyRule::RequiredApproval { priority: 0, stages: vec!["deploy".into()], min_approvals: 1, approver_group: vec!["alice".into()] };
        let b = PolicyRule::RequiredApproval { priority: 1, stages: vec!["deploy".into()], min_approvals: 3, approver_group: vec!["bob".into()] };
        let result = evaluate(&[a, b], &ctx(), &SystemClock).unwrap();
        match result {
            PolicyResult::ApprovalOverride(o) => {
                assert_eq!(o.min_approvals, 3);
                assert_eq!(o.approver_group, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("expected approval override, got {other:?}"),
        }
    }

    #[test]
    fn parameter_restriction_matches_regex_operator() {
        let mut with_param = ctx();
        with_param.parameters.insert("target".into(), "prod-east".into());
        let rule = PolicyRule::ParameterRestriction {
            priority: 0,
            parameter: "target".into(),
            operator: ParameterOperator::Matches,
            value: "^prod-.*".into(),
            action: PolicyAction::Deny,
        };
        let result = evaluate(&[rule], &with_param, &SystemClock).unwrap();
        assert!(matches!(result, PolicyResult::Deny { .. }));
    }

    #[test]
    fn disabled_feature_flag_always_allows() {
        let rule = PolicyRule::AuthorRestriction { priority: 0, authors: vec!["bob".into()], action: PolicyAction::Deny };
        let result = evaluate_if_enabled(false, &[rule], &ctx(), &SystemClock).unwrap();
        assert!(matches!(result, PolicyResult::Allow));
    }

    #[test]
    fn opa_allows_when_binary_missing() {
        assert!(opa_allows("/nonexistent/policy.rego", 100, &ctx()).unwrap());
    }
}
