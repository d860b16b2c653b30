//! Capability gate for tool calls. Deny by default: a tool that declares a
//! capability runs only when the context grants it.

use crate::tools::outcome::ToolDecision;
use itertools::Itertools;
use std::collections::BTreeSet;

/// Trim, lower-case, de-duplicate and sort capability names.
pub fn normalize_capabilities<I, S>(caps: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    caps.into_iter()
        .map(|c| c.as_ref().trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .sorted()
        .dedup()
        .collect()
}

#[derive(Debug, Clone)]
pub struct ToolPolicy<'a> {
    pub tool_known: bool,
    pub granted: &'a BTreeSet<String>,
}

pub fn gate_tool_call(tool_name: &str, required: &[String], policy: &ToolPolicy<'_>) -> ToolDecision {
    if !policy.tool_known {
        return ToolDecision::error("unknown_tool", format!("Unknown tool \"{}\".", tool_name));
    }
    if let Some(missing) = required
        .iter()
        .find(|cap| !policy.granted.contains(cap.as_str()))
    {
        let mut decision = ToolDecision::blocked(
            "missing_capability",
            format!(
                "Tool \"{}\" requires capability \"{}\" which is not granted.",
                tool_name, missing
            ),
        );
        decision.capability = Some(missing.clone());
        return decision;
    }
    let capability = if required.is_empty() {
        None
    } else {
        Some(required.join(","))
    };
    ToolDecision::allowed(capability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::outcome::DecisionStatus;

    #[test]
    fn test_normalize_capabilities() {
        assert_eq!(
            normalize_capabilities([" Network ", "filesystem", "network", ""]),
            vec!["filesystem", "network"]
        );
    }

    #[test]
    fn test_deny_by_default() {
        let granted = BTreeSet::new();
        let policy = ToolPolicy {
            tool_known: true,
            granted: &granted,
        };
        let decision = gate_tool_call("fetch", &["network".to_string()], &policy);
        assert_eq!(decision.status, DecisionStatus::Blocked);
        assert_eq!(decision.reason.as_deref(), Some("missing_capability"));
        assert_eq!(decision.capability.as_deref(), Some("network"));
    }

    #[test]
    fn test_granted_and_capability_free_tools_pass() {
        let granted: BTreeSet<String> = ["network".to_string()].into_iter().collect();
        let policy = ToolPolicy {
            tool_known: true,
            granted: &granted,
        };
        let decision = gate_tool_call("fetch", &["network".to_string()], &policy);
        assert!(decision.is_allowed());
        assert_eq!(decision.capability.as_deref(), Some("network"));
        assert!(gate_tool_call("echo", &[], &policy).capability.is_none());
    }
}
