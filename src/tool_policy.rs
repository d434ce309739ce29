use crate::tools::ToolDescriptor;

/// Match a tool name against a pattern that may contain `*` wildcards.
/// Examples: `*_info` matches `system_info`, `current_*` matches `current_time`.
pub fn matches_wildcard(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut remaining = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !remaining.starts_with(part) {
                return false;
            }
            remaining = &remaining[part.len()..];
        } else if i == parts.len() - 1 {
            return remaining.ends_with(part);
        } else {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

pub fn any_pattern_matches(patterns: &[&str], name: &str) -> bool {
    patterns.iter().any(|p| matches_wildcard(p, name))
}

fn trimmed(patterns: &[String]) -> Vec<&str> {
    patterns
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Retain tools matching at least one allow pattern (all when the allow list
/// is empty), then drop anything matching a deny pattern. Deny wins.
pub fn filter_tools_by_policy(
    tools: Vec<ToolDescriptor>,
    allow_patterns: &[String],
    deny_patterns: &[String],
) -> Vec<ToolDescriptor> {
    let allow = trimmed(allow_patterns);
    let deny = trimmed(deny_patterns);

    tools
        .into_iter()
        .filter(|tool| {
            let name = tool.name.as_str();
            let allowed = allow.is_empty() || any_pattern_matches(&allow, name);
            let denied = !deny.is_empty() && any_pattern_matches(&deny, name);
            if denied {
                tracing::debug!(tool = name, "Tool denied by deny_tools policy");
            }
            allowed && !denied
        })
        .collect()
}

/// Allow patterns without a wildcard that name no available tool.
pub fn unmatched_exact_patterns<'a>(
    tools: &[ToolDescriptor],
    allow_patterns: &'a [String],
) -> Vec<&'a str> {
    trimmed(allow_patterns)
        .into_iter()
        .filter(|pattern| !pattern.contains('*'))
        .filter(|pattern| !tools.iter().any(|tool| tool.name == *pattern))
        .collect()
}
