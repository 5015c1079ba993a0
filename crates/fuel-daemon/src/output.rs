//! Parsing of agent output: stream-json summaries and review verdicts.

use serde_json::Value;

/// Largest output kept on a run record.
pub const MAX_RUN_OUTPUT_BYTES: usize = 64 * 1024;

/// Facts an agent reports about its own session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSummary {
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
}

/// Read the last stream-json `result` line, if any.
pub fn parse_agent_summary(stdout: &str) -> AgentSummary {
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find(|v| v.get("type").and_then(Value::as_str) == Some("result"))
        .map(|v| AgentSummary {
            session_id: v.get("session_id").and_then(Value::as_str).map(str::to_owned),
            cost_usd: v
                .get("total_cost_usd")
                .or_else(|| v.get("cost_usd"))
                .and_then(Value::as_f64),
        })
        .unwrap_or_default()
}

/// Outcome of a review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewVerdict {
    pub passed: bool,
    pub issues: Vec<String>,
}

/// Find the reviewer's verdict in its output.
///
/// Looks for a JSON object `{"review": "pass"|"fail", "issues": [...]}`,
/// either on its own line or inside a stream-json `result` text, then for
/// the `REVIEW_FAILED` / `REVIEW_PASSED` markers. No verdict counts as a pass.
pub fn parse_review_verdict(output: &str) -> ReviewVerdict {
    let mut texts: Vec<String> = vec![output.to_string()];
    for line in output.lines() {
        if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
            if let Some(result) = value.get("result").and_then(Value::as_str) {
                texts.push(result.to_string());
            }
        }
    }

    for text in &texts {
        for line in text.lines().rev() {
            if let Some(verdict) = verdict_from_json(line.trim()) {
                return verdict;
            }
        }
    }

    if texts.iter().any(|t| t.contains("REVIEW_FAILED")) {
        return ReviewVerdict {
            passed: false,
            issues: Vec::new(),
        };
    }
    ReviewVerdict {
        passed: true,
        issues: Vec::new(),
    }
}

fn verdict_from_json(line: &str) -> Option<ReviewVerdict> {
    if !line.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let passed = match value.get("review")?.as_str()? {
        "pass" | "passed" => true,
        "fail" | "failed" => false,
        _ => return None,
    };
    let issues = value
        .get("issues")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    Some(ReviewVerdict { passed, issues })
}

/// The last `max_bytes` of `text`, cut on a character boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
