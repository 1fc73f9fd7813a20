use crate::runner::{InvocationResult, InvocationStatus};
use crate::work::WorkItem;
use serde::Serialize;
use std::time::Duration;

/// Substrings whose presence in captured output suggests command execution.
const RCE_INDICATORS: &[&str] = &[
    "uid=",
    "gid=",
    "root:",
    "etc/passwd",
    "etc/shadow",
    "vulnerable",
    "bash",
    "whoami",
    "uname -a",
    "id:",
    "successfully executed",
];

/// Substrings suggesting the injected command was rejected by the target.
const NEGATIVE_INDICATORS: &[&str] = &["command not found", "permission denied"];

/// Weight added per matched indicator substring.
const INDICATOR_WEIGHT: i64 = 2;

/// A successful invocation slower than this earns a timing bonus; sleep- and
/// ping-style payloads show up as response-time deltas rather than output.
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_secs(5);

/// One invocation outcome paired with its score and enumeration position.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredResult {
    /// Position in enumeration order; breaks score ties deterministically.
    pub index: usize,
    pub item: WorkItem,
    pub result: InvocationResult,
    pub score: u32,
}

/// Vulnerability-likelihood score for one invocation result.
///
/// Pure function of the result and the extractor's flag: identical inputs
/// always produce identical scores, so summaries can be rebuilt from
/// persisted results.
pub fn score(result: &InvocationResult, parameter_flagged: bool) -> u32 {
    if !result.spawned {
        return 0;
    }
    let output = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();

    let mut value: i64 = 0;
    for indicator in RCE_INDICATORS {
        if output.contains(indicator) {
            value += INDICATOR_WEIGHT;
        }
    }
    for indicator in NEGATIVE_INDICATORS {
        if output.contains(indicator) {
            value -= 1;
        }
    }
    if result.status == InvocationStatus::Success && result.duration >= SLOW_RESPONSE_THRESHOLD {
        value += 1;
    }
    if parameter_flagged {
        value += 1;
    }
    value.max(0) as u32
}

/// One row of the aggregated run summary.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryEntry {
    pub domain: String,
    pub url: String,
    pub payload: String,
    pub status: InvocationStatus,
    pub score: u32,
    pub attempt_count: u32,
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    pub output_snippet: String,
    pub error_snippet: String,
}

/// Per-domain rollup over the summary entries.
#[derive(Debug, Clone, Serialize)]
pub struct DomainRollup {
    pub domain: String,
    pub items: usize,
    pub flagged_items: usize,
    pub top_score: u32,
}

/// The full aggregated view handed to the report emitter.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub entries: Vec<SummaryEntry>,
    pub domains: Vec<DomainRollup>,
}

const SNIPPET_LEN: usize = 100;

fn snippet(text: &str) -> String {
    if text.chars().count() > SNIPPET_LEN {
        let truncated: String = text.chars().take(SNIPPET_LEN).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

/// Builds the sorted summary: entries descending by score, ties broken by
/// enumeration order; domain rollups descending by their top score.
pub fn aggregate(results: &[ScoredResult]) -> Summary {
    let mut entries: Vec<(usize, SummaryEntry)> = results
        .iter()
        .map(|scored| {
            (
                scored.index,
                SummaryEntry {
                    domain: scored.item.domain(),
                    url: scored.item.url.clone(),
                    payload: scored.item.payload.clone(),
                    status: scored.result.status,
                    score: scored.score,
                    attempt_count: scored.result.attempt_count,
                    exit_code: scored.result.exit_code,
                    duration_ms: scored.result.duration.as_millis(),
                    output_snippet: snippet(&scored.result.stdout),
                    error_snippet: snippet(&scored.result.stderr),
                },
            )
        })
        .collect();
    entries.sort_by(|(ia, a), (ib, b)| b.score.cmp(&a.score).then(ia.cmp(ib)));

    let mut domains: Vec<DomainRollup> = Vec::new();
    for (_, entry) in &entries {
        match domains.iter_mut().find(|d| d.domain == entry.domain) {
            Some(rollup) => {
                rollup.items += 1;
                if entry.score > 0 {
                    rollup.flagged_items += 1;
                }
                rollup.top_score = rollup.top_score.max(entry.score);
            }
            None => domains.push(DomainRollup {
                domain: entry.domain.clone(),
                items: 1,
                flagged_items: usize::from(entry.score > 0),
                top_score: entry.score,
            }),
        }
    }
    // Entries are already score-sorted, so first-seen domain order gives a
    // stable score-descending rollup; make the ordering explicit anyway.
    domains.sort_by(|a, b| b.top_score.cmp(&a.top_score));

    Summary {
        entries: entries.into_iter().map(|(_, e)| e).collect(),
        domains,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(stdout: &str, status: InvocationStatus, duration: Duration) -> InvocationResult {
        InvocationResult {
            work_item_id: "abc".to_string(),
            attempt_count: 1,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration,
            timed_out: false,
            spawned: true,
            status,
        }
    }

    fn scored(index: usize, url: &str, payload: &str, score_value: u32) -> ScoredResult {
        let item = WorkItem::new(url, payload);
        let result = result_with("", InvocationStatus::Success, Duration::from_millis(10));
        ScoredResult {
            index,
            item,
            result,
            score: score_value,
        }
    }

    #[test]
    fn scoring_is_deterministic_for_identical_inputs() {
        let result = result_with(
            "uid=0(root) gid=0(root)",
            InvocationStatus::Success,
            Duration::from_millis(200),
        );
        let first = score(&result, true);
        for _ in 0..10 {
            assert_eq!(score(&result, true), first);
        }
    }

    #[test]
    fn indicators_add_weight_and_negatives_subtract() {
        let hit = result_with(
            "uid=1000 gid=1000",
            InvocationStatus::Success,
            Duration::from_millis(10),
        );
        assert_eq!(score(&hit, false), 4);

        let rejected = result_with(
            "sh: 1: id: command not found",
            InvocationStatus::Success,
            Duration::from_millis(10),
        );
        // "id:" indicator (+2) minus the negative marker (-1).
        assert_eq!(score(&rejected, false), 1);

        let nothing = result_with("plain page", InvocationStatus::Success, Duration::from_millis(10));
        assert_eq!(score(&nothing, false), 0);
    }

    #[test]
    fn score_never_goes_negative() {
        let rejected = result_with(
            "permission denied",
            InvocationStatus::Failure,
            Duration::from_millis(10),
        );
        assert_eq!(score(&rejected, false), 0);
    }

    #[test]
    fn slow_success_and_flagged_parameter_add_bonuses() {
        let slow = result_with("x", InvocationStatus::Success, Duration::from_secs(6));
        assert_eq!(score(&slow, false), 1);
        assert_eq!(score(&slow, true), 2);

        let slow_timeout = result_with("x", InvocationStatus::Timeout, Duration::from_secs(6));
        assert_eq!(score(&slow_timeout, false), 0, "timing bonus requires success");
    }

    #[test]
    fn unspawned_results_always_score_zero() {
        let mut dry = result_with("uid=0", InvocationStatus::Success, Duration::from_secs(10));
        dry.spawned = false;
        assert_eq!(score(&dry, true), 0);
    }

    #[test]
    fn aggregation_sorts_by_score_then_enumeration_order() {
        let results = vec![
            scored(0, "http://a.com/?x=1", "p0", 2),
            scored(1, "http://b.com/?x=1", "p1", 5),
            scored(2, "http://a.com/?x=2", "p2", 2),
            scored(3, "http://c.com/?x=1", "p3", 0),
        ];
        let summary = aggregate(&results);
        let scores: Vec<u32> = summary.entries.iter().map(|e| e.score).collect();
        assert_eq!(scores, vec![5, 2, 2, 0]);
        // Tie between indices 0 and 2 resolves in enumeration order.
        assert_eq!(summary.entries[1].payload, "p0");
        assert_eq!(summary.entries[2].payload, "p2");
    }

    #[test]
    fn aggregation_rolls_up_per_domain() {
        let results = vec![
            scored(0, "http://a.com/?x=1", "p0", 2),
            scored(1, "http://b.com/?x=1", "p1", 5),
            scored(2, "http://a.com/?x=2", "p2", 0),
        ];
        let summary = aggregate(&results);
        assert_eq!(summary.domains.len(), 2);
        assert_eq!(summary.domains[0].domain, "b.com");
        assert_eq!(summary.domains[0].top_score, 5);
        let a = summary.domains.iter().find(|d| d.domain == "a.com").unwrap();
        assert_eq!(a.items, 2);
        assert_eq!(a.flagged_items, 1);
    }
}
