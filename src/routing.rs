//! Mode router + pattern matcher: the hybrid AI/code routing decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node's configured execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    AiOnly,
    CodeOnly,
    Hybrid,
    AbTest,
}

/// Which path was actually chosen, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub path: Path,
    pub reason: String,
    pub confidence: Option<f64>,
    pub matched_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    Ai,
    Code,
}

/// Default hybrid-mode confidence threshold.
pub const DEFAULT_HYBRID_THRESHOLD: f64 = 80.0;

/// A pattern extracted from generated code: a simple `if`/`switch`-style guard
/// plus whether it matched the given input. The extraction itself (parsing
/// generated code into these patterns) is the responsibility of the code
/// generator that produced `generated_code`; this module only scores matches
/// the caller has already extracted via [`extract_patterns`].
#[derive(Debug, Clone)]
pub struct Pattern {
    pub is_switch_case: bool,
    pub matched: bool,
}

/// Extract simple structural patterns from a generated-code string: `switch`/
/// `match` arms and `if`/`else`/regex-test/`typeof` guards. This is a heuristic,
/// line-oriented scan — good enough to drive confidence scoring, not a real
/// code generator's parser.
pub fn extract_patterns(generated_code: &str, input: &Value) -> Vec<Pattern> {
    let mut patterns = Vec::new();
    for line in generated_code.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("case ") || trimmed.starts_with("switch") {
            let matched = line_guard_matches(trimmed, input);
            patterns.push(Pattern { is_switch_case: true, matched });
        } else if trimmed.starts_with("if ")
            || trimmed.starts_with("} else if")
            || trimmed.contains(".test(")
            || trimmed.contains("typeof ")
        {
            let matched = line_guard_matches(trimmed, input);
            patterns.push(Pattern { is_switch_case: false, matched });
        }
    }
    patterns
}

/// Very small heuristic: a guard "matches" an input if any string value inside
/// the input JSON appears verbatim inside the guard line. Real pattern
/// extraction is a generator-specific concern outside this engine's contract.
fn line_guard_matches(line: &str, input: &Value) -> bool {
    fn walk(value: &Value, line: &str) -> bool {
        match value {
            Value::String(s) => !s.is_empty() && line.contains(s.as_str()),
            Value::Object(map) => map.values().any(|v| walk(v, line)),
            Value::Array(items) => items.iter().any(|v| walk(v, line)),
            _ => false,
        }
    }
    walk(input, line)
}

/// Confidence score in `0..=100` for the extracted patterns against `input`.
pub fn match_confidence(patterns: &[Pattern]) -> f64 {
    if patterns.is_empty() {
        return 0.0;
    }
    if let Some(case) = patterns.iter().find(|p| p.is_switch_case && p.matched) {
        let _ = case;
        return 95.0;
    }
    let total = patterns.len() as f64;
    let matched = patterns.iter().filter(|p| p.matched).count() as f64;
    if matched == total {
        return 90.0;
    }
    let base = 80.0;
    (matched / total) * base
}

/// djb2 hash, used for deterministic A/B bucketing.
pub fn djb2_hash(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

/// Decide which path a node should execute through.
///
/// `has_generated_code` / `generated_code` describe the node's pre-generated
/// code, if any; `block_id` is the stable identifier `ab_test` buckets on.
pub fn route(
    mode: ExecutionMode,
    generated_code: Option<&str>,
    input: &Value,
    block_id: &str,
    threshold: f64,
) -> RoutingDecision {
    match mode {
        ExecutionMode::AiOnly => RoutingDecision {
            path: Path::Ai,
            reason: "ai_only mode".into(),
            confidence: None,
            matched_pattern: None,
        },
        ExecutionMode::CodeOnly => {
            if generated_code.is_some() {
                RoutingDecision {
                    path: Path::Code,
                    reason: "code_only mode with generated code".into(),
                    confidence: None,
                    matched_pattern: None,
                }
            } else {
                RoutingDecision {
                    path: Path::Ai,
                    reason: "code_only mode but no generated code available".into(),
                    confidence: None,
                    matched_pattern: None,
                }
            }
        }
        ExecutionMode::Hybrid => {
            let Some(code) = generated_code else {
                return RoutingDecision {
                    path: Path::Ai,
                    reason: "hybrid mode but no generated code available".into(),
                    confidence: None,
                    matched_pattern: None,
                };
            };
            let patterns = extract_patterns(code, input);
            let confidence = match_confidence(&patterns);
            if confidence >= threshold {
                RoutingDecision {
                    path: Path::Code,
                    reason: format!("hybrid match confidence {confidence:.1} >= threshold {threshold:.1}"),
                    confidence: Some(confidence),
                    matched_pattern: patterns.iter().find(|p| p.matched).map(|p| {
                        if p.is_switch_case {
                            "switch_case".to_string()
                        } else {
                            "guard".to_string()
                        }
                    }),
                }
            } else {
                RoutingDecision {
                    path: Path::Ai,
                    reason: format!("hybrid match confidence {confidence:.1} < threshold {threshold:.1}"),
                    confidence: Some(confidence),
                    matched_pattern: None,
                }
            }
        }
        ExecutionMode::AbTest => {
            let bucket_code = djb2_hash(block_id) % 2 == 0;
            if bucket_code && generated_code.is_some() {
                RoutingDecision {
                    path: Path::Code,
                    reason: "ab_test bucketed to code".into(),
                    confidence: None,
                    matched_pattern: None,
                }
            } else {
                RoutingDecision {
                    path: Path::Ai,
                    reason: if bucket_code {
                        "ab_test bucketed to code but no generated code; falling back to ai".into()
                    } else {
                        "ab_test bucketed to ai".into()
                    },
                    confidence: None,
                    matched_pattern: None,
                }
            }
        }
    }
}
