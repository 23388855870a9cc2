//! Context window truncation.
//!
//! Fits a thread's history into a token budget without breaking the
//! structure the upstream expects: system instructions and the newest user
//! message always survive, and an assistant tool call is never separated from
//! the tool results that answer it.

use std::collections::HashSet;

use serde_json::Value;

use crate::types::{ContentPart, ModelMessage, Role};

/// Characters reserved for the truncation marker when sizing a cut.
const MARKER_ALLOWANCE: usize = 64;

/// Token budget for one upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_tokens: usize,
    pub threshold_percent: u8,
}

impl ContextBudget {
    pub fn new(max_tokens: usize, threshold_percent: u8) -> Self {
        Self {
            max_tokens,
            threshold_percent: threshold_percent.clamp(1, 100),
        }
    }

    /// Effective ceiling: `max_tokens * threshold / 100`.
    pub fn limit(&self) -> usize {
        self.max_tokens.saturating_mul(self.threshold_percent as usize) / 100
    }
}

pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

pub fn estimate_message_tokens(message: &ModelMessage) -> usize {
    let mut tokens = 4usize;
    for part in &message.content {
        tokens += match part {
            ContentPart::Text { text } => estimate_text_tokens(text),
            ContentPart::ToolCall(tc) => {
                let args = serde_json::to_string(&tc.arguments).unwrap_or_default();
                estimate_text_tokens(&tc.name) + estimate_text_tokens(&args) + 8
            }
            ContentPart::ToolResult(result) => {
                estimate_text_tokens(&result.tool_call_id)
                    + estimate_text_tokens(&result_text(&result.result))
                    + 8
            }
        };
    }
    if let Some(name) = &message.name {
        tokens += estimate_text_tokens(name);
    }
    tokens
}

pub fn estimate_tokens(messages: &[ModelMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Marker spliced in where content was cut.
pub fn truncation_marker(removed_chars: usize) -> String {
    format!("[... truncated {removed_chars} characters ...]")
}

/// Budget-driven history truncator.
#[derive(Debug, Clone, Copy)]
pub struct Truncator {
    budget: ContextBudget,
}

impl Truncator {
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    /// Return the subset of `messages` to send upstream, in original order.
    ///
    /// Whole units are evicted oldest first. If the pinned remainder is still
    /// over the limit, the largest text parts are cut down and marked. The
    /// result can exceed the limit only when per-message overhead alone does.
    pub fn truncate(&self, messages: &[ModelMessage]) -> Vec<ModelMessage> {
        let limit = self.budget.limit();
        let mut total = estimate_tokens(messages);
        if total <= limit {
            return messages.to_vec();
        }

        let units = group_units(messages);
        let last_user = messages.iter().rposition(|m| m.role == Role::User);
        let mut keep = vec![true; units.len()];

        for (idx, unit) in units.iter().enumerate() {
            if total <= limit {
                break;
            }
            // The newest user message and the turn in progress after it are pinned.
            let pinned = last_user.is_some_and(|u| unit.end > u)
                || unit.clone().any(|i| messages[i].role == Role::System);
            if pinned {
                continue;
            }
            total -= unit.clone().map(|i| estimate_message_tokens(&messages[i])).sum::<usize>();
            keep[idx] = false;
        }

        let mut kept: Vec<ModelMessage> = units
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| **keep)
            .flat_map(|(unit, _)| unit.clone().map(|i| messages[i].clone()))
            .collect();

        if total > limit {
            shrink_parts(&mut kept, limit);
        }
        kept
    }
}

/// Contiguous index ranges that must be kept or dropped together.
fn group_units(messages: &[ModelMessage]) -> Vec<std::ops::Range<usize>> {
    let mut units = Vec::new();
    let mut idx = 0;
    while idx < messages.len() {
        let start = idx;
        let calls: HashSet<&str> = messages[idx]
            .tool_calls()
            .into_iter()
            .map(|call| call.id.as_str())
            .collect();
        idx += 1;
        if messages[start].role == Role::Assistant && !calls.is_empty() {
            while idx < messages.len()
                && messages[idx].role == Role::Tool
                && messages[idx]
                    .tool_result_ids()
                    .iter()
                    .all(|id| calls.contains(id))
            {
                idx += 1;
            }
        }
        units.push(start..idx);
    }
    units
}

fn result_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn part_len(part: &ContentPart) -> Option<usize> {
    match part {
        ContentPart::Text { text } => Some(text.chars().count()),
        ContentPart::ToolResult(result) => Some(result_text(&result.result).chars().count()),
        ContentPart::ToolCall(_) => None,
    }
}

fn cut(text: &str, keep_chars: usize) -> String {
    let total = text.chars().count();
    let mut out: String = text.chars().take(keep_chars).collect();
    out.push_str(&truncation_marker(total - keep_chars.min(total)));
    out
}

/// Cut the largest parts, biggest first, until the estimate fits.
fn shrink_parts(messages: &mut [ModelMessage], limit: usize) {
    let mut candidates: Vec<(usize, usize, usize)> = messages
        .iter()
        .enumerate()
        .flat_map(|(m, msg)| {
            msg.content
                .iter()
                .enumerate()
                .filter_map(move |(p, part)| part_len(part).map(|len| (m, p, len)))
        })
        .filter(|(_, _, len)| *len > MARKER_ALLOWANCE)
        .collect();
    candidates.sort_by(|a, b| b.2.cmp(&a.2));

    for (m, p, len) in candidates {
        let total = estimate_tokens(messages);
        if total <= limit {
            return;
        }
        let excess_chars = (total - limit).saturating_mul(4) + MARKER_ALLOWANCE;
        let keep = len.saturating_sub(excess_chars);
        match &mut messages[m].content[p] {
            ContentPart::Text { text } => *text = cut(text, keep),
            ContentPart::ToolResult(result) => {
                let text = result_text(&result.result);
                result.result = Value::String(cut(&text, keep));
            }
            ContentPart::ToolCall(_) => {}
        }
    }
}
