//! Table-driven delta normalizer state machine.

use serde_json::Value;
use uuid::Uuid;

use super::markers::MarkerTable;
use super::NormalizeStream;
use crate::types::{CanonicalEvent, FinishReason, RawFragment, StreamErrorKind, Usage};

/// Default cap on accumulated tool-call text.
pub const DEFAULT_MAX_TOOL_CALL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Plain,
    Reasoning,
    ToolOpen,
    ToolBody,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    EnterReasoning,
    LeaveReasoning,
    StripAnswer,
    OpenTool,
}

#[derive(Debug)]
struct NativeCall {
    index: usize,
    call_id: String,
    name: Option<String>,
    arguments: String,
}

enum PayloadError {
    /// Not yet parseable; keep accumulating.
    Incomplete,
    /// Parses, but is not a tool call.
    Shape(String),
}

/// One state machine for every marker-based backend family.
pub struct MarkerNormalizer {
    table: MarkerTable,
    plain_markers: Vec<(String, Transition)>,
    reasoning_markers: Vec<(String, Transition)>,
    state: State,
    pending: String,
    tool_buffer: String,
    current_call: String,
    native: Option<NativeCall>,
    id_prefix: String,
    next_call: usize,
    max_tool_call_bytes: usize,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl MarkerNormalizer {
    pub fn new(table: MarkerTable) -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        let mut plain_markers = Vec::new();
        let mut reasoning_markers = Vec::new();
        if let Some(pair) = &table.reasoning {
            plain_markers.push((pair.open.clone(), Transition::EnterReasoning));
            reasoning_markers.push((pair.close.clone(), Transition::LeaveReasoning));
        }
        if let Some(pair) = &table.answer {
            plain_markers.push((pair.open.clone(), Transition::StripAnswer));
            plain_markers.push((pair.close.clone(), Transition::StripAnswer));
        }
        if let Some(tool) = &table.tool {
            plain_markers.push((tool.open.clone(), Transition::OpenTool));
        }
        plain_markers.retain(|(literal, _)| !literal.is_empty());
        reasoning_markers.retain(|(literal, _)| !literal.is_empty());

        Self {
            table,
            plain_markers,
            reasoning_markers,
            state: State::Plain,
            pending: String::new(),
            tool_buffer: String::new(),
            current_call: String::new(),
            native: None,
            id_prefix: format!("call_{}", &simple[..12]),
            next_call: 0,
            max_tool_call_bytes: DEFAULT_MAX_TOOL_CALL_BYTES,
            finish_reason: None,
            usage: None,
        }
    }

    /// Use a fixed call-id prefix; ids become `<prefix>_<n>`.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    pub fn with_max_tool_call_bytes(mut self, max: usize) -> Self {
        self.max_tool_call_bytes = max.max(1);
        self
    }

    /// Usage reported by the upstream `Finish` fragment, if any.
    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    fn allocate_call_id(&mut self) -> String {
        let id = format!("{}_{}", self.id_prefix, self.next_call);
        self.next_call += 1;
        id
    }

    fn fail(&mut self, message: impl Into<String>, out: &mut Vec<CanonicalEvent>) {
        out.push(CanonicalEvent::error(
            StreamErrorKind::MalformedToolCall,
            message,
        ));
        self.state = State::Failed;
        self.pending.clear();
        self.tool_buffer.clear();
        self.native = None;
    }

    fn take_prefix(&mut self, len: usize) -> String {
        let rest = self.pending.split_off(len);
        std::mem::replace(&mut self.pending, rest)
    }

    fn emit_text(&self, text: String, out: &mut Vec<CanonicalEvent>) {
        if text.is_empty() {
            return;
        }
        match self.state {
            State::Reasoning => out.push(CanonicalEvent::Reasoning { text }),
            _ => out.push(CanonicalEvent::Content { text }),
        }
    }

    fn emit_fragment(&self, partial_json: String, out: &mut Vec<CanonicalEvent>) {
        if partial_json.is_empty() {
            return;
        }
        out.push(CanonicalEvent::ToolCallFragment {
            call_id: self.current_call.clone(),
            partial_json,
        });
    }

    /// Append body text to the accumulator. Returns false once the cap is exceeded.
    fn accumulate(&mut self, text: &str, out: &mut Vec<CanonicalEvent>) -> bool {
        self.tool_buffer.push_str(text);
        self.emit_fragment(text.to_string(), out);
        if self.tool_buffer.len() > self.max_tool_call_bytes {
            let limit = self.max_tool_call_bytes;
            self.fail(
                format!("tool call exceeded {limit} bytes without parsing"),
                out,
            );
            return false;
        }
        true
    }

    fn complete_calls(&mut self, calls: Vec<(String, Value)>, out: &mut Vec<CanonicalEvent>) {
        let mut first = true;
        for (name, arguments) in calls {
            let call_id = if first {
                first = false;
                self.current_call.clone()
            } else {
                self.allocate_call_id()
            };
            out.push(CanonicalEvent::ToolCallComplete {
                call_id,
                name,
                arguments,
            });
        }
        self.tool_buffer.clear();
        self.state = State::Plain;
    }

    fn process_text(&mut self, out: &mut Vec<CanonicalEvent>) {
        loop {
            match self.state {
                State::Failed => {
                    self.pending.clear();
                    return;
                }
                State::Plain | State::Reasoning => {
                    let markers = if self.state == State::Plain {
                        &self.plain_markers
                    } else {
                        &self.reasoning_markers
                    };
                    if let Some((idx, len, transition)) = find_earliest(&self.pending, markers) {
                        let text = self.take_prefix(idx);
                        self.emit_text(text, out);
                        self.pending.replace_range(..len, "");
                        self.apply(transition);
                        continue;
                    }
                    let hold = partial_suffix_len(&self.pending, markers);
                    let text = self.take_prefix(self.pending.len() - hold);
                    self.emit_text(text, out);
                    return;
                }
                State::ToolOpen => {
                    let trimmed = self.pending.trim_start();
                    if trimmed.is_empty() {
                        self.pending.clear();
                        return;
                    }
                    if trimmed.len() != self.pending.len() {
                        self.pending = trimmed.to_string();
                    }
                    self.state = State::ToolBody;
                }
                State::ToolBody => {
                    let close = self.table.tool.as_ref().and_then(|t| t.close.clone());
                    let progressed = match close {
                        Some(close) => self.consume_delimited(&close, out),
                        None => self.consume_undelimited(out),
                    };
                    if !progressed {
                        return;
                    }
                }
            }
        }
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::EnterReasoning => self.state = State::Reasoning,
            Transition::LeaveReasoning | Transition::StripAnswer => self.state = State::Plain,
            Transition::OpenTool => {
                self.current_call = self.allocate_call_id();
                self.tool_buffer.clear();
                self.state = State::ToolOpen;
            }
        }
    }

    /// Tool body closed by a literal. Returns true when the state changed and
    /// `pending` should be processed again.
    fn consume_delimited(&mut self, close: &str, out: &mut Vec<CanonicalEvent>) -> bool {
        let Some(idx) = self.pending.find(close) else {
            let hold = partial_suffix_bytes(&self.pending, close);
            let body = self.take_prefix(self.pending.len() - hold);
            self.accumulate(&body, out);
            return false;
        };

        let body = self.take_prefix(idx);
        self.pending.replace_range(..close.len(), "");
        if !self.accumulate(&body, out) {
            return false;
        }
        match parse_tool_payload(&self.tool_buffer) {
            Ok(calls) => {
                self.complete_calls(calls, out);
                true
            }
            Err(PayloadError::Shape(message)) => {
                self.fail(message, out);
                false
            }
            // The close literal was inside the payload (e.g. a string argument).
            Err(PayloadError::Incomplete) => self.accumulate(close, out),
        }
    }

    /// Tool body with no close literal: try to parse at every `}` / `]`.
    fn consume_undelimited(&mut self, out: &mut Vec<CanonicalEvent>) -> bool {
        let pending = std::mem::take(&mut self.pending);
        let mut start = 0usize;
        for (idx, ch) in pending.char_indices() {
            if ch != '}' && ch != ']' {
                continue;
            }
            let end = idx + ch.len_utf8();
            if !self.accumulate(&pending[start..end], out) {
                return false;
            }
            start = end;
            match parse_tool_payload(&self.tool_buffer) {
                Ok(calls) => {
                    self.pending = pending[end..].to_string();
                    self.complete_calls(calls, out);
                    return true;
                }
                Err(PayloadError::Shape(message)) => {
                    self.fail(message, out);
                    return false;
                }
                Err(PayloadError::Incomplete) => {}
            }
        }
        self.accumulate(&pending[start..], out);
        false
    }

    fn push_native_delta(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
        out: &mut Vec<CanonicalEvent>,
    ) {
        if self.native.as_ref().is_some_and(|call| call.index != index) {
            self.complete_native(out);
            if self.state == State::Failed {
                return;
            }
        }
        if self.native.is_none() {
            let call_id = match id.filter(|id| !id.trim().is_empty()) {
                Some(id) => id,
                None => self.allocate_call_id(),
            };
            self.native = Some(NativeCall {
                index,
                call_id,
                name: None,
                arguments: String::new(),
            });
        }
        let cap = self.max_tool_call_bytes;
        let Some(call) = self.native.as_mut() else {
            return;
        };
        if call.name.is_none() {
            call.name = name.filter(|n| !n.is_empty());
        }
        if arguments.is_empty() {
            return;
        }
        call.arguments.push_str(&arguments);
        out.push(CanonicalEvent::ToolCallFragment {
            call_id: call.call_id.clone(),
            partial_json: arguments,
        });
        if call.arguments.len() > cap {
            self.fail(format!("tool call exceeded {cap} bytes without parsing"), out);
        }
    }

    fn complete_native(&mut self, out: &mut Vec<CanonicalEvent>) {
        let Some(call) = self.native.take() else {
            return;
        };
        let Some(name) = call.name else {
            self.fail(format!("tool call {} has no name", call.call_id), out);
            return;
        };
        let raw = call.arguments.trim();
        let arguments = if raw.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(value) => value,
                Err(err) => {
                    self.fail(format!("arguments for `{name}` are not valid JSON: {err}"), out);
                    return;
                }
            }
        };
        out.push(CanonicalEvent::ToolCallComplete {
            call_id: call.call_id,
            name,
            arguments,
        });
    }
}

impl NormalizeStream for MarkerNormalizer {
    fn push(&mut self, fragment: RawFragment) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if self.state == State::Failed {
            return out;
        }
        match fragment {
            RawFragment::Text(text) => {
                if text.is_empty() {
                    return out;
                }
                self.pending.push_str(&text);
                self.process_text(&mut out);
            }
            RawFragment::Reasoning(text) => {
                if !text.is_empty() {
                    out.push(CanonicalEvent::Reasoning { text });
                }
            }
            RawFragment::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => self.push_native_delta(index, id, name, arguments, &mut out),
            RawFragment::Finish {
                finish_reason,
                usage,
            } => {
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason;
                }
                if usage.is_some() {
                    self.usage = usage;
                }
                self.complete_native(&mut out);
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        self.complete_native(&mut out);
        match self.state {
            State::Plain | State::Reasoning => {
                let text = std::mem::take(&mut self.pending);
                self.emit_text(text, &mut out);
            }
            State::ToolOpen | State::ToolBody => {
                self.fail("stream ended inside tool call", &mut out);
            }
            State::Failed => {}
        }
        out
    }

    fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }
}

/// Earliest marker occurrence; ties go to the longer literal.
fn find_earliest(
    haystack: &str,
    markers: &[(String, Transition)],
) -> Option<(usize, usize, Transition)> {
    let mut best: Option<(usize, usize, Transition)> = None;
    for (literal, transition) in markers {
        if let Some(idx) = haystack.find(literal.as_str()) {
            let better = match best {
                None => true,
                Some((best_idx, best_len, _)) => {
                    idx < best_idx || (idx == best_idx && literal.len() > best_len)
                }
            };
            if better {
                best = Some((idx, literal.len(), *transition));
            }
        }
    }
    best
}

fn partial_suffix_len(haystack: &str, markers: &[(String, Transition)]) -> usize {
    markers
        .iter()
        .map(|(literal, _)| partial_suffix_bytes(haystack, literal))
        .max()
        .unwrap_or(0)
}

/// Length of the longest haystack suffix that is a proper prefix of `literal`.
///
/// Literals start on a char boundary, so the split point is always one too.
fn partial_suffix_bytes(haystack: &str, literal: &str) -> usize {
    let hay = haystack.as_bytes();
    let lit = literal.as_bytes();
    let max = lit.len().saturating_sub(1).min(hay.len());
    (1..=max)
        .rev()
        .find(|&k| hay.ends_with(&lit[..k]))
        .unwrap_or(0)
}

fn parse_tool_payload(raw: &str) -> Result<Vec<(String, Value)>, PayloadError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PayloadError::Incomplete);
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|_| PayloadError::Incomplete)?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(PayloadError::Shape("empty tool call list".into()));
            }
            items.into_iter().map(tool_call_from_value).collect()
        }
        other => tool_call_from_value(other).map(|call| vec![call]),
    }
}

fn tool_call_from_value(value: Value) -> Result<(String, Value), PayloadError> {
    let Value::Object(mut obj) = value else {
        return Err(PayloadError::Shape("tool call payload is not an object".into()));
    };
    let name = match obj.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => return Err(PayloadError::Shape("tool call payload has no name".into())),
    };
    let arguments = obj
        .remove("arguments")
        .or_else(|| obj.remove("parameters"))
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let arguments = match arguments {
        Value::String(encoded) => serde_json::from_str(&encoded).map_err(|_| {
            PayloadError::Shape(format!("arguments for `{name}` are not valid JSON"))
        })?,
        other => other,
    };
    Ok((name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::markers::BackendFamily;
    use crate::types::coalesce_events;
    use serde_json::json;

    fn normalizer(family: BackendFamily) -> MarkerNormalizer {
        MarkerNormalizer::new(family.markers()).with_id_prefix("call")
    }

    fn run_chunks(family: BackendFamily, chunks: &[&str]) -> Vec<CanonicalEvent> {
        let mut n = normalizer(family);
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(n.push(RawFragment::Text(chunk.to_string())));
        }
        events.extend(n.finish());
        events
    }

    #[test]
    fn plain_text_is_emitted_without_delay() {
        let mut n = normalizer(BackendFamily::Hermes);
        let events = n.push(RawFragment::Text("hello world".into()));
        assert_eq!(events, vec![CanonicalEvent::content("hello world")]);
    }

    #[test]
    fn partial_marker_is_held_back_until_disambiguated() {
        let mut n = normalizer(BackendFamily::Hermes);
        let first = n.push(RawFragment::Text("answer <thi".into()));
        assert_eq!(first, vec![CanonicalEvent::content("answer ")]);
        let second = n.push(RawFragment::Text("s is not a tag".into()));
        assert_eq!(second, vec![CanonicalEvent::content("<this is not a tag")]);
    }

    #[test]
    fn reasoning_channel_is_split_out() {
        let events = run_chunks(
            BackendFamily::Hermes,
            &["<think>plan", " it</think>", "Done."],
        );
        assert_eq!(
            coalesce_events(&events),
            vec![
                CanonicalEvent::reasoning("plan it"),
                CanonicalEvent::content("Done."),
            ]
        );
    }

    #[test]
    fn answer_markers_are_stripped() {
        let events = run_chunks(
            BackendFamily::Tagged,
            &["<thinking>hmm</thinking><answer>42</answer>"],
        );
        assert_eq!(
            coalesce_events(&events),
            vec![CanonicalEvent::reasoning("hmm"), CanonicalEvent::content("42")]
        );
    }

    #[test]
    fn hermes_tool_call_completes_with_structured_arguments() {
        let events = run_chunks(
            BackendFamily::Hermes,
            &["Let me check<tool_call>\n{\"name\": \"lookup\", \"arguments\": {\"q\": \"x\"}}\n</tool_call>"],
        );
        let merged = coalesce_events(&events);
        assert_eq!(merged[0], CanonicalEvent::content("Let me check"));
        assert!(matches!(
            &merged[1],
            CanonicalEvent::ToolCallFragment { call_id, .. } if call_id == "call_0"
        ));
        assert_eq!(
            merged[2],
            CanonicalEvent::ToolCallComplete {
                call_id: "call_0".into(),
                name: "lookup".into(),
                arguments: json!({"q": "x"}),
            }
        );
    }

    #[test]
    fn close_literal_inside_string_argument_keeps_accumulating() {
        let events = run_chunks(
            BackendFamily::Hermes,
            &["<tool_call>{\"name\":\"echo\",\"arguments\":{\"text\":\"a</tool_call>b\"}}</tool_call>"],
        );
        let complete = events
            .iter()
            .find(|e| matches!(e, CanonicalEvent::ToolCallComplete { .. }))
            .expect("completed call");
        assert_eq!(
            complete,
            &CanonicalEvent::ToolCallComplete {
                call_id: "call_0".into(),
                name: "echo".into(),
                arguments: json!({"text": "a</tool_call>b"}),
            }
        );
    }

    #[test]
    fn string_encoded_arguments_are_decoded() {
        let events = run_chunks(
            BackendFamily::Hermes,
            &["<tool_call>{\"name\":\"f\",\"arguments\":\"{\\\"a\\\":1}\"}</tool_call>"],
        );
        assert!(events.iter().any(|e| matches!(
            e,
            CanonicalEvent::ToolCallComplete { arguments, .. } if arguments == &json!({"a": 1})
        )));
    }

    #[test]
    fn mistral_array_yields_one_call_per_element() {
        let events = run_chunks(
            BackendFamily::Mistral,
            &["[TOOL_CALLS] [{\"name\":\"a\",\"arguments\":{\"x\":[1]}},{\"name\":\"b\",\"arguments\":{}}] tail"],
        );
        let completes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CanonicalEvent::ToolCallComplete { call_id, name, .. } => {
                    Some((call_id.clone(), name.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            completes,
            vec![
                ("call_0".to_string(), "a".to_string()),
                ("call_1".to_string(), "b".to_string()),
            ]
        );
        assert_eq!(events.last(), Some(&CanonicalEvent::content(" tail")));
    }

    #[test]
    fn stream_ending_inside_tool_body_is_malformed() {
        let events = run_chunks(BackendFamily::Hermes, &["<tool_call>{\"name\":\"lookup\""]);
        assert!(matches!(
            events.last(),
            Some(CanonicalEvent::Error {
                kind: StreamErrorKind::MalformedToolCall,
                ..
            })
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, CanonicalEvent::ToolCallComplete { .. })));
    }

    #[test]
    fn size_cap_fails_once_and_goes_quiet() {
        let mut n = normalizer(BackendFamily::Hermes).with_max_tool_call_bytes(16);
        let mut events = n.push(RawFragment::Text("<tool_call>{\"name\": \"x\", \"arguments\":".into()));
        events.extend(n.push(RawFragment::Text("more text".into())));
        events.extend(n.finish());
        let errors = events.iter().filter(|e| e.is_error()).count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn multibyte_markers_split_across_fragments() {
        let begin = "<｜tool▁call▁begin｜>";
        let (head, tail) = begin.split_at(4);
        let events = run_chunks(
            BackendFamily::DeepSeek,
            &[
                "ok",
                head,
                tail,
                "{\"name\":\"f\",\"arguments\":{}}<｜tool▁call▁end｜>",
            ],
        );
        let merged = coalesce_events(&events);
        assert_eq!(merged[0], CanonicalEvent::content("ok"));
        assert!(merged
            .iter()
            .any(|e| matches!(e, CanonicalEvent::ToolCallComplete { name, .. } if name == "f")));
    }

    #[test]
    fn native_deltas_accumulate_per_index() {
        let mut n = normalizer(BackendFamily::Native);
        let mut events = Vec::new();
        events.extend(n.push(RawFragment::ToolCallDelta {
            index: 0,
            id: Some("toolu_1".into()),
            name: Some("lookup".into()),
            arguments: "{\"q\":".into(),
        }));
        events.extend(n.push(RawFragment::ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: "\"x\"}".into(),
        }));
        events.extend(n.push(RawFragment::ToolCallDelta {
            index: 1,
            id: None,
            name: Some("other".into()),
            arguments: String::new(),
        }));
        events.extend(n.push(RawFragment::Finish {
            finish_reason: Some(FinishReason::ToolCalls),
            usage: None,
        }));
        events.extend(n.finish());

        let completes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CanonicalEvent::ToolCallComplete {
                    call_id,
                    name,
                    arguments,
                } => Some((call_id.clone(), name.clone(), arguments.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            completes,
            vec![
                ("toolu_1".to_string(), "lookup".to_string(), json!({"q": "x"})),
                ("call_0".to_string(), "other".to_string(), json!({})),
            ]
        );
        assert_eq!(n.finish_reason(), Some(FinishReason::ToolCalls));
    }

    #[test]
    fn native_reasoning_passes_through() {
        let mut n = normalizer(BackendFamily::Native);
        assert_eq!(
            n.push(RawFragment::Reasoning("why".into())),
            vec![CanonicalEvent::reasoning("why")]
        );
    }
}
