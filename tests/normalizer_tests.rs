//! Delta normalizer behaviour over whole streams.

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;

use turnstile::error::TurnstileError;
use turnstile::normalize::{normalize, BackendFamily, MarkerNormalizer, MarkerPair, MarkerTable, ToolMarkers};
use turnstile::types::{coalesce_events, CanonicalEvent, RawFragment, RawStream, StreamErrorKind};

const HERMES_TURN: &str = "<think>need data</think>Let me check<tool_call>{\"name\": \"lookup\", \"arguments\": {\"q\": \"x\"}}</tool_call>";

fn raw(chunks: &[&str]) -> RawStream {
    let items: Vec<Result<RawFragment, TurnstileError>> = chunks
        .iter()
        .map(|c| Ok(RawFragment::Text((*c).to_string())))
        .collect();
    futures::stream::iter(items).boxed()
}

async fn run(family: BackendFamily, chunks: &[&str]) -> Vec<CanonicalEvent> {
    let normalizer = MarkerNormalizer::new(family.markers()).with_id_prefix("call");
    normalize(raw(chunks), Box::new(normalizer)).collect().await
}

fn char_boundaries(s: &str) -> Vec<usize> {
    s.char_indices().map(|(i, _)| i).skip(1).collect()
}

#[tokio::test]
async fn single_fragment_baseline() {
    let events = coalesce_events(&run(BackendFamily::Hermes, &[HERMES_TURN]).await);
    assert_eq!(events[0], CanonicalEvent::reasoning("need data"));
    assert_eq!(events[1], CanonicalEvent::content("Let me check"));
    assert_eq!(
        events.last(),
        Some(&CanonicalEvent::ToolCallComplete {
            call_id: "call_0".into(),
            name: "lookup".into(),
            arguments: json!({"q": "x"}),
        })
    );
}

#[tokio::test]
async fn every_three_way_split_normalizes_identically() {
    let expected = coalesce_events(&run(BackendFamily::Hermes, &[HERMES_TURN]).await);
    let cuts = char_boundaries(HERMES_TURN);
    for (i, &first) in cuts.iter().enumerate().step_by(3) {
        for &second in cuts[i + 1..].iter().step_by(5) {
            let pieces = [
                &HERMES_TURN[..first],
                &HERMES_TURN[first..second],
                &HERMES_TURN[second..],
            ];
            let got = coalesce_events(&run(BackendFamily::Hermes, &pieces).await);
            assert_eq!(got, expected, "cuts at {first} and {second}");
        }
    }
}

#[tokio::test]
async fn byte_sized_fragments_normalize_identically() {
    for family in [BackendFamily::DeepSeek, BackendFamily::Tagged] {
        let table = family.markers();
        let tool = table.tool.clone().unwrap();
        let reasoning = table.reasoning.clone().unwrap();
        let text = format!(
            "{}plan{}answer {}{{\"name\":\"f\",\"arguments\":{{\"k\":\"v\"}}}}{}",
            reasoning.open,
            reasoning.close,
            tool.open,
            tool.close.unwrap_or_default()
        );
        let expected = coalesce_events(&run(family, &[&text]).await);
        let chars: Vec<String> = text.chars().map(String::from).collect();
        let pieces: Vec<&str> = chars.iter().map(String::as_str).collect();
        let got = coalesce_events(&run(family, &pieces).await);
        assert_eq!(got, expected, "{family:?}");
        assert!(got.iter().any(|e| matches!(e, CanonicalEvent::ToolCallComplete { name, .. } if name == "f")));
    }
}

#[tokio::test]
async fn content_never_contains_marker_fragments() {
    for at in char_boundaries(HERMES_TURN) {
        let (a, b) = HERMES_TURN.split_at(at);
        for event in run(BackendFamily::Hermes, &[a, b]).await {
            if let CanonicalEvent::Content { text } = event {
                assert!(!text.contains('<'), "split {at} leaked {text:?}");
            }
        }
    }
}

#[tokio::test]
async fn sequential_calls_get_distinct_ordered_ids() {
    let events = run(
        BackendFamily::Hermes,
        &[
            "<tool_call>{\"name\":\"a\",\"arguments\":{\"n\":1}}</tool_call>",
            "<tool_call>{\"name\":\"b\",\"arguments\":{\"n\":2}}</tool_call>",
        ],
    )
    .await;

    let completes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CanonicalEvent::ToolCallComplete { call_id, name, arguments } => {
                Some((call_id.as_str(), name.as_str(), arguments.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        completes,
        vec![("call_0", "a", json!({"n": 1})), ("call_1", "b", json!({"n": 2}))]
    );

    // Fragments of one call never interleave with the other's.
    let mut current: Option<&str> = None;
    for event in &events {
        match event {
            CanonicalEvent::ToolCallFragment { call_id, .. } => {
                if let Some(open) = current {
                    assert_eq!(open, call_id.as_str());
                }
                current = Some(call_id);
            }
            CanonicalEvent::ToolCallComplete { .. } => current = None,
            _ => {}
        }
    }
}

#[tokio::test]
async fn unterminated_call_is_malformed_not_truncated() {
    let events = run(
        BackendFamily::Hermes,
        &["Let me check<tool_call>{\"name\": \"lookup\", \"arguments\": {\"q\": \"x\"}}"],
    )
    .await;
    assert!(!events.iter().any(|e| matches!(e, CanonicalEvent::ToolCallComplete { .. })));
    assert!(matches!(
        events.last(),
        Some(CanonicalEvent::Error { kind: StreamErrorKind::MalformedToolCall, .. })
    ));
}

#[tokio::test]
async fn custom_marker_table_drives_same_machine() {
    let table = MarkerTable {
        reasoning: Some(MarkerPair::new("<<r>>", "<</r>>")),
        answer: None,
        tool: Some(ToolMarkers {
            open: "@@call".into(),
            close: Some("@@end".into()),
        }),
    };
    let normalizer = MarkerNormalizer::new(table).with_id_prefix("c");
    let events: Vec<_> = normalize(
        raw(&["<<r>>hm<</r", ">>ok @@ca", "ll{\"name\":\"z\",\"arguments\":{}}@@e", "nd"]),
        Box::new(normalizer),
    )
    .collect()
    .await;
    let merged = coalesce_events(&events);
    assert_eq!(merged[0], CanonicalEvent::reasoning("hm"));
    assert_eq!(merged[1], CanonicalEvent::content("ok "));
    assert!(matches!(
        merged.last(),
        Some(CanonicalEvent::ToolCallComplete { call_id, name, .. }) if call_id == "c_0" && name == "z"
    ));
}
