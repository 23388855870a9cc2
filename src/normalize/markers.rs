//! Per-backend marker literals.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Open/close literal pair delimiting an inline channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPair {
    pub open: String,
    pub close: String,
}

impl MarkerPair {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

/// Tool-call delimiters. Without a `close` literal, `}` and `]` are the terminator candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMarkers {
    pub open: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<String>,
}

/// Marker literals for one backend family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<MarkerPair>,
    /// Final-answer wrapper. Its literals are stripped; the enclosed text is content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<MarkerPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolMarkers>,
}

impl MarkerTable {
    /// Table with no inline markers (structured-delta backends).
    pub fn none() -> Self {
        Self::default()
    }

    /// Length in bytes of the longest literal in the table.
    pub fn longest_marker(&self) -> usize {
        let mut literals: Vec<&str> = Vec::new();
        if let Some(pair) = &self.reasoning {
            literals.extend([pair.open.as_str(), pair.close.as_str()]);
        }
        if let Some(pair) = &self.answer {
            literals.extend([pair.open.as_str(), pair.close.as_str()]);
        }
        if let Some(tool) = &self.tool {
            literals.push(tool.open.as_str());
            if let Some(close) = &tool.close {
                literals.push(close.as_str());
            }
        }
        literals.iter().map(|l| l.len()).max().unwrap_or(0)
    }
}

/// Backend family: selects the marker table fed to the normalizer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendFamily {
    /// Structured deltas only (OpenAI, Anthropic).
    #[default]
    Native,
    /// Qwen/Hermes chat templates.
    Hermes,
    /// DeepSeek R1 style.
    DeepSeek,
    /// Mistral instruct templates.
    Mistral,
    /// Prompted thinking/answer tags.
    Tagged,
}

impl BackendFamily {
    pub fn markers(self) -> MarkerTable {
        match self {
            Self::Native => MarkerTable::none(),
            Self::Hermes => MarkerTable {
                reasoning: Some(MarkerPair::new("<think>", "</think>")),
                answer: None,
                tool: Some(ToolMarkers {
                    open: "<tool_call>".into(),
                    close: Some("</tool_call>".into()),
                }),
            },
            Self::DeepSeek => MarkerTable {
                reasoning: Some(MarkerPair::new("<think>", "</think>")),
                answer: None,
                tool: Some(ToolMarkers {
                    open: "<｜tool▁call▁begin｜>".into(),
                    close: Some("<｜tool▁call▁end｜>".into()),
                }),
            },
            Self::Mistral => MarkerTable {
                reasoning: Some(MarkerPair::new("[THINK]", "[/THINK]")),
                answer: None,
                tool: Some(ToolMarkers {
                    open: "[TOOL_CALLS]".into(),
                    close: None,
                }),
            },
            Self::Tagged => MarkerTable {
                reasoning: Some(MarkerPair::new("<thinking>", "</thinking>")),
                answer: Some(MarkerPair::new("<answer>", "</answer>")),
                tool: Some(ToolMarkers {
                    open: "<tool_call>".into(),
                    close: Some("</tool_call>".into()),
                }),
            },
        }
    }
}
