use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// A request, issued by the model, to run one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// `{"result": text}` or `{"error": text}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(String),
    Error(String),
}

impl ResponsePayload {
    pub fn text(&self) -> &str {
        match self {
            ResponsePayload::Result(t) | ResponsePayload::Error(t) => t,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResponsePayload::Error(_))
    }
}

/// Envelope returned to the model for every dispatched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub name: String,
    pub response: ResponsePayload,
}

impl ToolResponse {
    pub fn success(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: ResponsePayload::Result(text.into()),
        }
    }

    pub fn failure(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: ResponsePayload::Error(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    ToolCall(ToolCallRequest),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn tool(response: ToolResponse) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![Part::ToolResponse(response)],
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallRequest> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text parts, if any carry non-blank text.
    pub fn text(&self) -> Option<String> {
        let text: String = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Append-only record of the run; the only state carried between steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::user(prompt)],
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn roles(&self) -> Vec<Role> {
        self.turns.iter().map(|t| t.role).collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
