use super::conversation::{Part, Role, ToolCallRequest, ToolResponse, Turn};
use super::error::{AgentError, ModelError, Result};
use super::toolkit::FunctionDeclaration;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.response_tokens += other.response_tokens;
    }
}

/// One model turn plus the usage it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub turn: Turn,
    pub usage: Option<TokenUsage>,
}

/// The remote endpoint the agent loop talks to.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(
        &self,
        history: &[Turn],
        tools: &[FunctionDeclaration],
        system_prompt: &str,
    ) -> std::result::Result<ModelReply, ModelError>;
}

// Wire types for the generateContent API.

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct WireFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    args: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct WireFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<WireContent>,
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(endpoint: &Url, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(AgentError::Config("API key is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AgentError::Request)?;
        let endpoint = endpoint
            .join(&format!("v1beta/models/{}:generateContent", model))
            .map_err(|e| AgentError::Config(format!("Invalid model endpoint: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            api_key: api_key.trim().to_string(),
        })
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(
        &self,
        history: &[Turn],
        tools: &[FunctionDeclaration],
        system_prompt: &str,
    ) -> std::result::Result<ModelReply, ModelError> {
        let request = build_request(history, tools, system_prompt);
        debug!(
            "Sending request to {} with {} contents",
            self.model,
            request.contents.len()
        );

        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ModelError::Transient(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let msg = format!("Model service error ({}): {}", status, body);
            return Err(if is_transient_status(status) {
                ModelError::Transient(msg)
            } else {
                ModelError::Permanent(msg)
            });
        }

        parse_response(&body)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn classify_transport(err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() {
        ModelError::Transient(format!("Request failed: {}", err))
    } else {
        ModelError::Permanent(format!("Request failed: {}", err))
    }
}

fn build_request<'a>(
    history: &[Turn],
    tools: &'a [FunctionDeclaration],
    system_prompt: &str,
) -> GenerateRequest<'a> {
    let mut contents: Vec<WireContent> = Vec::new();
    for turn in history {
        let role = match turn.role {
            Role::User => "user",
            Role::Model => "model",
            Role::Tool => "tool",
        };
        let parts: Vec<WirePart> = turn.parts.iter().map(to_wire_part).collect();
        // Responses to one step's calls travel together in a single content.
        if turn.role == Role::Tool {
            if let Some(last) = contents.last_mut() {
                if last.role.as_deref() == Some(role) {
                    last.parts.extend(parts);
                    continue;
                }
            }
        }
        contents.push(WireContent {
            role: Some(role.to_string()),
            parts,
        });
    }

    let system_instruction = if system_prompt.trim().is_empty() {
        None
    } else {
        Some(WireContent {
            role: None,
            parts: vec![WirePart {
                text: Some(system_prompt.to_string()),
                ..Default::default()
            }],
        })
    };

    GenerateRequest {
        contents,
        tools: vec![WireTool {
            function_declarations: tools,
        }],
        system_instruction,
    }
}

fn to_wire_part(part: &Part) -> WirePart {
    match part {
        Part::Text(text) => WirePart {
            text: Some(text.clone()),
            ..Default::default()
        },
        Part::ToolCall(call) => WirePart {
            function_call: Some(WireFunctionCall {
                name: Some(call.name.clone()),
                args: Some(call.arguments.clone()),
            }),
            ..Default::default()
        },
        Part::ToolResponse(ToolResponse { name, response }) => WirePart {
            function_response: Some(WireFunctionResponse {
                name: name.clone(),
                response: serde_json::to_value(response).unwrap_or(Value::Null),
            }),
            ..Default::default()
        },
    }
}

fn parse_response(body: &str) -> std::result::Result<ModelReply, ModelError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| ModelError::Permanent(format!("Failed to parse model response: {}", e)))?;

    let content = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .ok_or_else(|| ModelError::Permanent("Model response contained no candidates".to_string()))?;

    let mut parts = Vec::new();
    for part in content.parts {
        if let Some(call) = part.function_call {
            let name = call
                .name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| ModelError::Permanent("Function call without a name".to_string()))?;
            parts.push(Part::ToolCall(ToolCallRequest {
                name,
                arguments: call.args.unwrap_or_default(),
            }));
        } else if let Some(text) = part.text {
            parts.push(Part::Text(text));
        }
    }

    Ok(ModelReply {
        turn: Turn {
            role: Role::Model,
            parts,
        },
        usage: parsed.usage_metadata.map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            response_tokens: u.candidates_token_count,
        }),
    })
}
