use super::conversation::{ConversationHistory, ToolCallRequest, ToolResponse, Turn};
use super::dispatcher::Dispatcher;
use super::error::{AgentError, Result};
use super::gemini::{ModelClient, TokenUsage};
use super::retry::{call_with_retry, RetryPolicy};
use super::toolkit::ToolSchema;
use tracing::{debug, info, warn};

/// Where the loop currently is. `Final` and `Exhausted` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitingModel,
    DispatchingTools(Vec<ToolCallRequest>),
    Final(String),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Final(String),
    Exhausted { max_steps: usize },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    pub history: ConversationHistory,
    pub steps: usize,
    pub usage: TokenUsage,
}

pub struct AgentLoop<C: ModelClient> {
    client: C,
    dispatcher: Dispatcher,
    schema: ToolSchema,
    retry: RetryPolicy,
    max_steps: usize,
    system_prompt: String,
}

impl<C: ModelClient> AgentLoop<C> {
    pub fn new(
        client: C,
        dispatcher: Dispatcher,
        schema: ToolSchema,
        retry: RetryPolicy,
        max_steps: usize,
        system_prompt: String,
    ) -> Self {
        Self {
            client,
            dispatcher,
            schema,
            retry,
            max_steps,
            system_prompt,
        }
    }

    /// Drive the conversation for `prompt` until the model answers in plain
    /// text or `max_steps` tool-dispatch cycles have been spent.
    ///
    /// Remote failures that survive the retry policy and malformed tool
    /// envelopes abort the run; tool failures never do.
    pub async fn run(&self, prompt: &str) -> Result<RunReport> {
        let mut history = ConversationHistory::new(prompt);
        let mut usage = TokenUsage::default();
        let mut steps = 0usize;
        let mut state = LoopState::AwaitingModel;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    let reply = call_with_retry(self.retry, || {
                        self.client.generate(
                            history.turns(),
                            self.schema.declarations(),
                            &self.system_prompt,
                        )
                    })
                    .await?;
                    if let Some(u) = reply.usage {
                        usage.add(u);
                    }

                    let calls: Vec<ToolCallRequest> =
                        reply.turn.tool_calls().into_iter().cloned().collect();
                    let text = reply.turn.text();
                    history.push(reply.turn);

                    if !calls.is_empty() {
                        if steps >= self.max_steps {
                            LoopState::Exhausted
                        } else {
                            LoopState::DispatchingTools(calls)
                        }
                    } else if let Some(text) = text {
                        LoopState::Final(text)
                    } else {
                        return Err(AgentError::Protocol(
                            "model turn carried neither tool calls nor text".to_string(),
                        ));
                    }
                }
                LoopState::DispatchingTools(calls) => {
                    for call in &calls {
                        info!(tool = %call.name, "Calling function");
                        debug!(tool = %call.name, args = %serde_json::Value::Object(call.arguments.clone()), "function arguments");
                        let response = self.dispatcher.invoke(call).await;
                        ensure_envelope(call, &response)?;
                        debug!(tool = %call.name, response = %response.response.text(), "function response");
                        history.push(Turn::tool(response));
                    }
                    steps += 1;
                    LoopState::AwaitingModel
                }
                LoopState::Final(text) => {
                    info!(steps, "Model produced a final response");
                    return Ok(RunReport {
                        outcome: Outcome::Final(text),
                        history,
                        steps,
                        usage,
                    });
                }
                LoopState::Exhausted => {
                    warn!(max_steps = self.max_steps, "Step budget exhausted without a final response");
                    return Ok(RunReport {
                        outcome: Outcome::Exhausted {
                            max_steps: self.max_steps,
                        },
                        history,
                        steps,
                        usage,
                    });
                }
            };
        }
    }
}

/// A tool turn must answer the call it follows, and a failure must be tagged
/// so the model can tell it apart from a result.
fn ensure_envelope(call: &ToolCallRequest, response: &ToolResponse) -> Result<()> {
    if response.name != call.name {
        return Err(AgentError::Protocol(format!(
            "tool response for '{}' answered call '{}'",
            response.name, call.name
        )));
    }
    if response.response.is_error() && !response.response.text().starts_with("Error: ") {
        return Err(AgentError::Protocol(format!(
            "untagged failure in tool response for '{}'",
            call.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::conversation::{Part, ResponsePayload, Role};
    use crate::agent::error::ModelError;
    use crate::agent::gemini::ModelReply;
    use crate::agent::guard::SandboxRoot;
    use crate::agent::process::ScriptRunner;
    use crate::agent::toolkit::FunctionDeclaration;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    type Scripted = std::result::Result<ModelReply, ModelError>;

    struct ScriptedClient {
        replies: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Scripted>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn generate(
            &self,
            history: &[Turn],
            tools: &[FunctionDeclaration],
            _system_prompt: &str,
        ) -> std::result::Result<ModelReply, ModelError> {
            assert_eq!(tools.len(), 4);
            self.seen.lock().unwrap().push(history.len());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Permanent("script exhausted".into())))
        }
    }

    fn text_reply(text: &str) -> Scripted {
        Ok(ModelReply {
            turn: Turn {
                role: Role::Model,
                parts: vec![Part::Text(text.into())],
            },
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                response_tokens: 2,
            }),
        })
    }

    fn call_reply(name: &str, args: serde_json::Value) -> Scripted {
        Ok(ModelReply {
            turn: Turn {
                role: Role::Model,
                parts: vec![Part::ToolCall(ToolCallRequest {
                    name: name.into(),
                    arguments: args.as_object().cloned().unwrap_or_else(Map::new),
                })],
            },
            usage: None,
        })
    }

    fn agent(replies: Vec<Scripted>, max_steps: usize) -> (TempDir, AgentLoop<ScriptedClient>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('x')\n").unwrap();
        let root = SandboxRoot::new(dir.path()).unwrap();
        let dispatcher = Dispatcher::new(
            root,
            ScriptRunner::new("sh", "sh"),
            1000,
            Duration::from_secs(5),
            None,
        );
        let agent = AgentLoop::new(
            ScriptedClient::new(replies),
            dispatcher,
            ToolSchema::new("sh"),
            RetryPolicy::new(3, Duration::from_millis(1)),
            max_steps,
            "system".into(),
        );
        (dir, agent)
    }

    #[tokio::test]
    async fn test_single_tool_cycle_then_final() {
        let (_dir, agent) = agent(
            vec![call_reply("list_directory", json!({"directory": "."})), text_reply("done")],
            20,
        );
        let report = agent.run("what is here?").await.unwrap();
        assert_eq!(report.outcome, Outcome::Final("done".into()));
        assert_eq!(report.steps, 1);
        assert_eq!(
            report.history.roles(),
            vec![Role::User, Role::Model, Role::Tool, Role::Model]
        );
        match &report.history.turns()[2].parts[0] {
            Part::ToolResponse(resp) => {
                assert_eq!(resp.name, "list_directory");
                assert_eq!(
                    resp.response,
                    ResponsePayload::Result("- main.py: file_size=11 bytes, is_dir=False".into())
                );
            }
            other => panic!("unexpected part {other:?}"),
        }
        assert_eq!(*agent.client.seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(report.usage.prompt_tokens, 10);
    }

    #[tokio::test]
    async fn test_multiple_calls_dispatched_in_order() {
        let two_calls = Ok(ModelReply {
            turn: Turn {
                role: Role::Model,
                parts: vec![
                    Part::ToolCall(ToolCallRequest {
                        name: "write_file".into(),
                        arguments: json!({"file_path": "a.txt", "content": "one"})
                            .as_object()
                            .cloned()
                            .unwrap(),
                    }),
                    Part::ToolCall(ToolCallRequest {
                        name: "read_file".into(),
                        arguments: json!({"file_path": "a.txt"}).as_object().cloned().unwrap(),
                    }),
                ],
            },
            usage: None,
        });
        let (_dir, agent) = agent(vec![two_calls, text_reply("ok")], 5);
        let report = agent.run("write then read").await.unwrap();
        let turns = report.history.turns();
        assert_eq!(turns.len(), 5);
        match (&turns[2].parts[0], &turns[3].parts[0]) {
            (Part::ToolResponse(w), Part::ToolResponse(r)) => {
                assert_eq!(w.name, "write_file");
                assert_eq!(r.response, ResponsePayload::Result("one".into()));
            }
            other => panic!("unexpected parts {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_failure_does_not_abort() {
        let (_dir, agent) = agent(
            vec![call_reply("read_file", json!({"file_path": "../secret"})), text_reply("sorry")],
            5,
        );
        let report = agent.run("read the secret").await.unwrap();
        assert_eq!(report.outcome, Outcome::Final("sorry".into()));
        match &report.history.turns()[2].parts[0] {
            Part::ToolResponse(resp) => assert!(resp.response.is_error()),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_step_budget_exhausted() {
        let (_dir, agent) = agent(
            vec![
                call_reply("list_directory", json!({})),
                call_reply("list_directory", json!({})),
                call_reply("list_directory", json!({})),
            ],
            2,
        );
        let report = agent.run("loop forever").await.unwrap();
        assert_eq!(report.outcome, Outcome::Exhausted { max_steps: 2 });
        assert_eq!(report.steps, 2);
        assert_eq!(report.history.len(), 6);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (_dir, agent) = agent(
            vec![
                Err(ModelError::Transient("503".into())),
                Err(ModelError::Transient("503".into())),
                text_reply("fine"),
            ],
            5,
        );
        let report = agent.run("hi").await.unwrap();
        assert_eq!(report.outcome, Outcome::Final("fine".into()));
        assert_eq!(agent.client.seen.lock().unwrap().len(), 3);
        assert_eq!(report.history.roles(), vec![Role::User, Role::Model]);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_aborts() {
        let (_dir, agent) = agent(
            (0..4).map(|_| Err(ModelError::Transient("429".into()))).collect(),
            5,
        );
        let err = agent.run("hi").await.unwrap_err();
        assert!(matches!(err, AgentError::TransientService { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_permanent_failure_aborts_immediately() {
        let (_dir, agent) = agent(vec![Err(ModelError::Permanent("400".into()))], 5);
        let err = agent.run("hi").await.unwrap_err();
        assert!(matches!(err, AgentError::PermanentService(_)));
        assert_eq!(agent.client.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_model_turn_is_protocol_error() {
        let empty = Ok(ModelReply {
            turn: Turn {
                role: Role::Model,
                parts: vec![],
            },
            usage: None,
        });
        let (_dir, agent) = agent(vec![empty], 5);
        assert!(matches!(agent.run("hi").await, Err(AgentError::Protocol(_))));
    }

    #[test]
    fn test_mismatched_envelope_is_rejected() {
        let call = ToolCallRequest {
            name: "read_file".into(),
            arguments: Map::new(),
        };
        assert!(ensure_envelope(&call, &ToolResponse::success("read_file", "")).is_ok());
        assert!(matches!(
            ensure_envelope(&call, &ToolResponse::success("write_file", "")),
            Err(AgentError::Protocol(_))
        ));
    }

    #[test]
    fn test_untagged_failure_is_rejected() {
        let call = ToolCallRequest {
            name: "read_file".into(),
            arguments: Map::new(),
        };
        assert!(ensure_envelope(&call, &ToolResponse::failure("read_file", "Error: nope")).is_ok());
        assert!(matches!(
            ensure_envelope(&call, &ToolResponse::failure("read_file", "")),
            Err(AgentError::Protocol(_))
        ));
        assert!(matches!(
            ensure_envelope(&call, &ToolResponse::failure("read_file", "nope")),
            Err(AgentError::Protocol(_))
        ));
    }
}
