use super::conversation::{ToolCallRequest, ToolResponse};
use super::error::ToolError;
use super::files;
use super::guard::SandboxRoot;
use super::process::ScriptRunner;
use super::toolkit::{normalize_path, ToolInvocation, ToolKind, ROOT_ARGUMENT};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Maps a model-issued call onto one of the sandboxed primitives.
///
/// `invoke` is total: unknown names, bad arguments, tool failures and even
/// panics inside a tool come back as an error envelope.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    root: SandboxRoot,
    runner: ScriptRunner,
    max_chars: usize,
    script_timeout: Duration,
    alias: Option<String>,
}

impl Dispatcher {
    pub fn new(
        root: SandboxRoot,
        runner: ScriptRunner,
        max_chars: usize,
        script_timeout: Duration,
        alias: Option<String>,
    ) -> Self {
        Self {
            root,
            runner,
            max_chars,
            script_timeout,
            alias,
        }
    }

    pub async fn invoke(&self, call: &ToolCallRequest) -> ToolResponse {
        let started = Instant::now();
        let outcome = match self.prepare(call) {
            Ok(invocation) => {
                info!(tool = %call.name, args = ?invocation, "tool start");
                match AssertUnwindSafe(self.execute(invocation)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(ToolError::Panicked {
                        tool: call.name.clone(),
                        reason: panic_message(panic.as_ref()),
                    }),
                }
            }
            Err(e) => Err(e),
        };

        let took_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(text) => {
                info!(tool = %call.name, success = true, len = text.len(), took_ms, "tool end");
                ToolResponse::success(&call.name, text)
            }
            Err(e) => {
                warn!(tool = %call.name, success = false, error = %e, took_ms, "tool end");
                ToolResponse::failure(&call.name, e.render())
            }
        }
    }

    /// Look up the operation, drop any root the model supplied, normalize
    /// path arguments and convert the raw mapping into typed arguments.
    fn prepare(&self, call: &ToolCallRequest) -> Result<ToolInvocation, ToolError> {
        let kind =
            ToolKind::from_name(&call.name).ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        let mut args = call.arguments.clone();
        if args.remove(ROOT_ARGUMENT).is_some() {
            warn!(tool = %call.name, "ignoring model-supplied {}", ROOT_ARGUMENT);
        }
        for key in kind.path_parameters() {
            if let Some(Value::String(raw)) = args.get_mut(*key) {
                *raw = normalize_path(raw, self.alias.as_deref());
            }
        }
        ToolInvocation::parse(kind, args)
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<String, ToolError> {
        match invocation {
            ToolInvocation::ListDirectory(a) => files::list_directory(&self.root, &a.directory)
                .await
                .map(|entries| files::render_listing(&entries)),
            ToolInvocation::ReadFile(a) => files::read_file(&self.root, &a.file_path, self.max_chars).await,
            ToolInvocation::WriteFile(a) => files::write_file(&self.root, &a.file_path, &a.content).await,
            ToolInvocation::RunScript(a) => self
                .runner
                .run(&self.root, &a.file_path, &a.args, self.script_timeout)
                .await
                .map(|report| report.render()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
