// Scriptbox agent modules
pub mod agent_loop;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod files;
pub mod gemini;
pub mod guard;
pub mod process;
pub mod retry;
pub mod toolkit;

use agent_loop::{AgentLoop, RunReport};
use config::{mask_secret, AgentConfig};
use dispatcher::Dispatcher;
use error::Result;
use gemini::GeminiClient;
use guard::SandboxRoot;
use process::ScriptRunner;
use retry::RetryPolicy;
use toolkit::ToolSchema;
use tracing::{info, Instrument};

pub fn build_system_prompt(schema: &ToolSchema, script_extension: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are a helpful AI coding agent.\n\n");
    prompt.push_str("When a user asks a question or makes a request, make a function call plan, then carry it out with the operations below.\n\n");
    prompt.push_str(&schema.catalog_prompt());
    prompt.push_str("\nRules:\n");
    prompt.push_str("- All paths you provide must be relative to the working directory. Do not specify the working directory in your function calls; it is injected automatically for security reasons.\n");
    prompt.push_str(&format!(
        "- Only .{} files can be executed.\n",
        script_extension
    ));
    prompt.push_str("- A tool result starting with \"Error:\" means the operation failed; read it and adjust your next call.\n");
    prompt.push_str("- When you are done, answer in plain text without calling a function.\n");
    prompt
}

/// Confine the agent to the configured root and run `prompt` to completion.
pub async fn run(config: &AgentConfig, prompt: &str) -> Result<RunReport> {
    // Fail on a missing key before anything touches the network.
    let api_key = config.api_key()?;
    let endpoint = config.endpoint_url()?;

    let root = SandboxRoot::new(&config.root)?;
    let alias = config
        .alias
        .clone()
        .or_else(|| root.name().map(str::to_string));

    info!("Sandbox root: {}", root.path().display());
    info!("Using model {} at {}", config.model, endpoint);
    info!("Using GEMINI_API_KEY: {}", mask_secret(api_key));

    let client = GeminiClient::new(&endpoint, &config.model, api_key, config.request_timeout())?;
    let runner = ScriptRunner::new(config.interpreter.clone(), config.script_extension.clone());
    let schema = ToolSchema::new(runner.extension());
    let system_prompt = config
        .system_prompt
        .clone()
        .unwrap_or_else(|| build_system_prompt(&schema, runner.extension()));
    let dispatcher = Dispatcher::new(
        root,
        runner,
        config.max_chars,
        config.script_timeout(),
        alias,
    );
    let retry = RetryPolicy::new(config.max_retries, config.retry_base_delay());

    let agent = AgentLoop::new(
        client,
        dispatcher,
        schema,
        retry,
        config.max_steps,
        system_prompt,
    );

    let run_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("run", %run_id);
    agent.run(prompt).instrument(span).await
}
