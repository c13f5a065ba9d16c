use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

#[path = "../agent/mod.rs"]
mod agent;
#[path = "../shared/logging.rs"]
mod logging;

use agent::agent_loop::Outcome;
use agent::config::{AgentConfig, CliArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CliArgs::parse();
    let config = AgentConfig::resolve(&args)?;

    // Guards flush the non-blocking writers when main returns
    let _guards = logging::init_logging(config.log_dir.as_deref(), "scriptbox", args.verbose)?;

    if args.verbose {
        println!("User prompt: {}", args.prompt);
    }

    let report = match agent::run(&config, &args.prompt).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Run aborted: {}", e);
            eprintln!("Error: {e}");
            return Ok(ExitCode::from(1));
        }
    };

    tracing::info!(
        steps = report.steps,
        turns = report.history.len(),
        "Run finished"
    );

    if args.verbose {
        println!("Prompt tokens: {}", report.usage.prompt_tokens);
        println!("Response tokens: {}", report.usage.response_tokens);
    }

    match report.outcome {
        Outcome::Final(text) => {
            println!("Final response:\n{}", text);
            Ok(ExitCode::SUCCESS)
        }
        Outcome::Exhausted { max_steps } => {
            eprintln!(
                "Maximum steps ({}) reached without a final response.",
                max_steps
            );
            Ok(ExitCode::from(2))
        }
    }
}
