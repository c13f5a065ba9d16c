use std::time::Duration;
use thiserror::Error;

/// Failures raised by a single tool invocation.
///
/// These never abort the agent loop: the dispatcher renders them to text and
/// hands them back to the model, which is expected to adjust its next call.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Cannot {action} \"{path}\" as it is outside the permitted working directory")]
    Confinement { action: &'static str, path: String },

    #[error("File not found or is not a regular file: \"{0}\"")]
    NotAFile(String),

    #[error("\"{0}\" is not a directory")]
    NotADirectory(String),

    #[error("File \"{0}\" not found.")]
    NotFound(String),

    #[error("\"{path}\" is not a .{extension} file.")]
    UnsupportedScript { path: String, extension: String },

    #[error("executing script: timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("executing script: {0}")]
    Execution(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Unknown function: {0}")]
    UnknownTool(String),

    #[error("{tool} failed unexpectedly: {reason}")]
    Panicked { tool: String, reason: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Text handed to the model. Every failure carries the same prefix so
    /// it can be told apart from a successful result.
    pub fn render(&self) -> String {
        format!("Error: {self}")
    }
}

/// Failures reported by the remote model endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("transient model service failure: {0}")]
    Transient(String),

    #[error("model service failure: {0}")]
    Permanent(String),
}

/// Fatal conditions that terminate a run.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model service still failing after {attempts} attempts: {last}")]
    TransientService { attempts: u32, last: String },

    #[error("Model service error: {0}")]
    PermanentService(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
