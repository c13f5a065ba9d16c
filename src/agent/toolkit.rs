use super::error::ToolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Argument the model may try to smuggle in; the sandbox root is never its call.
pub const ROOT_ARGUMENT: &str = "working_directory";

/// The closed set of operations exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ListDirectory,
    ReadFile,
    WriteFile,
    RunScript,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::ListDirectory,
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::RunScript,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::ListDirectory => "list_directory",
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::RunScript => "run_script",
        }
    }

    /// Resolve a requested name, accepting the legacy names earlier prompts used.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "list_directory" | "get_files_info" => Some(ToolKind::ListDirectory),
            "read_file" | "get_file_content" => Some(ToolKind::ReadFile),
            "write_file" => Some(ToolKind::WriteFile),
            "run_script" | "run_python_file" => Some(ToolKind::RunScript),
            _ => None,
        }
    }

    /// Parameters whose values are paths relative to the sandbox root.
    pub fn path_parameters(&self) -> &'static [&'static str] {
        match self {
            ToolKind::ListDirectory => &["directory"],
            ToolKind::ReadFile | ToolKind::WriteFile | ToolKind::RunScript => &["file_path"],
        }
    }

    fn description(&self, script_extension: &str) -> String {
        match self {
            ToolKind::ListDirectory => "Lists files in the specified directory along with their sizes, constrained to the working directory.".to_string(),
            ToolKind::ReadFile => "Reads the contents of a file within the working directory, truncated if too long.".to_string(),
            ToolKind::WriteFile => "Writes content to a file within the working directory, creating it and any missing parent directories, overwriting it if it already exists.".to_string(),
            ToolKind::RunScript => format!(
                "Executes a .{} file within the working directory with optional arguments and returns its output.",
                script_extension
            ),
        }
    }

    fn parameters(&self) -> Value {
        match self {
            ToolKind::ListDirectory => json!({
                "type": "object",
                "properties": {
                    "directory": {
                        "type": "string",
                        "description": "The directory to list files from, relative to the working directory. If not provided, lists files in the working directory itself."
                    }
                }
            }),
            ToolKind::ReadFile => json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "The file to read, relative to the working directory."
                    }
                },
                "required": ["file_path"]
            }),
            ToolKind::WriteFile => json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "The file to write, relative to the working directory."
                    },
                    "content": {
                        "type": "string",
                        "description": "The full content to write to the file."
                    }
                },
                "required": ["file_path", "content"]
            }),
            ToolKind::RunScript => json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "The script to execute, relative to the working directory."
                    },
                    "args": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional list of arguments to pass to the script."
                    }
                },
                "required": ["file_path"]
            }),
        }
    }
}

/// Declaration of one operation as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Read-only schema for every registered operation, built once at startup.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    declarations: Vec<FunctionDeclaration>,
}

impl ToolSchema {
    pub fn new(script_extension: &str) -> Self {
        let declarations = ToolKind::ALL
            .iter()
            .map(|kind| FunctionDeclaration {
                name: kind.name().to_string(),
                description: kind.description(script_extension),
                parameters: kind.parameters(),
            })
            .collect();
        Self { declarations }
    }

    pub fn declarations(&self) -> &[FunctionDeclaration] {
        &self.declarations
    }

    /// Guide appended to the system prompt.
    pub fn catalog_prompt(&self) -> String {
        let mut guide = String::from("You can perform the following operations:\n");
        for decl in &self.declarations {
            guide.push_str(&format!("- {}: {}\n", decl.name, decl.description));
        }
        guide
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListDirectoryArgs {
    #[serde(default = "current_dir")]
    pub directory: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadFileArgs {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteFileArgs {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunScriptArgs {
    pub file_path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn current_dir() -> String {
    ".".to_string()
}

/// A validated call, one strongly typed record per operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    ListDirectory(ListDirectoryArgs),
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    RunScript(RunScriptArgs),
}

impl ToolInvocation {
    pub fn parse(kind: ToolKind, args: Map<String, Value>) -> Result<Self, ToolError> {
        Ok(match kind {
            ToolKind::ListDirectory => ToolInvocation::ListDirectory(typed(kind, args)?),
            ToolKind::ReadFile => ToolInvocation::ReadFile(typed(kind, args)?),
            ToolKind::WriteFile => ToolInvocation::WriteFile(typed(kind, args)?),
            ToolKind::RunScript => ToolInvocation::RunScript(typed(kind, args)?),
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInvocation::ListDirectory(_) => ToolKind::ListDirectory,
            ToolInvocation::ReadFile(_) => ToolKind::ReadFile,
            ToolInvocation::WriteFile(_) => ToolKind::WriteFile,
            ToolInvocation::RunScript(_) => ToolKind::RunScript,
        }
    }
}

fn typed<T: DeserializeOwned>(kind: ToolKind, args: Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args)).map_err(|e| ToolError::InvalidArguments {
        tool: kind.name().to_string(),
        reason: e.to_string(),
    })
}

/// Strip leading separators and a conventional `<alias>/` prefix so `calc/x.py`,
/// `/x.py` and `x.py` all name the same file.
pub fn normalize_path(raw: &str, alias: Option<&str>) -> String {
    let mut path = raw.trim().trim_start_matches(['/', '\\']);
    if let Some(alias) = alias.filter(|a| !a.is_empty()) {
        if path == alias {
            path = ".";
        } else if let Some(rest) = path
            .strip_prefix(alias)
            .and_then(|r| r.strip_prefix(['/', '\\']))
        {
            path = rest.trim_start_matches(['/', '\\']);
        }
    }
    if path.is_empty() {
        ".".to_string()
    } else {
        path.to_string()
    }
}
