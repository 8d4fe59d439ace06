use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::Tool;

use super::{resolve_in, str_arg};

const MAX_READ_BYTES: usize = 200_000;

pub struct ReadTextTool {
    root: PathBuf,
}

impl ReadTextTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Tool for ReadTextTool {
    fn name(&self) -> &str {
        "read_text"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace."
    }

    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let rel = str_arg(&args, 0, self.name())?;
            let path = resolve_in(&self.root, rel, self.name())?;
            debug!(path = %path.display(), "Reading file");

            let mut content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StepflowError::tool(self.name(), format!("{}: {}", rel, e)))?;
            if content.len() > MAX_READ_BYTES {
                let mut cut = MAX_READ_BYTES;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
            Ok(Value::String(content))
        })
    }
}

pub struct WriteTextTool {
    root: PathBuf,
}

impl WriteTextTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Tool for WriteTextTool {
    fn name(&self) -> &str {
        "write_text"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file into the workspace, creating parent directories."
    }

    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let rel = str_arg(&args, 0, self.name())?;
            let content = str_arg(&args, 1, self.name())?;
            let path = resolve_in(&self.root, rel, self.name())?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StepflowError::tool(self.name(), e.to_string()))?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| StepflowError::tool(self.name(), format!("{}: {}", rel, e)))?;
            debug!(path = %path.display(), bytes = content.len(), "Wrote file");
            Ok(json!({ "path": rel, "bytes": content.len() }))
        })
    }
}

pub struct ListFilesTool {
    root: PathBuf,
}

impl ListFilesTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List entries of a workspace directory (default: the workspace root)."
    }

    fn invoke(&self, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let rel = match args.first() {
                None | Some(Value::Null) => ".",
                Some(_) => str_arg(&args, 0, self.name())?,
            };
            let dir = resolve_in(&self.root, rel, self.name())?;

            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| StepflowError::tool(self.name(), format!("{}: {}", rel, e)))?;
            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StepflowError::tool(self.name(), e.to_string()))?
            {
                let mut name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                names.push(name);
            }
            names.sort();
            Ok(json!(names))
        })
    }
}
