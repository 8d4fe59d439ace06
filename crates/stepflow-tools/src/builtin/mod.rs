//! File tools confined to a workspace directory.
//!
//! Arguments are positional, the way generated code calls them:
//! `read_text(path)`, `write_text(path, content)`, `list_files([dir])`.

mod files;

pub use files::{ListFilesTool, ReadTextTool, WriteTextTool};

use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use stepflow_core::error::{Result, StepflowError};

/// Resolve `rel` inside `root`, refusing absolute paths and `..`.
pub(crate) fn resolve_in(root: &Path, rel: &str, tool: &str) -> Result<PathBuf> {
    let path = Path::new(rel);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(StepflowError::tool(
            tool,
            format!("path '{}' leaves the workspace", rel),
        ));
    }
    Ok(root.join(path))
}

/// Positional string argument `idx`.
pub(crate) fn str_arg<'a>(args: &'a [Value], idx: usize, tool: &str) -> Result<&'a str> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| StepflowError::tool(tool, format!("argument {} must be a string", idx + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/ws");
        assert_eq!(resolve_in(root, "a/b.txt", "t").unwrap(), PathBuf::from("/ws/a/b.txt"));
        assert!(resolve_in(root, "../etc/passwd", "t").is_err());
        assert!(resolve_in(root, "/etc/passwd", "t").is_err());
    }
}
