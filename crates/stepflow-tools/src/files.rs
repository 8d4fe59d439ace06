use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// What happened when materializing a reply's `files`.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub created: Vec<PathBuf>,
    /// One message per file that could not be written.
    pub errors: Vec<String>,
    pub total_bytes: usize,
}

/// Write `files` (`name -> content`) into `dir`.
///
/// Only the final path component of each name is used, so nothing lands
/// outside `dir`. A file that fails is reported and the rest still written.
pub async fn write_direct_files(dir: &Path, files: &BTreeMap<String, String>) -> FileReport {
    let mut report = FileReport::default();
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        report
            .errors
            .push(format!("Failed to create {}: {}", dir.display(), e));
        return report;
    }

    for (name, content) in files {
        let Some(safe_name) = Path::new(name).file_name() else {
            report
                .errors
                .push(format!("Failed to create {}: not a file name", name));
            continue;
        };
        let path = dir.join(safe_name);
        match tokio::fs::write(&path, content).await {
            Ok(()) => {
                report.total_bytes += content.len();
                report.created.push(path);
            }
            Err(e) => {
                warn!(file = %name, error = %e, "Failed to write file");
                report.errors.push(format!("Failed to create {}: {}", name, e));
            }
        }
    }

    if !report.created.is_empty() {
        info!(
            dir = %dir.display(),
            files = report.created.len(),
            bytes = report.total_bytes,
            "Wrote reply files"
        );
    }
    report
}
