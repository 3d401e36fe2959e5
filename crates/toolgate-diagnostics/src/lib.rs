//! Best-effort diagnostics enrichment after a mutation.
//!
//! Each registered language backend is queried on its own thread; whatever
//! answers before the deadline is folded into the tool response, the rest
//! is discarded. Nothing here can fail or delay a mutation beyond the
//! configured bound.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARN",
            Self::Information => "INFO",
            Self::Hint => "HINT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
    pub column: u32,
    /// File the finding is about. `None` means the file the backend was
    /// queried for; anything else lands in the project-scope section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReport {
    pub backend: String,
    pub findings: Vec<Finding>,
}

pub trait DiagnosticsBackend: Send + Sync {
    fn name(&self) -> &str;
    fn diagnostics(&self, path: &Path) -> Result<Vec<Finding>>;
}

#[derive(Default, Clone)]
pub struct DiagnosticsBridge {
    backends: Vec<Arc<dyn DiagnosticsBackend>>,
}

impl DiagnosticsBridge {
    pub fn new(backends: Vec<Arc<dyn DiagnosticsBackend>>) -> Self {
        Self { backends }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Fan out to every backend, join the ones that answer within `wait`.
    /// Backends that error or overrun contribute nothing; their threads
    /// are left to finish into a dropped channel.
    pub fn collect(&self, path: &Path, wait: Duration) -> Vec<BackendReport> {
        if self.backends.is_empty() {
            return Vec::new();
        }

        let (tx, rx) = channel();
        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let path: PathBuf = path.to_path_buf();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let result = backend.diagnostics(&path);
                let _ = tx.send((backend.name().to_string(), result));
            });
        }
        drop(tx);

        let deadline = Instant::now() + wait;
        let mut reports = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((backend, Ok(findings))) => {
                    if !findings.is_empty() {
                        reports.push(BackendReport { backend, findings });
                    }
                    if reports.len() == self.backends.len() {
                        break;
                    }
                }
                // A failed backend degrades to "no findings".
                Ok((_, Err(_))) => {}
                Err(_) => break,
            }
        }
        reports.sort_by(|a, b| a.backend.cmp(&b.backend));
        reports
    }
}

/// Tagged blocks appended after the `<result>` body when any backend
/// returned findings. Findings for the mutated file go into
/// `<file_diagnostics>`; findings elsewhere in the project go into
/// `<project_diagnostics>` under their own path.
pub fn render_sections(path: &Path, reports: &[BackendReport]) -> String {
    let mut file_lines = Vec::new();
    let mut project_lines = Vec::new();
    for report in reports {
        for finding in &report.findings {
            match &finding.path {
                Some(other) if other != path => {
                    project_lines.push(render_line(other, finding, &report.backend));
                }
                _ => file_lines.push(render_line(path, finding, &report.backend)),
            }
        }
    }

    let mut out = String::new();
    if !file_lines.is_empty() {
        out.push_str("\n<file_diagnostics>\n");
        out.extend(file_lines);
        out.push_str("</file_diagnostics>\n");
    }
    if !project_lines.is_empty() {
        out.push_str("\n<project_diagnostics>\n");
        out.extend(project_lines);
        out.push_str("</project_diagnostics>\n");
    }
    out
}

fn render_line(path: &Path, finding: &Finding, backend: &str) -> String {
    format!(
        "{}: {} [{},{}] {} ({})\n",
        path.display(),
        finding.severity.label(),
        finding.line,
        finding.column,
        finding.message,
        backend,
    )
}
