use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".toolgate")
}

// ── Session & tool calls ─────────────────────────────────────────────────────

/// Call-scoped identity handed to every pipeline run. The session service
/// that creates these lives outside this workspace; a run with either id
/// missing is a host misconfiguration, not a user error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub message_id: Uuid,
}

impl SessionContext {
    pub fn new(session_id: Uuid, message_id: Uuid) -> Self {
        Self {
            session_id,
            message_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// Result envelope returned to the agent. `text` is the primary body the
/// model reads; `metadata` carries structured data (diff text, counts) for
/// programmatic consumers that do not want to re-parse the rendered diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub text: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ToolResponse {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: body.into(),
            is_error: false,
            metadata: None,
            warnings: Vec::new(),
        }
    }

    pub fn error(body: impl Into<String>) -> Self {
        Self {
            text: body.into(),
            is_error: true,
            metadata: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── Pipeline states ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Validating,
    Guarding,
    Diffing,
    PermissionPending,
    Mutating,
    Versioning,
    Diagnosing,
    Completed,
    NoChanges,
    RejectedStale,
    PermissionDenied,
    Failed,
    Canceled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::NoChanges
                | Self::RejectedStale
                | Self::PermissionDenied
                | Self::Failed
                | Self::Canceled
        )
    }
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// A pending permission escalation as seen by observers of the bus. The
/// `params` payload is tool-shaped JSON (file path, diff, command, ...)
/// meant for UI rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub path: String,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    pub params: serde_json::Value,
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    PermissionRequested,
    PermissionResolved,
    FileWritten,
    FileVersionCreated,
    ToolState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum GateEvent {
    PermissionRequestedV1 {
        query: PermissionQuery,
    },
    PermissionResolvedV1 {
        request_id: Uuid,
        session_id: Uuid,
        granted: bool,
        always_allow: bool,
    },
    FileWrittenV1 {
        session_id: Uuid,
        call_id: Uuid,
        path: String,
        additions: usize,
        removals: usize,
    },
    FileVersionCreatedV1 {
        session_id: Uuid,
        path: String,
        version: i64,
        origin: String,
    },
    ToolStateChangedV1 {
        session_id: Uuid,
        call_id: Uuid,
        tool: String,
        state: PipelineState,
    },
}

impl GateEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::PermissionRequestedV1 { .. } => Topic::PermissionRequested,
            Self::PermissionResolvedV1 { .. } => Topic::PermissionResolved,
            Self::FileWrittenV1 { .. } => Topic::FileWritten,
            Self::FileVersionCreatedV1 { .. } => Topic::FileVersionCreated,
            Self::ToolStateChangedV1 { .. } => Topic::ToolState,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    pub kind: GateEvent,
}

impl EventEnvelope {
    pub fn now(kind: GateEvent) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum GateError {
    #[error("permission denied for `{tool}` on {path}")]
    PermissionDenied { tool: String, path: String },
    #[error(
        "file {path} has been modified since it was last read\nlast modification: {modified}\nlast read: {last_read}\n\nread the file again before writing to it"
    )]
    StaleFile {
        path: String,
        modified: String,
        last_read: String,
    },
    #[error("invalid parameters for `{tool}`: {reason}")]
    InvalidParams { tool: String, reason: String },
    #[error("session_id and message_id are required")]
    MissingContext,
    #[error("tool call canceled")]
    Canceled,
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag shared between a pipeline run and its
/// caller. Checked at the suspension points (permission wait); once the
/// mutation step has started the flag is no longer consulted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Bounded wait for diagnostics backends after a mutation, in ms.
    #[serde(default = "default_diagnostics_wait_ms")]
    pub diagnostics_wait_ms: u64,
    /// Skip the human-in-the-loop prompt for file mutations.
    #[serde(default)]
    pub auto_approve_edits: bool,
    /// Skip the human-in-the-loop prompt for shell commands.
    #[serde(default)]
    pub auto_approve_shell: bool,
    #[serde(default = "default_shell_timeout_seconds")]
    pub shell_timeout_seconds: u64,
    /// Request permission on the workspace root for paths inside it, so a
    /// single always-allow grant covers the whole project.
    #[serde(default = "default_widen_permission_to_root")]
    pub widen_permission_to_root: bool,
}

fn default_diagnostics_wait_ms() -> u64 {
    2_000
}
fn default_shell_timeout_seconds() -> u64 {
    120
}
fn default_widen_permission_to_root() -> bool {
    true
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            diagnostics_wait_ms: default_diagnostics_wait_ms(),
            auto_approve_edits: false,
            auto_approve_shell: false,
            shell_timeout_seconds: default_shell_timeout_seconds(),
            widen_permission_to_root: default_widen_permission_to_root(),
        }
    }
}

impl GateConfig {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    /// Defaults merged with `<runtime_dir>/settings.json` when present.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        let path = Self::settings_path(workspace);
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::settings_path(workspace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json_value(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("toolgate-core-{tag}-{}", Uuid::now_v7()));
        fs::create_dir_all(&dir).expect("workspace");
        dir
    }

    #[test]
    fn config_load_merges_settings_over_defaults() {
        let workspace = temp_workspace("config");
        fs::create_dir_all(runtime_dir(&workspace)).expect("runtime dir");
        fs::write(
            GateConfig::settings_path(&workspace),
            r#"{"auto_approve_edits": true, "diagnostics_wait_ms": 250}"#,
        )
        .expect("settings");

        let cfg = GateConfig::load(&workspace).expect("load");
        assert!(cfg.auto_approve_edits);
        assert_eq!(cfg.diagnostics_wait_ms, 250);
        // Untouched knobs keep their defaults.
        assert!(!cfg.auto_approve_shell);
        assert_eq!(cfg.shell_timeout_seconds, 120);
    }

    #[test]
    fn config_save_then_load_roundtrips() {
        let workspace = temp_workspace("roundtrip");
        let mut cfg = GateConfig::default();
        cfg.auto_approve_shell = true;
        cfg.save(&workspace).expect("save");

        let loaded = GateConfig::load(&workspace).expect("load");
        assert!(loaded.auto_approve_shell);
    }

    #[test]
    fn event_topics_match_variants() {
        let event = GateEvent::FileWrittenV1 {
            session_id: Uuid::now_v7(),
            call_id: Uuid::now_v7(),
            path: "src/main.rs".to_string(),
            additions: 1,
            removals: 0,
        };
        assert_eq!(event.topic(), Topic::FileWritten);

        let event = GateEvent::PermissionResolvedV1 {
            request_id: Uuid::now_v7(),
            session_id: Uuid::now_v7(),
            granted: true,
            always_allow: false,
        };
        assert_eq!(event.topic(), Topic::PermissionResolved);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(PipelineState::Completed.is_terminal());
        assert!(PipelineState::RejectedStale.is_terminal());
        assert!(PipelineState::Canceled.is_terminal());
        assert!(!PipelineState::PermissionPending.is_terminal());
        assert!(!PipelineState::Mutating.is_terminal());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_canceled());
    }
}
