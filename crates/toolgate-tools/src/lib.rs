//! Mediated tool execution: every mutating tool call runs through one
//! pipeline that validates, guards against stale writes, diffs, gates on
//! permission, mutates, versions, and collects diagnostics.
//!
//! The runtime owns the services a pipeline run touches; hosts share it
//! behind an `Arc` and drive approvals by watching the bus.

mod shell;

pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use toolgate_bus::EventBus;
use toolgate_core::{
    CancelToken, GateConfig, GateError, GateEvent, PipelineState, SessionContext, ToolCall,
    ToolResponse,
};
use toolgate_diagnostics::{DiagnosticsBridge, render_sections};
use toolgate_diff::generate_diff;
use toolgate_fsstate::{ConsistencyGuard, FileTimes, WriteCheck};
use toolgate_history::HistoryStore;
use toolgate_observe::Observer;
use toolgate_permission::{CreatePermissionRequest, Decision, PermissionService};
use uuid::Uuid;

pub struct ToolRuntime {
    workspace: PathBuf,
    config: GateConfig,
    bus: Arc<EventBus>,
    times: Arc<FileTimes>,
    guard: ConsistencyGuard,
    permissions: Arc<PermissionService>,
    history: Arc<HistoryStore>,
    diagnostics: Arc<DiagnosticsBridge>,
    observer: Observer,
    runner: Arc<dyn ShellRunner>,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditParams {
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    old_string: String,
    #[serde(default)]
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Debug, Deserialize)]
struct ShellParams {
    #[serde(default)]
    command: String,
    timeout_seconds: Option<u64>,
}

impl ToolRuntime {
    pub fn new(workspace: &Path) -> Result<Self> {
        Self::with_runner(workspace, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(workspace: &Path, runner: Arc<dyn ShellRunner>) -> Result<Self> {
        let config = GateConfig::load(workspace)?;
        let bus = Arc::new(EventBus::new());
        let times = Arc::new(FileTimes::new());
        let guard = ConsistencyGuard::new(Arc::clone(&times));
        let permissions = Arc::new(PermissionService::new(Arc::clone(&bus), config.clone()));
        let history = Arc::new(HistoryStore::new(workspace)?);
        let observer = Observer::new(workspace)?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            config,
            bus,
            times,
            guard,
            permissions,
            history,
            diagnostics: Arc::new(DiagnosticsBridge::empty()),
            observer,
            runner,
        })
    }

    pub fn with_diagnostics(mut self, bridge: DiagnosticsBridge) -> Self {
        self.diagnostics = Arc::new(bridge);
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn permissions(&self) -> &Arc<PermissionService> {
        &self.permissions
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn file_times(&self) -> &Arc<FileTimes> {
        &self.times
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Reads a file on behalf of the agent and records the read, which is
    /// what later arms the stale-write guard for this path.
    pub fn read_file(&self, path: &Path) -> Result<String> {
        let path = self.absolutize(path);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.times.record_read(&path);
        Ok(content)
    }

    /// For hosts that read file content through their own machinery but
    /// still want the stale-write guard armed.
    pub fn record_read(&self, path: &Path) {
        self.times.record_read(&self.absolutize(path));
    }

    /// Runs one tool call to a terminal state. Expected tool outcomes
    /// (validation problems, stale writes, no-ops) come back as error or
    /// plain text in the `ToolResponse`; denial and cancellation surface
    /// as `GateError` so the host can distinguish them from tool output.
    pub fn run(
        &self,
        ctx: &SessionContext,
        call: &ToolCall,
        cancel: &CancelToken,
    ) -> Result<ToolResponse> {
        if ctx.session_id.is_nil() || ctx.message_id.is_nil() {
            return Err(GateError::MissingContext.into());
        }
        if cancel.is_canceled() {
            return Err(GateError::Canceled.into());
        }

        let call_id = Uuid::now_v7();
        self.emit_state(ctx, call_id, &call.name, PipelineState::Validating);
        match call.name.as_str() {
            "write" => self.run_write(ctx, call_id, &call.args, cancel),
            "edit" => self.run_edit(ctx, call_id, &call.args, cancel),
            "shell" => self.run_shell(ctx, call_id, &call.args, cancel),
            other => Ok(self.validation_failure(
                ctx,
                call_id,
                other,
                format!("unknown tool: {other}"),
            )),
        }
    }

    fn run_write(
        &self,
        ctx: &SessionContext,
        call_id: Uuid,
        args: &serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<ToolResponse> {
        let params: WriteParams = match serde_json::from_value(args.clone()) {
            Ok(params) => params,
            Err(err) => {
                return Ok(self.validation_failure(
                    ctx,
                    call_id,
                    "write",
                    invalid_params("write", &err.to_string()),
                ));
            }
        };
        // No target path: pick one from what the content looks like.
        let file_path = if params.file_path.is_empty() {
            default_filename(&params.content).to_string()
        } else {
            params.file_path
        };
        if params.content.is_empty() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "write",
                invalid_params("write", "content is required"),
            ));
        }

        let path = self.absolutize(Path::new(&file_path));
        if path.is_dir() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "write",
                format!("path is a directory, not a file: {}", path.display()),
            ));
        }
        let description = if path.exists() {
            format!("Overwrite file {}", path.display())
        } else {
            format!("Create file {}", path.display())
        };
        self.mutate_file(
            ctx,
            call_id,
            "write",
            "write",
            &description,
            path,
            params.content,
            cancel,
        )
    }

    fn run_edit(
        &self,
        ctx: &SessionContext,
        call_id: Uuid,
        args: &serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<ToolResponse> {
        let params: EditParams = match serde_json::from_value(args.clone()) {
            Ok(params) => params,
            Err(err) => {
                return Ok(self.validation_failure(
                    ctx,
                    call_id,
                    "edit",
                    invalid_params("edit", &err.to_string()),
                ));
            }
        };
        if params.file_path.is_empty() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                invalid_params("edit", "file_path is required"),
            ));
        }
        if params.old_string.is_empty() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                invalid_params("edit", "old_string is required"),
            ));
        }
        if params.old_string == params.new_string {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                invalid_params("edit", "old_string and new_string must differ"),
            ));
        }

        let path = self.absolutize(Path::new(&params.file_path));
        if path.is_dir() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                format!("path is a directory, not a file: {}", path.display()),
            ));
        }
        if !path.exists() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                format!("file not found: {}", path.display()),
            ));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let occurrences = content.matches(&params.old_string).count();
        if occurrences == 0 {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                format!("old_string not found in {}", path.display()),
            ));
        }
        if occurrences > 1 && !params.replace_all {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "edit",
                format!(
                    "old_string appears {occurrences} times in {}; provide more surrounding \
                     context to make it unique, or set replace_all",
                    path.display()
                ),
            ));
        }
        let new_content = if params.replace_all {
            content.replace(&params.old_string, &params.new_string)
        } else {
            content.replacen(&params.old_string, &params.new_string, 1)
        };

        let description = format!("Edit file {}", path.display());
        self.mutate_file(
            ctx,
            call_id,
            "edit",
            "edit",
            &description,
            path,
            new_content,
            cancel,
        )
    }

    /// The shared write-path pipeline behind `write` and `edit`:
    /// guard, diff, permission, mutate, version, diagnose.
    #[allow(clippy::too_many_arguments)]
    fn mutate_file(
        &self,
        ctx: &SessionContext,
        call_id: Uuid,
        tool: &str,
        action: &str,
        description: &str,
        path: PathBuf,
        new_content: String,
        cancel: &CancelToken,
    ) -> Result<ToolResponse> {
        let exists = path.exists();

        // Staleness is decided before looking at the content, so writing
        // identical bytes over an unseen change is still rejected.
        self.emit_state(ctx, call_id, tool, PipelineState::Guarding);
        if let WriteCheck::Stale {
            modified,
            last_read,
        } = self.guard.check_writable(&path)?
        {
            self.emit_state(ctx, call_id, tool, PipelineState::RejectedStale);
            let err = GateError::StaleFile {
                path: path.display().to_string(),
                modified: modified.to_rfc3339(),
                last_read: last_read.to_rfc3339(),
            };
            return Ok(ToolResponse::error(err.to_string()));
        }

        let old_content = if exists {
            fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?
        } else {
            String::new()
        };

        self.emit_state(ctx, call_id, tool, PipelineState::Diffing);
        if exists && old_content == new_content {
            self.emit_state(ctx, call_id, tool, PipelineState::NoChanges);
            return Ok(ToolResponse::text(format!(
                "File {} already contains the exact content. No changes made.",
                path.display()
            )));
        }
        let diff = generate_diff(&old_content, &new_content, &self.diff_label(&path));

        self.emit_state(ctx, call_id, tool, PipelineState::PermissionPending);
        let decision = self.permissions.request(
            CreatePermissionRequest {
                session_id: ctx.session_id,
                path: self.permission_path(&path),
                tool_name: tool.to_string(),
                action: action.to_string(),
                description: description.to_string(),
                params: json!({
                    "file_path": path.display().to_string(),
                    "diff": diff.rendered,
                }),
            },
            cancel,
        );
        match decision {
            Decision::Granted => {}
            Decision::Denied => {
                self.emit_state(ctx, call_id, tool, PipelineState::PermissionDenied);
                return Err(GateError::PermissionDenied {
                    tool: tool.to_string(),
                    path: path.display().to_string(),
                }
                .into());
            }
            Decision::Canceled => {
                self.emit_state(ctx, call_id, tool, PipelineState::Canceled);
                return Err(GateError::Canceled.into());
            }
        }

        self.emit_state(ctx, call_id, tool, PipelineState::Mutating);
        if let Err(err) = self.write_to_disk(&path, &new_content) {
            self.emit_state(ctx, call_id, tool, PipelineState::Failed);
            return Err(err);
        }

        // The disk mutation is the point of no return: bookkeeping failures
        // after it degrade to warnings instead of failing the call.
        self.emit_state(ctx, call_id, tool, PipelineState::Versioning);
        let mut warnings = Vec::new();
        let path_key = path.display().to_string();
        match self
            .history
            .record_mutation(ctx.session_id, &path_key, &old_content, &new_content)
        {
            Ok(versions) => {
                for version in &versions.created {
                    self.publish(GateEvent::FileVersionCreatedV1 {
                        session_id: ctx.session_id,
                        path: path_key.clone(),
                        version: version.version,
                        origin: version.origin.as_str().to_string(),
                    });
                }
            }
            Err(err) => {
                let warning = format!("failed to record file history for {path_key}: {err}");
                self.observer.warn_log(&warning);
                warnings.push(warning);
            }
        }
        self.times.record_write(&path);
        self.times.record_read(&path);
        self.publish(GateEvent::FileWrittenV1 {
            session_id: ctx.session_id,
            call_id,
            path: path_key,
            additions: diff.additions,
            removals: diff.removals,
        });

        self.emit_state(ctx, call_id, tool, PipelineState::Diagnosing);
        let body = self.render_result(&path);

        self.emit_state(ctx, call_id, tool, PipelineState::Completed);
        let mut response = ToolResponse::text(body).with_metadata(json!({
            "diff": diff.rendered,
            "additions": diff.additions,
            "removals": diff.removals,
        }));
        response.warnings = warnings;
        Ok(response)
    }

    fn run_shell(
        &self,
        ctx: &SessionContext,
        call_id: Uuid,
        args: &serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<ToolResponse> {
        let params: ShellParams = match serde_json::from_value(args.clone()) {
            Ok(params) => params,
            Err(err) => {
                return Ok(self.validation_failure(
                    ctx,
                    call_id,
                    "shell",
                    invalid_params("shell", &err.to_string()),
                ));
            }
        };
        if params.command.is_empty() {
            return Ok(self.validation_failure(
                ctx,
                call_id,
                "shell",
                invalid_params("shell", "command is required"),
            ));
        }

        self.emit_state(ctx, call_id, "shell", PipelineState::PermissionPending);
        let decision = self.permissions.request(
            CreatePermissionRequest {
                session_id: ctx.session_id,
                path: self.workspace.clone(),
                tool_name: "shell".to_string(),
                action: "execute".to_string(),
                description: format!("Run command `{}`", params.command),
                params: json!({"command": params.command}),
            },
            cancel,
        );
        match decision {
            Decision::Granted => {}
            Decision::Denied => {
                self.emit_state(ctx, call_id, "shell", PipelineState::PermissionDenied);
                return Err(GateError::PermissionDenied {
                    tool: "shell".to_string(),
                    path: self.workspace.display().to_string(),
                }
                .into());
            }
            Decision::Canceled => {
                self.emit_state(ctx, call_id, "shell", PipelineState::Canceled);
                return Err(GateError::Canceled.into());
            }
        }

        self.emit_state(ctx, call_id, "shell", PipelineState::Mutating);
        let timeout = Duration::from_secs(
            params
                .timeout_seconds
                .unwrap_or(self.config.shell_timeout_seconds),
        );
        let out = match self.runner.run(&params.command, &self.workspace, timeout) {
            Ok(out) => out,
            Err(err) => {
                self.emit_state(ctx, call_id, "shell", PipelineState::Failed);
                return Err(err);
            }
        };

        self.emit_state(ctx, call_id, "shell", PipelineState::Completed);
        let mut body = String::from("<result>\n");
        body.push_str(&out.stdout);
        if !out.stderr.is_empty() {
            if !out.stdout.is_empty() && !out.stdout.ends_with('\n') {
                body.push('\n');
            }
            body.push_str("stderr:\n");
            body.push_str(&out.stderr);
        }
        if out.timed_out {
            body.push_str(&format!(
                "\ncommand timed out after {} seconds\n",
                timeout.as_secs()
            ));
        }
        if !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str("</result>");
        let response = ToolResponse {
            text: body,
            is_error: !out.success(),
            metadata: Some(json!({"status": out.status, "timed_out": out.timed_out})),
            warnings: Vec::new(),
        };
        Ok(response)
    }

    fn render_result(&self, path: &Path) -> String {
        let mut body = format!(
            "<result>\nFile successfully written: {}\n</result>",
            path.display()
        );
        if !self.diagnostics.is_empty() {
            let reports = self
                .diagnostics
                .collect(path, Duration::from_millis(self.config.diagnostics_wait_ms));
            body.push_str(&render_sections(path, &reports));
        }
        body
    }

    fn write_to_disk(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Escalating on the workspace root lets one always-allow grant cover
    /// every file in the project; paths outside the workspace keep their
    /// own identity.
    fn permission_path(&self, path: &Path) -> PathBuf {
        if self.config.widen_permission_to_root && path.starts_with(&self.workspace) {
            self.workspace.clone()
        } else {
            path.to_path_buf()
        }
    }

    fn diff_label(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Early exit before the pipeline proper: observers still get a
    /// terminal state for the call.
    fn validation_failure(
        &self,
        ctx: &SessionContext,
        call_id: Uuid,
        tool: &str,
        body: impl Into<String>,
    ) -> ToolResponse {
        self.emit_state(ctx, call_id, tool, PipelineState::Failed);
        ToolResponse::error(body)
    }

    fn emit_state(&self, ctx: &SessionContext, call_id: Uuid, tool: &str, state: PipelineState) {
        self.publish(GateEvent::ToolStateChangedV1 {
            session_id: ctx.session_id,
            call_id,
            tool: tool.to_string(),
            state,
        });
    }

    fn publish(&self, kind: GateEvent) {
        let envelope = self.bus.publish(kind);
        if let Err(err) = self.observer.record_event(&envelope) {
            self.observer.verbose_log(&format!("event log append failed: {err}"));
        }
    }
}

fn invalid_params(tool: &str, reason: &str) -> String {
    GateError::InvalidParams {
        tool: tool.to_string(),
        reason: reason.to_string(),
    }
    .to_string()
}

/// Names a file from what its content looks like, for writes that arrive
/// without a `file_path`. Checked most-specific first; plain text falls
/// through to `output.txt`.
fn default_filename(content: &str) -> &'static str {
    static PRINT_CALL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"print\s*\(").expect("print pattern"));
    static LEADING_KEY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*\w+:\s*").expect("key pattern"));

    let first_line = content.trim().lines().next().unwrap_or("").trim();
    let lower = content.to_lowercase();

    if first_line.starts_with("#!/usr/bin/env python")
        || first_line.starts_with("#!/usr/bin/python")
        || lower.contains("def ")
        || lower.contains("import ")
        || lower.contains("from ")
        || PRINT_CALL.is_match(&lower)
    {
        return "script.py";
    }
    if lower.contains("#include")
        || lower.contains("int main")
        || lower.contains("std::")
        || lower.contains("cout")
    {
        return "program.cpp";
    }
    if lower.contains("#include") && lower.contains("printf") {
        return "program.c";
    }
    if lower.contains("public class")
        || lower.contains("public static void main")
        || lower.contains("system.out.println")
    {
        return "Program.java";
    }
    if lower.contains("function")
        || lower.contains("console.log")
        || lower.contains("const ")
        || lower.contains("let ")
        || lower.contains("var ")
        || lower.contains("=>")
    {
        return "script.js";
    }
    if lower.contains("func ")
        || lower.contains("package main")
        || lower.contains("import \"")
        || lower.contains("fmt.")
    {
        return "program.go";
    }
    if lower.contains("fn ") || lower.contains("println!") || lower.contains("use std::") {
        return "program.rs";
    }
    if lower.contains("<!doctype")
        || lower.contains("<html")
        || lower.contains("<body")
        || lower.contains("<div")
    {
        return "index.html";
    }
    if lower.contains("<?xml") || lower.contains("<xml") {
        return "document.xml";
    }
    if lower.contains('{') && lower.contains('}') && (lower.contains('"') || lower.contains(':')) {
        return "data.json";
    }
    if first_line.starts_with("#!/bin/bash")
        || first_line.starts_with("#!/bin/sh")
        || lower.contains("echo ")
        || lower.contains("if [")
    {
        return "script.sh";
    }
    if lower.contains("select ")
        || lower.contains("create table")
        || lower.contains("insert into")
        || lower.contains("update ")
    {
        return "query.sql";
    }
    if first_line.starts_with('#')
        || lower.contains("##")
        || lower.contains("```")
        || lower.contains("**")
    {
        return "document.md";
    }
    if lower.contains('[') && lower.contains(']') && lower.contains('=') {
        return "config.ini";
    }
    if lower.contains("---") || LEADING_KEY.is_match(first_line) {
        return "config.yaml";
    }
    if lower.contains(',') && first_line.matches(',').count() > 1 {
        return "data.csv";
    }
    "output.txt"
}
