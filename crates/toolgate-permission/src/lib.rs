//! Human-in-the-loop permission gating for mutating tool calls.
//!
//! `request` is synchronous for the calling pipeline run but resolves
//! through the bus: the service publishes `PermissionRequested`, parks the
//! caller on a per-request channel, and whatever approver is watching the
//! bus answers with `grant`/`deny`. Pending requests are independent; a
//! stuck request for one path never blocks another path's request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::Duration;
use toolgate_bus::EventBus;
use toolgate_core::{CancelToken, GateConfig, GateEvent, PermissionQuery};
use uuid::Uuid;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// What a tool hands the gate; the service assigns the request id.
#[derive(Debug, Clone)]
pub struct CreatePermissionRequest {
    pub session_id: Uuid,
    pub path: PathBuf,
    pub tool_name: String,
    pub action: String,
    pub description: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied,
    Canceled,
}

#[derive(Debug, Clone)]
struct AllowRule {
    path_prefix: PathBuf,
    tool_name: String,
}

struct PendingRequest {
    query: PermissionQuery,
    sender: Sender<Decision>,
}

pub struct PermissionService {
    bus: Arc<EventBus>,
    config: GateConfig,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    // Always-allow rules are session-scoped policy, keyed by path prefix.
    rules: Mutex<HashMap<Uuid, Vec<AllowRule>>>,
}

impl PermissionService {
    pub fn new(bus: Arc<EventBus>, config: GateConfig) -> Self {
        Self {
            bus,
            config,
            pending: Mutex::new(HashMap::new()),
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks the calling thread until the request resolves or `cancel`
    /// fires. Auto-approve config and cached always-allow rules resolve
    /// without escalation (and without bus traffic).
    pub fn request(&self, request: CreatePermissionRequest, cancel: &CancelToken) -> Decision {
        if self.auto_approved(&request.action) {
            return Decision::Granted;
        }
        if self.covered_by_rule(request.session_id, &request.path, &request.tool_name) {
            return Decision::Granted;
        }
        if cancel.is_canceled() {
            return Decision::Canceled;
        }

        let query = PermissionQuery {
            request_id: Uuid::now_v7(),
            session_id: request.session_id,
            path: request.path.to_string_lossy().to_string(),
            tool_name: request.tool_name,
            action: request.action,
            description: request.description,
            params: request.params,
        };
        let (tx, rx) = channel();
        {
            let mut pending = self.lock_pending();
            pending.insert(
                query.request_id,
                PendingRequest {
                    query: query.clone(),
                    sender: tx,
                },
            );
        }
        self.bus
            .publish(GateEvent::PermissionRequestedV1 { query: query.clone() });

        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(decision) => return decision,
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_canceled() {
                        // Release the waiter so the id cannot leak.
                        self.lock_pending().remove(&query.request_id);
                        return Decision::Canceled;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Decision::Denied,
            }
        }
    }

    /// Approver surface: resolve a pending request. With `always_allow`,
    /// future calls to the same path prefix and tool in this session skip
    /// the prompt.
    pub fn grant(&self, request_id: Uuid, always_allow: bool) -> bool {
        let Some(pending) = self.lock_pending().remove(&request_id) else {
            return false;
        };
        if always_allow {
            self.install_rule(
                pending.query.session_id,
                PathBuf::from(&pending.query.path),
                pending.query.tool_name.clone(),
            );
        }
        self.resolve(pending, Decision::Granted, always_allow);
        true
    }

    pub fn deny(&self, request_id: Uuid) -> bool {
        let Some(pending) = self.lock_pending().remove(&request_id) else {
            return false;
        };
        self.resolve(pending, Decision::Denied, false);
        true
    }

    pub fn allow_always(&self, session_id: Uuid, path_prefix: PathBuf, tool_name: String) {
        self.install_rule(session_id, path_prefix, tool_name);
    }

    pub fn pending_requests(&self) -> Vec<PermissionQuery> {
        self.lock_pending()
            .values()
            .map(|p| p.query.clone())
            .collect()
    }

    fn resolve(&self, pending: PendingRequest, decision: Decision, always_allow: bool) {
        self.bus.publish(GateEvent::PermissionResolvedV1 {
            request_id: pending.query.request_id,
            session_id: pending.query.session_id,
            granted: decision == Decision::Granted,
            always_allow,
        });
        // A waiter that already gave up (canceled) is fine to miss.
        let _ = pending.sender.send(decision);
    }

    fn auto_approved(&self, action: &str) -> bool {
        match action {
            "write" | "edit" => self.config.auto_approve_edits,
            "execute" => self.config.auto_approve_shell,
            _ => false,
        }
    }

    fn covered_by_rule(&self, session_id: Uuid, path: &Path, tool_name: &str) -> bool {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.get(&session_id).is_some_and(|session_rules| {
            session_rules
                .iter()
                .any(|rule| rule.tool_name == tool_name && path.starts_with(&rule.path_prefix))
        })
    }

    fn install_rule(&self, session_id: Uuid, path_prefix: PathBuf, tool_name: String) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.entry(session_id).or_default().push(AllowRule {
            path_prefix,
            tool_name,
        });
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
