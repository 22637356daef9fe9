//! Permission/question broker.
//!
//! Correlates a runtime's blocking capability request with a later decision
//! from the presentation layer. Each live session owns a slot holding its
//! pending resolvers and its session-scope allow-list. Resolvers are one-shot
//! channels: a request is removed from the slot when it is answered, so a
//! second answer (or one after `stop`) fails with [`BrokerError::UnknownRequest`].

use crate::error::BrokerError;
use crate::textutil::single_line_preview;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Denial message used when a session stops with requests outstanding.
pub const STOPPED_MESSAGE: &str = "session stopped before the request was answered";

// ---------------------------------------------------------------------------
// Allow-list
// ---------------------------------------------------------------------------

/// Signature of a tool invocation for session-scope allow matching.
///
/// Command-running tools are keyed by their exact command so allowing
/// `git status` does not also allow `rm -rf`; every other tool is keyed by name.
pub fn tool_signature(tool_name: &str, input: &Value) -> String {
    match input.get("command").and_then(Value::as_str) {
        Some(command) => {
            let digest = Sha256::digest(command.as_bytes());
            let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
            format!("{tool_name}({hex})")
        }
        None => tool_name.to_string(),
    }
}

/// Tool signatures the user allowed for the rest of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowList {
    signatures: BTreeSet<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signatures(signatures: impl IntoIterator<Item = String>) -> Self {
        Self {
            signatures: signatures.into_iter().collect(),
        }
    }

    pub fn allows(&self, tool_name: &str, input: &Value) -> bool {
        self.signatures.contains(&tool_signature(tool_name, input))
    }

    /// Record a session-scope allow. Returns false if it was already present.
    pub fn allow(&mut self, tool_name: &str, input: &Value) -> bool {
        self.signatures.insert(tool_signature(tool_name, input))
    }

    pub fn signatures(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Allow-list shared between a session's adapter and the broker.
pub type SharedAllowList = Arc<Mutex<AllowList>>;

pub fn shared_allow_list(initial: AllowList) -> SharedAllowList {
    Arc::new(Mutex::new(initial))
}

/// Lock a shared allow-list, recovering the data if a holder panicked.
pub fn lock_allow_list(list: &SharedAllowList) -> MutexGuard<'_, AllowList> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A runtime is blocked waiting for permission to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Whether "allow for the rest of this session" is offered.
    pub allow_for_session: bool,
    /// Short human-readable preview of the input.
    pub preview: String,
}

/// Input needed to register a permission request.
#[derive(Debug, Clone, Default)]
pub struct PermissionDraft {
    /// Runtime-assigned id, when the runtime correlates replies itself.
    pub request_id: Option<String>,
    pub tool_name: String,
    pub tool_input: Value,
    pub tool_use_id: Option<String>,
}

/// One question inside a question request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Question {
    /// Parse one question from a runtime payload (`multiSelect` or `multiple`).
    pub fn from_value(value: &Value) -> Option<Self> {
        let question = value.get("question")?.as_str()?.to_string();
        let options = value
            .get("options")
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .filter_map(|option| {
                        Some(QuestionOption {
                            label: option.get("label")?.as_str()?.to_string(),
                            description: option
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let multi_select = value
            .get("multiSelect")
            .or_else(|| value.get("multiple"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            question,
            header: value
                .get("header")
                .and_then(Value::as_str)
                .map(str::to_string),
            options,
            multi_select,
        })
    }
}

/// A runtime is blocked waiting for the user to answer questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub request_id: String,
    pub session_id: String,
    pub questions: Vec<Question>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

/// Whether an allow applies once or for the rest of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    #[default]
    Once,
    Session,
}

/// Decision from the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionResponse {
    Allow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(default)]
        scope: PermissionScope,
    },
    Deny {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl PermissionResponse {
    pub fn allow_once() -> Self {
        Self::Allow {
            updated_input: None,
            scope: PermissionScope::Once,
        }
    }

    pub fn allow_for_session() -> Self {
        Self::Allow {
            updated_input: None,
            scope: PermissionScope::Session,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: Some(message.into()),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// What the adapter's blocked callback receives.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionOutcome {
    Allow {
        /// Input the tool should run with (edited, or the original).
        input: Value,
        scope: PermissionScope,
    },
    Deny {
        message: String,
        /// True when the denial came from a session stop.
        stopped: bool,
    },
}

/// Answers to a question request, one selection list per question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub answers: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionOutcome {
    Answered(QuestionAnswer),
    Rejected { message: String },
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

enum Pending {
    Permission {
        request: PermissionRequest,
        resolver: oneshot::Sender<PermissionOutcome>,
    },
    Question {
        resolver: oneshot::Sender<QuestionOutcome>,
    },
}

struct SessionSlot {
    allow_list: SharedAllowList,
    pending: HashMap<String, Pending>,
    next_nonce: u64,
}

impl SessionSlot {
    fn next_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{:04x}", self.next_nonce);
        self.next_nonce = self.next_nonce.saturating_add(1);
        id
    }
}

/// Per-session pending-request registry shared by all adapters.
#[derive(Default)]
pub struct PermissionBroker {
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("sessions", &self.lock().len())
            .finish()
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the slot for a session. Reopening keeps nothing from before.
    pub fn open_session(&self, session_id: &str, allow_list: SharedAllowList) {
        let previous = self.lock().insert(
            session_id.to_string(),
            SessionSlot {
                allow_list,
                pending: HashMap::new(),
                next_nonce: 1,
            },
        );
        if let Some(previous) = previous {
            deny_all(session_id, previous.pending);
        }
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Session-scope fast path: true when the tool was allowed for the session.
    pub fn is_allowed(&self, session_id: &str, tool_name: &str, input: &Value) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|slot| lock_allow_list(&slot.allow_list).allows(tool_name, input))
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map_or(0, |slot| slot.pending.len())
    }

    pub fn register_permission(
        &self,
        session_id: &str,
        draft: PermissionDraft,
    ) -> Result<(PermissionRequest, oneshot::Receiver<PermissionOutcome>), BrokerError> {
        let mut sessions = self.lock();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))?;
        let request_id = match draft.request_id {
            Some(id) => id,
            None => slot.next_id("perm"),
        };
        let request = PermissionRequest {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            preview: input_preview(&draft.tool_input),
            tool_name: draft.tool_name,
            tool_input: draft.tool_input,
            tool_use_id: draft.tool_use_id,
            allow_for_session: true,
        };
        let (resolver, receiver) = oneshot::channel();
        slot.pending.insert(
            request_id.clone(),
            Pending::Permission {
                request: request.clone(),
                resolver,
            },
        );
        debug!(session_id, request_id = %request_id, tool = %request.tool_name, "permission request pending");
        Ok((request, receiver))
    }

    pub fn register_question(
        &self,
        session_id: &str,
        request_id: Option<String>,
        questions: Vec<Question>,
        tool_use_id: Option<String>,
    ) -> Result<(QuestionRequest, oneshot::Receiver<QuestionOutcome>), BrokerError> {
        let mut sessions = self.lock();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))?;
        let request_id = match request_id {
            Some(id) => id,
            None => slot.next_id("ques"),
        };
        let (resolver, receiver) = oneshot::channel();
        slot.pending
            .insert(request_id.clone(), Pending::Question { resolver });
        debug!(session_id, request_id = %request_id, count = questions.len(), "question request pending");
        Ok((
            QuestionRequest {
                request_id,
                session_id: session_id.to_string(),
                questions,
                tool_use_id,
            },
            receiver,
        ))
    }

    /// Resolve a pending permission request exactly once.
    ///
    /// A session-scope allow is folded into the session's allow-list before
    /// the runtime is unblocked.
    pub fn respond_permission(
        &self,
        session_id: &str,
        request_id: &str,
        response: PermissionResponse,
    ) -> Result<(), BrokerError> {
        let mut sessions = self.lock();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))?;
        let Some(pending) = slot.pending.remove(request_id) else {
            return Err(unknown_request(session_id, request_id));
        };
        let (request, resolver) = match pending {
            Pending::Permission { request, resolver } => (request, resolver),
            other @ Pending::Question { .. } => {
                slot.pending.insert(request_id.to_string(), other);
                return Err(BrokerError::KindMismatch {
                    request_id: request_id.to_string(),
                });
            }
        };
        let outcome = match response {
            PermissionResponse::Allow {
                updated_input,
                scope,
            } => {
                if scope == PermissionScope::Session {
                    lock_allow_list(&slot.allow_list).allow(&request.tool_name, &request.tool_input);
                }
                PermissionOutcome::Allow {
                    input: updated_input.unwrap_or(request.tool_input),
                    scope,
                }
            }
            PermissionResponse::Deny { message } => PermissionOutcome::Deny {
                message: message.unwrap_or_else(|| "denied by user".to_string()),
                stopped: false,
            },
        };
        info!(session_id, request_id, allowed = matches!(outcome, PermissionOutcome::Allow { .. }), "permission resolved");
        // The adapter may have stopped listening; the request is still consumed.
        let _ = resolver.send(outcome);
        Ok(())
    }

    pub fn respond_question(
        &self,
        session_id: &str,
        request_id: &str,
        answer: QuestionAnswer,
    ) -> Result<(), BrokerError> {
        let mut sessions = self.lock();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::UnknownSession(session_id.to_string()))?;
        let Some(pending) = slot.pending.remove(request_id) else {
            return Err(unknown_request(session_id, request_id));
        };
        match pending {
            Pending::Question { resolver } => {
                info!(session_id, request_id, "question answered");
                let _ = resolver.send(QuestionOutcome::Answered(answer));
                Ok(())
            }
            other @ Pending::Permission { .. } => {
                slot.pending.insert(request_id.to_string(), other);
                Err(BrokerError::KindMismatch {
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    /// Deny everything pending and drop the session slot.
    ///
    /// Returns the ids that were denied, in no particular order.
    pub fn close_session(&self, session_id: &str) -> Vec<String> {
        match self.lock().remove(session_id) {
            Some(slot) => deny_all(session_id, slot.pending),
            None => Vec::new(),
        }
    }

    /// Snapshot of the pending permission requests for a session.
    pub fn pending_permissions(&self, session_id: &str) -> Vec<PermissionRequest> {
        self.lock()
            .get(session_id)
            .map(|slot| {
                slot.pending
                    .values()
                    .filter_map(|pending| match pending {
                        Pending::Permission { request, .. } => Some(request.clone()),
                        Pending::Question { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn unknown_request(session_id: &str, request_id: &str) -> BrokerError {
    BrokerError::UnknownRequest {
        session_id: session_id.to_string(),
        request_id: request_id.to_string(),
    }
}

fn deny_all(session_id: &str, pending: HashMap<String, Pending>) -> Vec<String> {
    let mut denied = Vec::with_capacity(pending.len());
    for (request_id, pending) in pending {
        match pending {
            Pending::Permission { resolver, .. } => {
                let _ = resolver.send(PermissionOutcome::Deny {
                    message: STOPPED_MESSAGE.to_string(),
                    stopped: true,
                });
            }
            Pending::Question { resolver } => {
                let _ = resolver.send(QuestionOutcome::Rejected {
                    message: STOPPED_MESSAGE.to_string(),
                });
            }
        }
        denied.push(request_id);
    }
    if !denied.is_empty() {
        info!(session_id, count = denied.len(), "denied pending requests on stop");
    }
    denied
}

fn input_preview(input: &Value) -> String {
    let text = match input.get("command").and_then(Value::as_str) {
        Some(command) => command.to_string(),
        None => input.to_string(),
    };
    single_line_preview(&text, 140)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker_with_session(id: &str) -> (PermissionBroker, SharedAllowList) {
        let broker = PermissionBroker::new();
        let list = shared_allow_list(AllowList::new());
        broker.open_session(id, list.clone());
        (broker, list)
    }

    fn bash(command: &str) -> PermissionDraft {
        PermissionDraft {
            tool_name: "Bash".into(),
            tool_input: json!({ "command": command }),
            ..PermissionDraft::default()
        }
    }

    #[test]
    fn signature_distinguishes_commands_but_not_other_inputs() {
        assert_ne!(
            tool_signature("Bash", &json!({"command": "ls"})),
            tool_signature("Bash", &json!({"command": "rm -rf /"}))
        );
        assert_eq!(
            tool_signature("Edit", &json!({"file_path": "a"})),
            tool_signature("Edit", &json!({"file_path": "b"}))
        );
    }

    #[tokio::test]
    async fn respond_resolves_exactly_once() {
        let (broker, _) = broker_with_session("s1");
        let (request, rx) = broker.register_permission("s1", bash("ls")).unwrap();
        assert_eq!(request.request_id, "perm-0001");

        broker
            .respond_permission("s1", &request.request_id, PermissionResponse::allow_once())
            .unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome,
            PermissionOutcome::Allow {
                input: json!({"command": "ls"}),
                scope: PermissionScope::Once,
            }
        );

        let err = broker
            .respond_permission("s1", &request.request_id, PermissionResponse::allow_once())
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownRequest { .. }));
    }

    #[tokio::test]
    async fn edited_input_replaces_original() {
        let (broker, _) = broker_with_session("s1");
        let (request, rx) = broker.register_permission("s1", bash("ls")).unwrap();
        broker
            .respond_permission(
                "s1",
                &request.request_id,
                PermissionResponse::Allow {
                    updated_input: Some(json!({"command": "ls -la"})),
                    scope: PermissionScope::Once,
                },
            )
            .unwrap();
        let PermissionOutcome::Allow { input, .. } = rx.await.unwrap() else {
            panic!("expected allow");
        };
        assert_eq!(input["command"], "ls -la");
    }

    #[tokio::test]
    async fn session_scope_allow_lands_in_allow_list() {
        let (broker, list) = broker_with_session("s1");
        let (request, _rx) = broker.register_permission("s1", bash("cargo test")).unwrap();
        assert!(!broker.is_allowed("s1", "Bash", &json!({"command": "cargo test"})));
        broker
            .respond_permission("s1", &request.request_id, PermissionResponse::allow_for_session())
            .unwrap();
        assert!(broker.is_allowed("s1", "Bash", &json!({"command": "cargo test"})));
        assert!(!broker.is_allowed("s1", "Bash", &json!({"command": "cargo build"})));
        assert_eq!(lock_allow_list(&list).len(), 1);
    }

    #[tokio::test]
    async fn close_session_denies_everything_pending() {
        let (broker, _) = broker_with_session("s1");
        let (perm, perm_rx) = broker.register_permission("s1", bash("ls")).unwrap();
        let (question, question_rx) = broker
            .register_question("s1", None, Vec::new(), None)
            .unwrap();

        let mut denied = broker.close_session("s1");
        denied.sort();
        assert_eq!(denied, vec![perm.request_id.clone(), question.request_id.clone()]);

        assert!(matches!(
            perm_rx.await.unwrap(),
            PermissionOutcome::Deny { stopped: true, .. }
        ));
        assert!(matches!(
            question_rx.await.unwrap(),
            QuestionOutcome::Rejected { .. }
        ));
        assert_eq!(
            broker.respond_permission("s1", &perm.request_id, PermissionResponse::allow_once()),
            Err(BrokerError::UnknownSession("s1".into()))
        );
    }

    #[tokio::test]
    async fn kind_mismatch_keeps_request_pending() {
        let (broker, _) = broker_with_session("s1");
        let (question, rx) = broker
            .register_question("s1", Some("q-1".into()), Vec::new(), None)
            .unwrap();
        assert!(matches!(
            broker.respond_permission("s1", &question.request_id, PermissionResponse::allow_once()),
            Err(BrokerError::KindMismatch { .. })
        ));
        assert_eq!(broker.pending_count("s1"), 1);
        broker
            .respond_question(
                "s1",
                "q-1",
                QuestionAnswer {
                    answers: vec![vec!["Yes".into()]],
                },
            )
            .unwrap();
        assert_eq!(
            rx.await.unwrap(),
            QuestionOutcome::Answered(QuestionAnswer {
                answers: vec![vec!["Yes".into()]],
            })
        );
    }

    #[test]
    fn question_parses_runtime_shapes() {
        let q = Question::from_value(&json!({
            "question": "Which db?", "header": "DB",
            "options": [{"label": "pg", "description": "Postgres"}, {"label": "lite"}],
            "multiSelect": true
        }))
        .unwrap();
        assert_eq!(q.options.len(), 2);
        assert!(q.multi_select);
        assert_eq!(q.options[0].description.as_deref(), Some("Postgres"));
    }
}
