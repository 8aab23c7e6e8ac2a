//! Process-wide map from session id to bridge.
//!
//! The map itself is read-mostly and behind an `RwLock`; each bridge has its
//! own mutex, so a session waiting on the user never blocks another.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::bridge::{SessionBridge, SessionConfig};
use super::history::{HistoryRecord, load_history, parse_history};
use super::pending::{PermissionDecision, QuestionDecision};
use crate::error::{BridgeError, Result};

pub type SharedBridge = Arc<Mutex<SessionBridge>>;

/// Agent-side session ids that can be resumed, with the history file that
/// recorded each one (if any).
#[derive(Debug, Clone, Default)]
pub struct KnownSessions(Arc<RwLock<HashMap<String, Option<PathBuf>>>>);

impl KnownSessions {
    pub async fn insert(&self, cli_session_id: String, history: Option<PathBuf>) {
        let mut known = self.0.write().await;
        // Keep an existing history path if the new sighting has none.
        let entry = known.entry(cli_session_id).or_insert(None);
        if history.is_some() {
            *entry = history;
        }
    }

    /// `None` if unknown, `Some(history)` otherwise.
    pub async fn lookup(&self, cli_session_id: &str) -> Option<Option<PathBuf>> {
        self.0.read().await.get(cli_session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedBridge>>,
    known: KnownSessions,
    history_dir: Option<PathBuf>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// With a `history_dir`, every session appends to
    /// `<history_dir>/<session id>.jsonl`.
    pub fn new(history_dir: Option<PathBuf>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            known: KnownSessions::default(),
            history_dir,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn known_sessions(&self) -> KnownSessions {
        self.known.clone()
    }

    /// Index resumable sessions from the history directory. Unreadable
    /// files are skipped. Files are read oldest first, so when two files
    /// name the same agent session the most recently written one wins.
    /// Returns how many distinct sessions were found.
    pub async fn load_known_sessions(&self) -> Result<usize> {
        let Some(dir) = &self.history_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
            files.push((modified, path));
        }
        files.sort();

        let mut found = HashSet::new();
        for (_, path) in files {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "unreadable history file");
                    continue;
                }
            };
            for record in parse_history(&data).records {
                if let HistoryRecord::Session {
                    cli_session_id: Some(cli_id),
                    ..
                } = record
                {
                    found.insert(cli_id.clone());
                    self.known.insert(cli_id, Some(path.clone())).await;
                }
            }
        }
        info!(dir = %dir.display(), found = found.len(), "indexed resumable sessions");
        Ok(found.len())
    }

    fn allocate_id(&self) -> String {
        format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Validate `config`, create a bridge and register it. A resumed
    /// session's prior history is restored into the new bridge.
    pub async fn create_session(&self, mut config: SessionConfig) -> Result<(String, SharedBridge)> {
        let session_id = self.allocate_id();
        let prior = match &config.resume_session_id {
            Some(resume) => self.known.lookup(resume).await,
            None => None,
        };
        let prior_path = prior.clone().flatten();
        if config.history_path.is_none() {
            // A resumed conversation keeps appending to the file it started in.
            config.history_path = prior_path.clone().or_else(|| {
                self.history_dir
                    .as_ref()
                    .map(|dir| dir.join(format!("{session_id}.jsonl")))
            });
        }

        let mut bridge = SessionBridge::create(session_id.clone(), config, |_| prior.is_some())?;
        if let Some(path) = prior_path {
            restore_from(&mut bridge, &path);
        }

        let shared = Arc::new(Mutex::new(bridge));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), shared.clone());
        Ok((session_id, shared))
    }

    pub async fn get(&self, session_id: &str) -> Option<SharedBridge> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn require(&self, session_id: &str) -> Result<SharedBridge> {
        self.get(session_id)
            .await
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }

    pub async fn resolve_permission(
        &self,
        session_id: &str,
        token: &str,
        decision: PermissionDecision,
    ) -> Result<()> {
        let bridge = self.require(session_id).await?;
        let mut bridge = bridge.lock().await;
        bridge.resolve_permission(token, decision)
    }

    pub async fn resolve_question(
        &self,
        session_id: &str,
        token: &str,
        decision: QuestionDecision,
    ) -> Result<()> {
        let bridge = self.require(session_id).await?;
        let mut bridge = bridge.lock().await;
        bridge.resolve_question(token, decision)
    }

    /// Tear down and release a session. Its agent-side id stays resumable.
    /// Returns how many pending requests were cancelled.
    pub async fn remove(&self, session_id: &str) -> Result<usize> {
        let bridge = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        let mut bridge = bridge.lock().await;
        let cancelled = bridge.teardown();
        if let Some(cli_id) = bridge.cli_session_id() {
            self.known
                .insert(cli_id.to_string(), bridge.history_path().map(Path::to_path_buf))
                .await;
        }
        debug!(session_id, cancelled, "session released");
        Ok(cancelled)
    }

    /// Tear down every session. Returns the total number of cancelled
    /// requests.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut cancelled = 0;
        for id in ids {
            if let Ok(n) = self.remove(&id).await {
                cancelled += n;
            }
        }
        cancelled
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn restore_from(bridge: &mut SessionBridge, path: &Path) {
    match load_history(path) {
        Ok(restored) => {
            let report = bridge.restore(restored);
            if report.is_corrupted() {
                warn!(
                    path = %path.display(),
                    orphans = report.orphan_tool_results,
                    "resumed from corrupted history"
                );
            }
        }
        Err(e) => warn!(error = %e, path = %path.display(), "could not read prior history"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::message::{ContentBlock, Role, Turn};
    use crate::session::pending::{Cancellable, PermissionRequest};
    use crate::session::state::SessionStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn config() -> SessionConfig {
        SessionConfig {
            cwd: Some(PathBuf::from("/work")),
            model: Some("sonnet".into()),
            ..SessionConfig::default()
        }
    }

    fn permission() -> PermissionRequest {
        PermissionRequest {
            tool_name: "Write".into(),
            tool_input: json!({"file_path": "a.txt"}),
            suggestions: vec![],
            reason: Some("outside workspace".into()),
        }
    }

    #[tokio::test]
    async fn sessions_get_distinct_ids() {
        let registry = SessionRegistry::new(None);
        let (a, _) = registry.create_session(config()).await.unwrap();
        let (b, _) = registry.create_session(config()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn invalid_config_registers_nothing() {
        let registry = SessionRegistry::new(None);
        let err = registry
            .create_session(SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn resolve_through_registry() {
        let registry = SessionRegistry::new(None);
        let (id, bridge) = registry.create_session(config()).await.unwrap();
        let pending = bridge
            .lock()
            .await
            .register_permission_request("t", permission())
            .unwrap();

        assert!(matches!(
            registry
                .resolve_permission("missing", "t", PermissionDecision::Allow)
                .await,
            Err(BridgeError::SessionNotFound(_))
        ));
        registry
            .resolve_permission(&id, "t", PermissionDecision::Allow)
            .await
            .unwrap();
        assert_eq!(pending.await, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn waiting_session_does_not_block_others() {
        let registry = Arc::new(SessionRegistry::new(None));
        let (a, bridge_a) = registry.create_session(config()).await.unwrap();
        let (b, bridge_b) = registry.create_session(config()).await.unwrap();

        let pending_a = bridge_a
            .lock()
            .await
            .register_permission_request("ta", permission())
            .unwrap();
        let waiter = tokio::spawn(pending_a);

        let pending_b = bridge_b
            .lock()
            .await
            .register_permission_request("tb", permission())
            .unwrap();
        registry
            .resolve_permission(&b, "tb", PermissionDecision::Allow)
            .await
            .unwrap();
        assert_eq!(pending_b.await, PermissionDecision::Allow);
        assert!(!waiter.is_finished());

        registry
            .resolve_permission(&a, "ta", PermissionDecision::Deny { message: None })
            .await
            .unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            PermissionDecision::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_all_sessions() {
        let registry = SessionRegistry::new(None);
        let (_, a) = registry.create_session(config()).await.unwrap();
        let (_, b) = registry.create_session(config()).await.unwrap();
        let pa = a.lock().await.register_permission_request("x", permission()).unwrap();
        let pb = b.lock().await.register_permission_request("y", permission()).unwrap();

        assert_eq!(registry.shutdown().await, 2);
        assert!(registry.is_empty().await);
        assert!(pa.await.is_cancelled());
        assert!(pb.await.is_cancelled());
        assert_eq!(a.lock().await.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn resume_restores_prior_history() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));
        let (first, bridge) = registry.create_session(config()).await.unwrap();
        {
            let mut bridge = bridge.lock().await;
            bridge.mark_running(Some("cli-abc"));
            bridge.append_message(Turn::user_text("hello")).unwrap();
        }
        registry.remove(&first).await.unwrap();

        let err = registry
            .create_session(SessionConfig {
                resume_session_id: Some("cli-nope".into()),
                ..config()
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Configuration(_)));

        let (_, resumed) = registry
            .create_session(SessionConfig {
                resume_session_id: Some("cli-abc".into()),
                ..config()
            })
            .await
            .unwrap();
        let resumed = resumed.lock().await;
        assert_eq!(resumed.messages(), &[Turn::user_text("hello")]);
        assert_eq!(resumed.cli_session_id(), Some("cli-abc"));
    }

    async fn resume(registry: &SessionRegistry, cli_id: &str) -> (String, SharedBridge) {
        registry
            .create_session(SessionConfig {
                resume_session_id: Some(cli_id.into()),
                ..config()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_resume_keeps_every_turn() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));
        let (first, bridge) = registry.create_session(config()).await.unwrap();
        {
            let mut bridge = bridge.lock().await;
            bridge.mark_running(Some("cli-x"));
            bridge.append_message(Turn::user_text("one")).unwrap();
        }
        registry.remove(&first).await.unwrap();

        let (second, bridge) = resume(&registry, "cli-x").await;
        bridge
            .lock()
            .await
            .append_message(Turn::user_text("two"))
            .unwrap();
        registry.remove(&second).await.unwrap();

        let (_, third) = resume(&registry, "cli-x").await;
        assert_eq!(
            third.lock().await.messages(),
            &[Turn::user_text("one"), Turn::user_text("two")]
        );

        let reindexed = SessionRegistry::new(Some(dir.path().to_path_buf()));
        assert_eq!(reindexed.load_known_sessions().await.unwrap(), 1);
        let (_, fourth) = resume(&reindexed, "cli-x").await;
        assert_eq!(fourth.lock().await.messages().len(), 2);
    }

    #[tokio::test]
    async fn result_for_tool_use_before_resume_is_kept() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));
        let (first, bridge) = registry.create_session(config()).await.unwrap();
        {
            let mut bridge = bridge.lock().await;
            bridge.mark_running(Some("cli-t"));
            bridge
                .append_message(Turn {
                    id: Some("m1".into()),
                    role: Role::Assistant,
                    blocks: vec![ContentBlock::ToolUse {
                        id: "tu".into(),
                        name: "Bash".into(),
                        input: json!({"command": "ls"}),
                    }],
                })
                .unwrap();
        }
        registry.remove(&first).await.unwrap();

        let (_, resumed) = resume(&registry, "cli-t").await;
        let mut resumed = resumed.lock().await;
        resumed
            .append_message(Turn {
                id: None,
                role: Role::User,
                blocks: vec![ContentBlock::ToolResult {
                    tool_use_id: "tu".into(),
                    content: json!("a.txt"),
                    is_error: false,
                }],
            })
            .unwrap();
        assert_eq!(resumed.messages().len(), 2);

        let path = resumed.history_path().unwrap().to_path_buf();
        drop(resumed);
        assert!(!load_history(&path).unwrap().report.is_corrupted());
    }

    #[tokio::test]
    async fn known_sessions_indexed_from_disk() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("old.jsonl"),
            "{\"type\":\"session\",\"session_id\":\"session-9\",\"cli_session_id\":\"cli-old\"}\nnot json\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = SessionRegistry::new(Some(dir.path().to_path_buf()));
        assert_eq!(registry.load_known_sessions().await.unwrap(), 1);
        assert!(registry.known_sessions().lookup("cli-old").await.is_some());
    }
}
