//! Session registry.
//!
//! This module provides a thread-safe registry that creates, looks up,
//! enumerates and removes sessions. It is an explicit object handed to the
//! HTTP layer and the orchestrator, whose `shutdown` is tied to daemon
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::SessionInfo;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::instance::{Session, SessionSettings, SessionSpec};
use super::{SessionError, SessionId};

/// How long a terminated process gets to exit before it is SIGKILLed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long removal waits after SIGKILL before forcing the exit.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for session registry operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionRegistry: Send + Sync {
    /// Spawns a session and registers it.
    ///
    /// Fails with `SpawnFailed` if the backend cannot start, `AlreadyExists`
    /// if a tmux session of that name is registered, and `LimitReached` when
    /// the configured number of running sessions is reached.
    async fn create(&self, spec: SessionSpec) -> Result<Arc<Session>, SessionError>;

    /// Looks a session up.
    fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError>;

    /// Snapshot of every registered session.
    async fn list(&self) -> Vec<SessionInfo>;

    /// Terminates and unregisters a session.
    ///
    /// Attached clients receive the exit notice first. Removing an unknown
    /// id is a no-op.
    async fn remove(&self, session_id: &str);

    /// Removes every session, leaving no child process behind.
    async fn shutdown(&self);

    /// Checks if a session is registered.
    fn exists(&self, session_id: &str) -> bool;

    /// Returns the number of registered sessions.
    fn count(&self) -> usize;
}

/// Thread-safe session registry implementation using DashMap.
pub struct SessionRegistryImpl {
    sessions: DashMap<SessionId, Arc<Session>>,
    settings: SessionSettings,
    max_sessions: usize,
    /// Serializes the limit check with insertion.
    create_lock: Mutex<()>,
}

impl SessionRegistryImpl {
    /// Creates an empty registry.
    pub fn new(settings: SessionSettings, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
            max_sessions,
            create_lock: Mutex::new(()),
        }
    }

    /// Settings applied to new sessions.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Number of sessions whose process is still running.
    pub fn running_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }

    /// Terminates and unregisters a session, optionally with a specific signal.
    pub async fn remove_with_signal(&self, session_id: &str, signal: Option<i32>) {
        let Some(session) = self.sessions.get(session_id).map(|e| Arc::clone(e.value())) else {
            tracing::debug!(session_id = %session_id, "Remove of unknown session ignored");
            return;
        };

        if let Err(e) = session.kill(signal).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to kill session");
        }
        reap(&session).await;

        if self.sessions.remove(session_id).is_some() {
            tracing::info!(session_id = %session_id, "Session removed");
        }
    }
}

/// Waits for a stopped session to finish, escalating to SIGKILL if it
/// lingers past the grace period.
async fn reap(session: &Session) {
    if tokio::time::timeout(KILL_GRACE, session.wait_for_exit())
        .await
        .is_ok()
    {
        return;
    }

    if let Err(e) = session.force_kill().await {
        tracing::warn!(session_id = %session.id(), error = %e, "Failed to SIGKILL session");
    }
    if tokio::time::timeout(REAP_TIMEOUT, session.wait_for_exit())
        .await
        .is_err()
    {
        tracing::warn!(session_id = %session.id(), "Session did not exit in time, forcing");
        session.finalize(-1).await;
    }
}

impl Default for SessionRegistryImpl {
    fn default() -> Self {
        Self::new(SessionSettings::default(), 10)
    }
}

impl SessionRegistry for SessionRegistryImpl {
    async fn create(&self, spec: SessionSpec) -> Result<Arc<Session>, SessionError> {
        let _guard = self.create_lock.lock().await;

        let running = self.running_count();
        if running >= self.max_sessions {
            return Err(SessionError::LimitReached(running));
        }

        let session_id = match spec.tmux_session.as_deref() {
            Some(name) => {
                protocol::validate_session_id(name)
                    .map_err(|_| SessionError::InvalidId(name.to_string()))?;
                if self.sessions.contains_key(name) {
                    return Err(SessionError::AlreadyExists(name.to_string()));
                }
                name.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let session = Session::spawn(session_id.clone(), spec, &self.settings)?;
        self.sessions.insert(session_id.clone(), Arc::clone(&session));

        tracing::info!(
            session_id = %session_id,
            backend = ?session.kind(),
            pid = ?session.pid(),
            "Created new session"
        );

        Ok(session)
    }

    fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn list(&self) -> Vec<SessionInfo> {
        // Collect first: no DashMap guard may be held across an await.
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    async fn remove(&self, session_id: &str) {
        self.remove_with_signal(session_id, None).await;
    }

    async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::info!(count = sessions.len(), "Shutting down sessions");

        join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.shutdown().await {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to stop session");
            }
            reap(session).await;
        }))
        .await;

        self.sessions.clear();
    }

    fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::SessionStatus;
    use tokio::time::timeout;

    fn registry(max_sessions: usize) -> SessionRegistryImpl {
        let settings = SessionSettings {
            default_shell: "/bin/sh".to_string(),
            ..Default::default()
        };
        SessionRegistryImpl::new(settings, max_sessions)
    }

    fn sleeper() -> SessionSpec {
        SessionSpec::command("/bin/sh", &["-c", "sleep 30"])
    }

    #[tokio::test]
    async fn test_registry_create_session() {
        let registry = registry(10);

        let session = registry.create(sleeper()).await.unwrap();
        assert_eq!(session.id().len(), 36);
        assert!(registry.exists(session.id()));
        assert_eq!(registry.count(), 1);

        registry.remove(session.id()).await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_create_spawn_failure() {
        let registry = registry(10);

        let spec = SessionSpec::command("shellcast-no-such-binary", &[]);
        assert!(matches!(
            registry.create(spec).await,
            Err(SessionError::SpawnFailed(_))
        ));

        let spec = SessionSpec {
            cwd: Some("/definitely/not/a/dir".to_string()),
            ..sleeper()
        };
        assert!(matches!(
            registry.create(spec).await,
            Err(SessionError::SpawnFailed(_))
        ));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_get_session() {
        let registry = registry(10);
        let session = registry.create(sleeper()).await.unwrap();

        let found = registry.get(session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));

        registry.remove(session.id()).await;
    }

    #[tokio::test]
    async fn test_registry_get_nonexistent_session() {
        let registry = registry(10);
        assert!(matches!(
            registry.get("nonexistent"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_list() {
        let registry = registry(10);

        let first = registry.create(sleeper()).await.unwrap();
        let second = registry.create(sleeper()).await.unwrap();

        let sessions = registry.list().await;
        assert_eq!(sessions.len(), 2);
        let ids: Vec<_> = sessions.iter().map(|s| s.id.clone()).collect();
        assert!(ids.contains(first.id()));
        assert!(ids.contains(second.id()));
        assert!(sessions.iter().all(|s| s.status == SessionStatus::Running));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_limit_counts_running_sessions() {
        let registry = registry(1);

        let first = registry.create(sleeper()).await.unwrap();
        assert!(matches!(
            registry.create(sleeper()).await,
            Err(SessionError::LimitReached(1))
        ));

        first.kill(None).await.unwrap();
        timeout(Duration::from_secs(5), first.wait_for_exit())
            .await
            .unwrap();

        // The exited session stays registered but no longer counts.
        assert!(registry.exists(first.id()));
        let second = registry.create(sleeper()).await.unwrap();
        assert_eq!(registry.count(), 2);

        registry.remove(second.id()).await;
    }

    #[tokio::test]
    async fn test_registry_exited_session_stays_queryable() {
        let registry = registry(10);
        let session = registry
            .create(SessionSpec::command("/bin/sh", &["-c", "echo hi"]))
            .await
            .unwrap();

        let code = timeout(Duration::from_secs(10), session.wait_for_exit())
            .await
            .unwrap();
        assert_eq!(code, 0);

        let info = registry.get(session.id()).unwrap().info().await;
        assert_eq!(info.status, SessionStatus::Exited);
        assert_eq!(info.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_registry_remove_notifies_clients() {
        let registry = registry(10);
        let session = registry.create(sleeper()).await.unwrap();
        let mut sub = session.attach("viewer").await.subscription.unwrap();

        registry.remove(session.id()).await;
        assert!(!registry.exists(session.id()));

        let mut saw_exit = false;
        while let Some(item) = sub.rx.recv().await {
            if matches!(
                item,
                crate::session::Outbound::Message(protocol::ServerMessage::Exit { .. })
            ) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[tokio::test]
    async fn test_registry_remove_is_idempotent() {
        let registry = registry(10);
        registry.remove("nonexistent").await;

        let session = registry.create(sleeper()).await.unwrap();
        registry.remove(session.id()).await;
        registry.remove(session.id()).await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_remove_with_signal() {
        let registry = registry(10);
        let session = registry.create(sleeper()).await.unwrap();

        registry.remove_with_signal(session.id(), Some(15)).await;
        assert!(!session.is_running());
        assert_ne!(session.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_registry_shutdown_reaps_everything() {
        let registry = registry(10);
        let sessions = vec![
            registry.create(sleeper()).await.unwrap(),
            registry.create(sleeper()).await.unwrap(),
            registry.create(sleeper()).await.unwrap(),
        ];

        registry.shutdown().await;

        assert_eq!(registry.count(), 0);
        assert!(sessions.iter().all(|s| !s.is_running()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_registry_shutdown_kills_hup_ignoring_child() {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let registry = registry(10);
        let spec = SessionSpec::command("/bin/sh", &["-c", "trap '' HUP; while :; do sleep 1; done"]);
        let session = registry.create(spec).await.unwrap();
        let group = Pid::from_raw(session.pid().unwrap() as i32);

        timeout(Duration::from_secs(15), registry.shutdown())
            .await
            .unwrap();
        assert_eq!(registry.count(), 0);
        assert!(!session.is_running());

        let gone = timeout(Duration::from_secs(5), async {
            while killpg(group, None) != Err(Errno::ESRCH) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "process group {group} still alive after shutdown");
    }

    #[tokio::test]
    async fn test_registry_rejects_invalid_tmux_name() {
        let registry = registry(10);
        let spec = SessionSpec {
            tmux_session: Some("bad name!".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            registry.create(spec).await,
            Err(SessionError::InvalidId(_))
        ));
    }
}
