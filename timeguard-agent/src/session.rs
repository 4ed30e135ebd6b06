//! OS session collaborators
//!
//! The agent never talks to the operating system directly; every lock,
//! shutdown, popup and lock-state query goes through [`SessionControl`]:
//! - [`SystemSession`]: shells out to the platform tools
//! - [`DryRunSession`]: records actions in memory (dry runs and tests)

use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Title used for popups raised by the agent
pub const MESSAGE_TITLE: &str = "PC Time Control";

/// Trait for OS-level session actions and queries.
///
/// Implementations may block; callers run them on the blocking pool.
pub trait SessionControl: Send + Sync {
    /// Lock the interactive session
    fn lock_session(&self) -> Result<(), SessionError>;

    /// Power off after `delay`
    fn shutdown(&self, delay: Duration) -> Result<(), SessionError>;

    /// Abort a pending shutdown
    fn cancel_shutdown(&self) -> Result<(), SessionError>;

    /// Show a popup to the local user without waiting for it to be dismissed
    fn show_message(&self, title: &str, text: &str) -> Result<(), SessionError>;

    /// Whether the session is currently locked, whoever locked it
    fn is_session_locked(&self) -> Result<bool, SessionError>;

    /// Local host identifier
    fn hostname(&self) -> String;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("session action aborted: {0}")]
    Aborted(String),
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Session control backed by the platform's command line tools
#[derive(Debug, Default)]
pub struct SystemSession;

impl SystemSession {
    pub fn new() -> Self {
        Self
    }
}

fn run(program: &str, args: &[&str]) -> Result<String, SessionError> {
    debug!(program, ?args, "Running session command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| SessionError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SessionError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn spawn_detached(program: &str, args: &[&str]) -> Result<(), SessionError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|source| SessionError::Spawn {
            program: program.to_string(),
            source,
        })
}

#[cfg(windows)]
impl SessionControl for SystemSession {
    fn lock_session(&self) -> Result<(), SessionError> {
        run("rundll32.exe", &["user32.dll,LockWorkStation"]).map(|_| ())
    }

    fn shutdown(&self, delay: Duration) -> Result<(), SessionError> {
        let secs = delay.as_secs().to_string();
        let comment = format!("Computer will shutdown in {} seconds", secs);
        run("shutdown", &["/s", "/t", &secs, "/c", &comment]).map(|_| ())
    }

    fn cancel_shutdown(&self) -> Result<(), SessionError> {
        run("shutdown", &["/a"]).map(|_| ())
    }

    fn show_message(&self, title: &str, text: &str) -> Result<(), SessionError> {
        let body = format!("{}: {}", title, text);
        spawn_detached("msg", &["*", &body])
    }

    fn is_session_locked(&self) -> Result<bool, SessionError> {
        // LogonUI.exe only runs while the lock screen is up
        let out = run("tasklist", &["/FI", "IMAGENAME eq LogonUI.exe", "/NH"])?;
        Ok(out.contains("LogonUI.exe"))
    }

    fn hostname(&self) -> String {
        local_hostname()
    }
}

#[cfg(not(windows))]
impl SystemSession {
    fn session_id() -> String {
        std::env::var("XDG_SESSION_ID").unwrap_or_else(|_| "auto".to_string())
    }
}

#[cfg(not(windows))]
impl SessionControl for SystemSession {
    fn lock_session(&self) -> Result<(), SessionError> {
        run("loginctl", &["lock-session", &Self::session_id()]).map(|_| ())
    }

    fn shutdown(&self, delay: Duration) -> Result<(), SessionError> {
        // shutdown(8) takes whole minutes
        let minutes = format!("+{}", delay.as_secs().div_ceil(60));
        run("shutdown", &["-h", &minutes]).map(|_| ())
    }

    fn cancel_shutdown(&self) -> Result<(), SessionError> {
        run("shutdown", &["-c"]).map(|_| ())
    }

    fn show_message(&self, title: &str, text: &str) -> Result<(), SessionError> {
        spawn_detached("notify-send", &["--urgency=critical", title, text])
    }

    fn is_session_locked(&self) -> Result<bool, SessionError> {
        let out = run(
            "loginctl",
            &["show-session", &Self::session_id(), "-p", "LockedHint", "--value"],
        )?;
        Ok(out.trim() == "yes")
    }

    fn hostname(&self) -> String {
        local_hostname()
    }
}

/// An action performed through a [`DryRunSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Lock,
    Shutdown(Duration),
    CancelShutdown,
    Message { title: String, text: String },
}

#[derive(Debug, Default)]
struct DryRunInner {
    locked: bool,
    actions: Vec<SessionAction>,
    failure: Option<String>,
}

/// In-memory session that logs and records actions instead of performing them
#[derive(Debug)]
pub struct DryRunSession {
    hostname: String,
    inner: Mutex<DryRunInner>,
}

impl DryRunSession {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            inner: Mutex::new(DryRunInner::default()),
        }
    }

    /// Dry-run session named after the real host
    pub fn for_local_host() -> Self {
        Self::new(local_hostname())
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, DryRunInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the user locking or unlocking the session
    pub fn set_locked(&self, locked: bool) {
        self.inner().locked = locked;
    }

    /// Make every subsequent action fail with `reason` (`None` clears it)
    pub fn fail_with(&self, reason: Option<&str>) {
        self.inner().failure = reason.map(String::from);
    }

    pub fn actions(&self) -> Vec<SessionAction> {
        self.inner().actions.clone()
    }

    fn record(&self, action: SessionAction) -> Result<(), SessionError> {
        let mut inner = self.inner();
        if let Some(reason) = &inner.failure {
            return Err(SessionError::Aborted(reason.clone()));
        }
        info!(?action, "dry run: session action");
        if action == SessionAction::Lock {
            inner.locked = true;
        }
        inner.actions.push(action);
        Ok(())
    }
}

impl SessionControl for DryRunSession {
    fn lock_session(&self) -> Result<(), SessionError> {
        self.record(SessionAction::Lock)
    }

    fn shutdown(&self, delay: Duration) -> Result<(), SessionError> {
        self.record(SessionAction::Shutdown(delay))
    }

    fn cancel_shutdown(&self) -> Result<(), SessionError> {
        self.record(SessionAction::CancelShutdown)
    }

    fn show_message(&self, title: &str, text: &str) -> Result<(), SessionError> {
        self.record(SessionAction::Message {
            title: title.to_string(),
            text: text.to_string(),
        })
    }

    fn is_session_locked(&self) -> Result<bool, SessionError> {
        let inner = self.inner();
        match &inner.failure {
            Some(reason) => Err(SessionError::Aborted(reason.clone())),
            None => Ok(inner.locked),
        }
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }
}
