//! Interactive terminal session used when commands should run in the user's
//! shell instead of a supervised child process.
//!
//! There is at most one session per manager, named after the tool. It is
//! created on first use and forgotten once the host reports it closed. Text
//! sent to it is fire-and-forget: nothing here tracks or cancels what the
//! shell does with it.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::TOOL_NAME;
use crate::config::ConfigSource;

mod errors;
mod pty;

pub use errors::TerminalError;
pub use pty::PtyTerminalHost;

pub trait TerminalHandle: Send + Sync {
    fn name(&self) -> &str;

    fn is_alive(&self) -> bool;

    fn show(&self, preserve_focus: bool);

    fn clear(&self);

    fn send_text(&self, text: &str, add_newline: bool) -> Result<(), TerminalError>;
}

/// Owner of terminal sessions, e.g. an editor's terminal panel or a PTY.
pub trait TerminalHost: Send + Sync {
    /// Live session with this name, if the host has one.
    fn find(&self, name: &str) -> Option<Arc<dyn TerminalHandle>>;

    fn create(&self, name: &str) -> Result<Arc<dyn TerminalHandle>, TerminalError>;

    /// Names of sessions as they close. Hosts that cannot report closures
    /// return `None`; the manager then relies on [`TerminalHandle::is_alive`].
    fn closed_sessions(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

#[derive(Clone)]
pub struct TerminalSessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    host: Arc<dyn TerminalHost>,
    config: Arc<dyn ConfigSource>,
    session: StdMutex<Option<Arc<dyn TerminalHandle>>>,
}

impl TerminalSessionManager {
    pub fn new(host: Arc<dyn TerminalHost>, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                host,
                config,
                session: StdMutex::new(None),
            }),
        }
    }

    pub fn has_session(&self) -> bool {
        self.inner
            .lock_session()
            .as_ref()
            .is_some_and(|session| session.is_alive())
    }

    /// Types `command` into the session, creating the session first if there
    /// is none.
    pub fn send_to_session(&self, command: &str) -> Result<(), TerminalError> {
        let config = self.inner.config.load();
        let session = self.inner.session()?;
        if config.show_output_before_run {
            session.show(true);
        }
        if config.clear_output_before_run {
            session.clear();
        }
        tracing::info!(session = session.name(), command, "sending command to terminal");
        session.send_text(command, true)
    }

    /// Forgets the cached session if `name` is ours. Returns whether anything
    /// was forgotten.
    pub fn handle_session_closed(&self, name: &str) -> bool {
        self.inner.handle_session_closed(name)
    }

    /// Listens for closure notifications from the host. Returns `None` when
    /// the host does not publish them. The listener stops once every manager
    /// handle is dropped or the host stops publishing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch_host_closures(&self) -> Option<JoinHandle<()>> {
        let mut closed = self.inner.host.closed_sessions()?;
        let inner: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            loop {
                match closed.recv().await {
                    Ok(name) => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        inner.handle_session_closed(&name);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "missed terminal closure notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}

impl ManagerInner {
    fn lock_session(&self) -> MutexGuard<'_, Option<Arc<dyn TerminalHandle>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<Arc<dyn TerminalHandle>, TerminalError> {
        let mut cached = self.lock_session();
        if let Some(session) = cached.as_ref().filter(|session| session.is_alive()) {
            return Ok(Arc::clone(session));
        }

        let session = match self
            .host
            .find(TOOL_NAME)
            .filter(|session| session.is_alive())
        {
            Some(session) => session,
            None => {
                let session = self.host.create(TOOL_NAME)?;
                tracing::info!(session = session.name(), "created terminal session");
                session
            }
        };
        *cached = Some(Arc::clone(&session));
        Ok(session)
    }

    fn handle_session_closed(&self, name: &str) -> bool {
        let mut cached = self.lock_session();
        if cached.as_ref().is_some_and(|session| session.name() == name) {
            tracing::debug!(session = name, "terminal session closed");
            *cached = None;
            return true;
        }
        false
    }
}
