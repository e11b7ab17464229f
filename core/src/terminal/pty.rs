use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use super::TerminalError;
use super::TerminalHandle;
use super::TerminalHost;
use crate::exec::Utf8Chunker;
use crate::output::OutputSink;

const WRITER_CHANNEL_CAPACITY: usize = 128;
const CLOSED_CHANNEL_CAPACITY: usize = 16;

// "Clear screen, cursor home."
const CLEAR_SEQUENCE: &str = "\x1b[2J\x1b[H";

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

/// Runs interactive shells in pseudo terminals and mirrors what they print
/// into an [`OutputSink`].
///
/// Sessions are spawned on Tokio's blocking pool, so [`TerminalHost::create`]
/// must be called from within a runtime.
pub struct PtyTerminalHost {
    sink: Arc<dyn OutputSink>,
    shell: Option<String>,
    sessions: StdMutex<HashMap<String, Arc<PtySession>>>,
    closed_tx: broadcast::Sender<String>,
}

impl PtyTerminalHost {
    /// Host that starts the user's default shell.
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        let (closed_tx, _) = broadcast::channel(CLOSED_CHANNEL_CAPACITY);
        Self {
            sink,
            shell: None,
            sessions: StdMutex::new(HashMap::new()),
            closed_tx,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    fn command(&self) -> CommandBuilder {
        let mut command = match &self.shell {
            Some(shell) => CommandBuilder::new(shell),
            None => CommandBuilder::new_default_prog(),
        };
        if let Ok(cwd) = std::env::current_dir() {
            command.cwd(cwd);
        }
        command
    }

    fn spawn_session(&self, name: &str) -> Result<PtySession, TerminalError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TerminalError::create_session(name, err))?;

        let mut child = pair
            .slave
            .spawn_command(self.command())
            .map_err(|err| TerminalError::create_session(name, err))?;
        // Only the child keeps the slave side open, so reads hit EOF on exit.
        drop(pair.slave);
        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| TerminalError::create_session(name, err))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| TerminalError::create_session(name, err))?;

        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            let mut decoder = Utf8Chunker::default();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        if !text.is_empty() {
                            sink.append(&text);
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => break,
                }
            }
            let rest = decoder.finish();
            if !rest.is_empty() {
                sink.append(&rest);
            }
        });

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let writer = Arc::new(StdMutex::new(writer));
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = Arc::clone(&writer);
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        let _ = guard.write_all(&bytes);
                        let _ = guard.flush();
                    }
                })
                .await;
            }
        });

        let alive = Arc::new(AtomicBool::new(true));
        let wait_alive = Arc::clone(&alive);
        let closed_tx = self.closed_tx.clone();
        let wait_name = name.to_string();
        tokio::task::spawn_blocking(move || {
            match child.wait() {
                Ok(status) => {
                    tracing::info!(session = %wait_name, code = status.exit_code(), "terminal shell exited");
                }
                Err(err) => {
                    tracing::warn!(session = %wait_name, error = %err, "failed to wait for terminal shell");
                }
            }
            wait_alive.store(false, Ordering::SeqCst);
            let _ = closed_tx.send(wait_name);
        });

        Ok(PtySession {
            name: name.to_string(),
            sink: Arc::clone(&self.sink),
            writer_tx,
            alive,
            killer: StdMutex::new(killer),
            _master: StdMutex::new(pair.master),
        })
    }
}

impl TerminalHost for PtyTerminalHost {
    fn find(&self, name: &str) -> Option<Arc<dyn TerminalHandle>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, session| session.is_alive());
        sessions
            .get(name)
            .map(|session| Arc::clone(session) as Arc<dyn TerminalHandle>)
    }

    fn create(&self, name: &str) -> Result<Arc<dyn TerminalHandle>, TerminalError> {
        let session = Arc::new(self.spawn_session(name)?);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    fn closed_sessions(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.closed_tx.subscribe())
    }
}

struct PtySession {
    name: String,
    sink: Arc<dyn OutputSink>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    _master: StdMutex<Box<dyn MasterPty + Send>>,
}

impl TerminalHandle for PtySession {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn show(&self, preserve_focus: bool) {
        self.sink.show(preserve_focus);
    }

    fn clear(&self) {
        self.sink.clear();
        self.sink.append(CLEAR_SEQUENCE);
    }

    fn send_text(&self, text: &str, add_newline: bool) -> Result<(), TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::SessionClosed {
                name: self.name.clone(),
            });
        }
        let mut bytes = text.as_bytes().to_vec();
        if add_newline {
            bytes.extend_from_slice(LINE_ENDING.as_bytes());
        }
        self.writer_tx
            .try_send(bytes)
            .map_err(|_| TerminalError::WriteToSession {
                name: self.name.clone(),
            })
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if !self.is_alive() {
            return;
        }
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = killer.kill() {
            tracing::debug!(session = %self.name, error = %err, "failed to kill terminal shell");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        text: StdMutex<String>,
    }

    impl OutputSink for CollectingSink {
        fn append(&self, text: &str) {
            self.text.lock().unwrap().push_str(text);
        }

        fn show(&self, _preserve_focus: bool) {}

        fn clear(&self) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_output_reaches_the_sink_and_exit_is_broadcast() {
        let sink = Arc::new(CollectingSink::default());
        let host = PtyTerminalHost::new(sink.clone()).with_shell("/bin/sh");
        let mut closed = host.closed_sessions().expect("pty host reports closures");

        let session = host.create("pty-test").expect("create session");
        assert!(host.find("pty-test").is_some());
        session
            .send_text("printf 'pty-%s\\n' ok; exit", true)
            .expect("send");

        let name = tokio::time::timeout(Duration::from_secs(10), closed.recv())
            .await
            .expect("shell exits")
            .expect("closure notification");
        assert_eq!(name, "pty-test");
        assert!(!session.is_alive());
        assert!(host.find("pty-test").is_none());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !sink.text.lock().unwrap().contains("pty-ok") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("shell output forwarded");
    }
}
