//! Single-flight process manager.
//!
//! At most one generator session exists at a time. The session slot is a
//! [`SessionStateMachine`] behind one mutex; every path that can end a session
//! (explicit stop, a terminal record, the reader seeing the process die) must
//! win the `Running -> *` transition under that mutex before it may announce
//! `ProcessFinished`, so the announcement happens exactly once.
//!
//! The manager drives its children on a multi-threaded tokio runtime. Each
//! session gets a dedicated OS thread for its [`OutputReader`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::protocol::{ClassifiedEvent, GenerationParameters, LineClassifier};
use crate::supervisor::{
    BoxedReader, EventDispatcher, EventPump, GenerationCommand, GenerationProcess, OutputReader,
    ReaderExit, SessionHost, SessionId, SessionState, SessionStateMachine, SessionStats,
    Subscribers, SupervisorError, SupervisorEvent,
};

/// Name given to output reader threads.
pub const READER_THREAD_NAME: &str = "shape-output-reader";

/// Supervises one generator process at a time.
///
/// Dropping the manager stops any active session and joins its reader.
#[derive(Debug)]
pub struct ProcessManager {
    shared: Arc<Shared>,
}

/// Weak handle for stopping the manager from subscriber callbacks.
///
/// Holding one does not keep the manager alive.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Weak<Shared>,
}

impl StopHandle {
    /// Same as [`ProcessManager::request_stop`]; a no-op once the manager is gone.
    pub fn request_stop(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.request_stop();
        }
    }

    /// Same as [`ProcessManager::is_running`]; false once the manager is gone.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| shared.is_running())
    }
}

#[derive(Debug)]
struct Shared {
    config: SupervisorConfig,
    classifier: LineClassifier,
    runtime: Handle,
    dispatcher: EventDispatcher,
    inner: Mutex<Inner>,
    last_session: AtomicU64,
    shutting_down: AtomicBool,
}

#[derive(Debug, Default)]
struct Inner {
    machine: SessionStateMachine,
    session: Option<ActiveSession>,
    /// Reader of a session that ended on its own; joined before the next launch.
    finished_reader: Option<ReaderThread>,
}

#[derive(Debug)]
struct ActiveSession {
    id: SessionId,
    process: GenerationProcess,
    reader: ReaderThread,
}

#[derive(Debug)]
struct ReaderThread {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReaderThread {
    /// Signal the reader and wait for it. When called from the reader thread
    /// itself the handle is returned instead so someone else can join it.
    fn stop_and_join(self) -> Option<Self> {
        self.cancel.cancel();
        if self.handle.thread().id() == thread::current().id() {
            return Some(self);
        }
        if self.handle.join().is_err() {
            tracing::warn!("Output reader thread panicked");
        }
        None
    }
}

impl ProcessManager {
    /// Create a manager on the current tokio runtime.
    ///
    /// Returns the manager and the pump that delivers its events; drive the
    /// pump from the context that should run subscriber callbacks.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::NoRuntime` outside a tokio runtime.
    pub fn new(config: SupervisorConfig) -> Result<(Self, EventPump), SupervisorError> {
        let runtime = Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a manager that drives its children on the given runtime.
    #[must_use]
    pub fn with_runtime(config: SupervisorConfig, runtime: Handle) -> (Self, EventPump) {
        let (dispatcher, pump) = EventDispatcher::channel();
        let shared = Arc::new(Shared {
            classifier: LineClassifier::new(config.progress.clone()),
            config,
            runtime,
            dispatcher,
            inner: Mutex::new(Inner::default()),
            last_session: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });
        (Self { shared }, pump)
    }

    /// Launch the generator.
    ///
    /// `executable` is resolved through the configured launcher name, if any.
    /// On failure the error is also delivered as an Error event and nothing
    /// about an already active session is disturbed.
    ///
    /// # Errors
    ///
    /// `ProcessBusy` if a session is active, `FileNotFound` if the resolved
    /// executable is missing, `ProcessLaunchError`/`PipeError`/`ThreadError`
    /// if the child or its reader could not be started.
    pub fn launch(
        &self,
        executable: impl AsRef<Path>,
        params: &GenerationParameters,
    ) -> Result<SessionId, SupervisorError> {
        self.shared.launch(executable.as_ref(), params)
    }

    /// Forcefully stop the active session. A no-op when none is active.
    ///
    /// Safe to call from any thread, including from subscriber callbacks.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// True iff a session is active and its process is alive right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Current state of the session slot.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.lock().machine.state()
    }

    /// Counters over the manager's lifetime.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.shared.lock().machine.stats()
    }

    /// Identifier of the active session, if any.
    #[must_use]
    pub fn current_session(&self) -> Option<SessionId> {
        self.shared.lock().session.as_ref().map(|s| s.id)
    }

    /// Process ID of the active session's child, if any.
    #[must_use]
    pub fn current_pid(&self) -> Option<u32> {
        self.shared
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.process.id())
    }

    /// Subscriber registry for this manager's events.
    #[must_use]
    pub fn subscribers(&self) -> &Arc<Subscribers> {
        self.shared.dispatcher.subscribers()
    }

    /// A weak handle for use inside subscriber callbacks.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Configuration the manager was created with.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Resolve the path handed to [`ProcessManager::launch`] to the file that
    /// will actually be executed.
    #[must_use]
    pub fn resolve_executable(&self, path: &Path) -> PathBuf {
        self.shared.resolve_executable(path)
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.request_stop();
        let reader = self.shared.lock().finished_reader.take();
        if let Some(reader) = reader {
            let _ = reader.stop_and_join();
        }
        tracing::debug!("Process manager torn down");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve_executable(&self, path: &Path) -> PathBuf {
        let resolved = match &self.config.launcher {
            Some(name) if path.is_dir() => path.join(name),
            Some(name) => path.parent().unwrap_or(Path::new("")).join(name),
            None => path.to_path_buf(),
        };
        std::path::absolute(&resolved).unwrap_or(resolved)
    }

    fn launch(
        self: &Arc<Self>,
        executable: &Path,
        params: &GenerationParameters,
    ) -> Result<SessionId, SupervisorError> {
        let previous = {
            let mut inner = self.lock();
            if !inner.machine.begin_launch() {
                drop(inner);
                return Err(self.fail(SupervisorError::ProcessBusy));
            }
            inner.finished_reader.take()
        };

        // Outside the lock: a reader that is still draining may need it to exit.
        if let Some(reader) = previous {
            let _ = reader.stop_and_join();
        }

        let mut inner = self.lock();
        match self.start_session(executable, params) {
            Ok(session) => {
                let id = session.id;
                inner.session = Some(session);
                inner.machine.launched();
                Ok(id)
            }
            Err(e) => {
                inner.machine.launch_failed();
                drop(inner);
                Err(self.fail(e))
            }
        }
    }

    /// Spawn the child and its reader. Called with the session lock held and
    /// the machine in `Launching`.
    fn start_session(
        self: &Arc<Self>,
        executable: &Path,
        params: &GenerationParameters,
    ) -> Result<ActiveSession, SupervisorError> {
        let executable = self.resolve_executable(executable);
        if !executable.is_file() {
            return Err(SupervisorError::FileNotFound(executable));
        }

        let command = GenerationCommand::from_config(&executable, params, &self.config)?;
        let mut process = {
            let _guard = self.runtime.enter();
            command
                .spawn()
                .map_err(SupervisorError::ProcessLaunchError)?
        };

        let Some(stdout) = process.take_stdout() else {
            process.kill(&self.runtime);
            return Err(SupervisorError::PipeError);
        };
        let stderr = process
            .take_stderr()
            .map(|stream| Box::new(stream) as BoxedReader);

        let id = SessionId(self.last_session.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancellationToken::new();
        let weak: Weak<Self> = Arc::downgrade(self);
        let host: Weak<dyn SessionHost> = weak;
        let reader = OutputReader::new(
            id,
            stdout,
            stderr,
            host,
            self.classifier.clone(),
            cancel.clone(),
            self.config.poll_interval(),
        );

        let runtime = self.runtime.clone();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<()>(1);
        let spawned = thread::Builder::new()
            .name(READER_THREAD_NAME.to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                runtime.block_on(reader.run());
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                process.kill(&self.runtime);
                return Err(SupervisorError::ThreadError(e));
            }
        };

        if ready_rx.recv().is_err() {
            process.kill(&self.runtime);
            let _ = handle.join();
            return Err(SupervisorError::ThreadError(std::io::Error::other(
                "output reader thread exited before starting",
            )));
        }

        tracing::info!(
            session = %id,
            pid = ?process.id(),
            executable = %executable.display(),
            "Generator launched"
        );

        Ok(ActiveSession {
            id,
            process,
            reader: ReaderThread { cancel, handle },
        })
    }

    /// Log a launch failure, announce it as an Error event and hand it back.
    fn fail(&self, error: SupervisorError) -> SupervisorError {
        if matches!(error, SupervisorError::ProcessBusy) {
            tracing::warn!(kind = error.kind(), "Launch rejected, a session is already active");
        } else {
            tracing::error!(kind = error.kind(), error = %error, "Launch failed");
        }
        self.dispatcher
            .post(SupervisorEvent::error(error.to_string(), error.kind()));
        error
    }

    fn request_stop(&self) {
        let session = {
            let mut inner = self.lock();
            if !inner.machine.leave_running(SessionState::Stopping) {
                tracing::debug!(state = ?inner.machine.state(), "Stop requested without an active session");
                return;
            }
            inner.session.take()
        };

        let mut stray_reader = None;
        if let Some(ActiveSession {
            id,
            process,
            reader,
        }) = session
        {
            tracing::info!(session = %id, pid = ?process.id(), "Stopping generator");
            process.kill(&self.runtime);
            stray_reader = reader.stop_and_join();
        }

        {
            let mut inner = self.lock();
            inner.machine.transition(SessionState::Idle);
            if stray_reader.is_some() {
                inner.finished_reader = stray_reader;
            }
        }
        self.dispatcher.post(SupervisorEvent::ProcessFinished);
    }

    fn is_running(&self) -> bool {
        let mut inner = self.lock();
        if !inner.machine.state().is_running() {
            return false;
        }
        inner
            .session
            .as_mut()
            .is_some_and(|s| s.process.is_alive())
    }

    /// End the session from the reader's side. A no-op if another path
    /// already ended it.
    fn finish_session(&self, session: SessionId, cause: &'static str) {
        let process = {
            let mut inner = self.lock();
            let is_current = inner.session.as_ref().is_some_and(|s| s.id == session);
            if !is_current || !inner.machine.leave_running(SessionState::Idle) {
                return;
            }
            let Some(ActiveSession {
                process, reader, ..
            }) = inner.session.take()
            else {
                return;
            };
            // Parked before the lock is released so the next launch joins it.
            inner.finished_reader = Some(reader);
            process
        };

        tracing::info!(session = %session, cause, "Generator session finished");
        process.release(self.config.finish_grace(), &self.runtime);
        self.dispatcher.post(SupervisorEvent::ProcessFinished);
    }
}

impl SessionHost for Shared {
    fn is_session_running(&self, session: SessionId) -> bool {
        let mut inner = self.lock();
        if !inner.machine.state().is_running() {
            return false;
        }
        match inner.session.as_mut() {
            Some(active) if active.id == session => active.process.is_alive(),
            _ => false,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn deliver(&self, session: SessionId, events: Vec<ClassifiedEvent>) {
        {
            let inner = self.lock();
            let is_current = inner.machine.state().is_running()
                && inner.session.as_ref().is_some_and(|s| s.id == session);
            if !is_current {
                tracing::debug!(session = %session, "Dropping output of an ended session");
                return;
            }
        }

        let mut ends_session = false;
        for event in events {
            ends_session |= event.ends_session();
            if let Some(notification) = SupervisorEvent::from_classified(event) {
                self.dispatcher.post(notification);
            }
        }

        if ends_session {
            self.finish_session(session, "generator reported end");
        }
    }

    fn reader_exited(&self, session: SessionId, reason: ReaderExit) {
        match reason {
            ReaderExit::StopRequested | ReaderExit::HostGone => {}
            ReaderExit::EndOfStream | ReaderExit::ProcessExited => {
                self.finish_session(session, "process exited");
            }
        }
    }
}
