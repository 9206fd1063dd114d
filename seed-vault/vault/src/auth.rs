//! Cross-thread rendezvous for interactive device credential checks.
//!
//! Worker threads call [`AuthCoordinator::request_authentication`] and block.
//! The request travels over a channel to the [`PromptDispatcher`], which
//! lives on the thread that owns the UI and presents the platform prompt.
//! The prompt resolves a [`PromptCompletion`] exactly once, which wakes the
//! waiting worker.
//!
//! At most one session is in flight per coordinator. Waits are bounded by
//! [`AuthConfig::timeout`] and every wait re-checks its predicate, so
//! spurious wakeups are harmless.

use serde::Deserialize;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Platform error code reported when a prompt is dropped unresolved.
pub const ERROR_CANCELED: i32 = 5;
/// Platform error code reported when no device credential is enrolled.
pub const ERROR_NO_DEVICE_CREDENTIAL: i32 = 14;

/// What a second request does while a session is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusyPolicy {
    /// Queue behind the current session, within the same timeout.
    #[default]
    Wait,
    /// Fail immediately with [`AuthError::Busy`].
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptInfo {
    pub title: String,
    pub subtitle: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub prompt: PromptInfo,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            busy_policy: BusyPolicy::Wait,
            prompt: PromptInfo {
                title: "Secret seed protection".to_string(),
                subtitle: String::new(),
            },
        }
    }
}

/// Terminal result of one interactive check, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Succeeded,
    Failed,
    Error { code: i32, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    Requested,
    Prompting,
    Succeeded,
    Failed,
    Error,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication denied: {0}")]
    Denied(String),

    #[error("another authentication session is in progress")]
    Busy,

    #[error("authentication timed out after {0:?}")]
    TimedOut(Duration),

    #[error("authentication unavailable: {0}")]
    Unavailable(String),

    #[error("authentication cancelled by shutdown")]
    Cancelled,
}

/// Platform interactive credential check.
///
/// `present` runs on the dispatcher's thread. It must not block waiting for
/// the user; it hands `completion` to whatever callback mechanism the
/// platform uses, from any thread.
pub trait CredentialPrompt: Send {
    /// Whether the device has a credential enrolled at all.
    fn can_authenticate(&self) -> bool {
        true
    }

    fn present(&mut self, info: &PromptInfo, completion: PromptCompletion);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Outcome(AuthOutcome),
    TimedOut,
    Cancelled,
}

struct Session {
    id: u64,
    slot: Mutex<Option<Resolution>>,
    ready: Condvar,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// First resolution wins; later ones are dropped.
    fn resolve(&self, resolution: Resolution) -> bool {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return false;
        }
        *slot = Some(resolution);
        self.ready.notify_all();
        true
    }

    fn is_resolved(&self) -> bool {
        lock(&self.slot).is_some()
    }

    fn wait(&self, timeout: Duration) -> Option<Resolution> {
        let slot = lock(&self.slot);
        let (slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    fn resolution(&self) -> Option<Resolution> {
        lock(&self.slot).clone()
    }
}

struct CoordinatorState {
    phase: AuthPhase,
    current: Option<Arc<Session>>,
    next_id: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    idle: Condvar,
    config: AuthConfig,
    ui_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn is_ui_thread(&self) -> bool {
        *lock(&self.ui_thread) == Some(thread::current().id())
    }

    /// Claim the single session slot, honouring the busy policy.
    fn acquire(&self, deadline: Instant) -> Result<Arc<Session>, AuthError> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(AuthError::Cancelled);
            }
            if state.current.is_none() {
                break;
            }
            if self.config.busy_policy == BusyPolicy::FailFast {
                log::debug!("authentication busy, failing fast");
                return Err(AuthError::Busy);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AuthError::TimedOut(self.config.timeout));
            }
            state = self
                .idle
                .wait_timeout_while(state, remaining, |s| !s.closed && s.current.is_some())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        state.next_id += 1;
        let session = Arc::new(Session::new(state.next_id));
        state.current = Some(Arc::clone(&session));
        state.phase = AuthPhase::Requested;
        log::debug!("authentication session {} requested", session.id);
        Ok(session)
    }

    fn is_current(state: &CoordinatorState, session: &Session) -> bool {
        state.current.as_ref().is_some_and(|c| c.id == session.id)
    }

    /// Move a requested session to prompting. False when it was abandoned.
    fn begin_prompt(&self, session: &Session) -> bool {
        let mut state = lock(&self.state);
        if !Self::is_current(&state, session) || session.is_resolved() {
            return false;
        }
        state.phase = AuthPhase::Prompting;
        log::debug!("authentication session {} prompting", session.id);
        true
    }

    fn finish(&self, session: &Session, outcome: AuthOutcome) {
        let phase = match &outcome {
            AuthOutcome::Succeeded => AuthPhase::Succeeded,
            AuthOutcome::Failed => AuthPhase::Failed,
            AuthOutcome::Error { .. } => AuthPhase::Error,
        };
        let mut state = lock(&self.state);
        if !session.resolve(Resolution::Outcome(outcome)) {
            log::debug!("authentication session {} already resolved, ignoring", session.id);
            return;
        }
        if Self::is_current(&state, session) {
            state.phase = phase;
        }
        log::debug!("authentication session {} resolved: {phase:?}", session.id);
    }

    /// Return the slot to idle once the waiter has read its resolution.
    fn release(&self, session: &Session) {
        let mut state = lock(&self.state);
        if Self::is_current(&state, session) {
            state.current = None;
            state.phase = AuthPhase::Idle;
            self.idle.notify_all();
        }
    }
}

struct PromptRequest {
    session: Arc<Session>,
}

/// Requesting side of the rendezvous. Shared by worker threads.
pub struct AuthCoordinator {
    shared: Arc<Shared>,
    requests: Mutex<Option<Sender<PromptRequest>>>,
}

impl AuthCoordinator {
    /// Create a coordinator and the dispatcher that must be driven by the
    /// thread owning the UI.
    pub fn new(
        config: AuthConfig,
        prompt: impl CredentialPrompt + 'static,
    ) -> (AuthCoordinator, PromptDispatcher) {
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState {
                phase: AuthPhase::Idle,
                current: None,
                next_id: 0,
                closed: false,
            }),
            idle: Condvar::new(),
            config,
            ui_thread: Mutex::new(None),
        });
        let (tx, rx) = mpsc::channel();

        let coordinator = AuthCoordinator {
            shared: Arc::clone(&shared),
            requests: Mutex::new(Some(tx)),
        };
        let dispatcher = PromptDispatcher {
            shared,
            requests: rx,
            prompt: Box::new(prompt),
        };
        (coordinator, dispatcher)
    }

    pub fn phase(&self) -> AuthPhase {
        lock(&self.shared.state).phase
    }

    pub fn config(&self) -> &AuthConfig {
        &self.shared.config
    }

    /// Run one interactive credential check and block until it resolves or
    /// the configured timeout elapses.
    pub fn request_authentication(&self) -> Result<(), AuthError> {
        self.request_authentication_unless(|| false, || {})
    }

    /// Like [`request_authentication`](Self::request_authentication), but
    /// once this caller holds the session slot `satisfied` is asked whether a
    /// prompt is still needed; a session that finished while this one queued
    /// may already have opened the key. `on_success` runs after a successful
    /// check and before the slot is handed to the next caller.
    pub fn request_authentication_unless(
        &self,
        satisfied: impl FnOnce() -> bool,
        on_success: impl FnOnce(),
    ) -> Result<(), AuthError> {
        if self.shared.is_ui_thread() {
            return Err(AuthError::Unavailable(
                "cannot block the prompt-owning thread".into(),
            ));
        }

        let timeout = self.shared.config.timeout;
        let deadline = Instant::now() + timeout;
        let session = self.shared.acquire(deadline)?;
        if satisfied() {
            log::debug!("authentication session {} not needed", session.id);
            session.resolve(Resolution::Cancelled);
            self.shared.release(&session);
            return Ok(());
        }

        let sent = lock(&self.requests).as_ref().is_some_and(|tx| {
            tx.send(PromptRequest {
                session: Arc::clone(&session),
            })
            .is_ok()
        });
        if !sent {
            session.resolve(Resolution::Cancelled);
            self.shared.release(&session);
            return Err(AuthError::Unavailable("prompt dispatcher is not running".into()));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let resolution = match session.wait(remaining) {
            Some(resolution) => resolution,
            // A completion may land between the timed-out wait and here.
            None if session.resolve(Resolution::TimedOut) => Resolution::TimedOut,
            None => session.resolution().unwrap_or(Resolution::TimedOut),
        };
        if resolution == Resolution::Outcome(AuthOutcome::Succeeded) {
            on_success();
        }
        self.shared.release(&session);

        match resolution {
            Resolution::Outcome(AuthOutcome::Succeeded) => {
                log::info!("authentication session {} succeeded", session.id);
                Ok(())
            }
            Resolution::Outcome(AuthOutcome::Failed) => {
                log::info!("authentication session {} failed", session.id);
                Err(AuthError::Denied("credential check failed".into()))
            }
            Resolution::Outcome(AuthOutcome::Error { code, message })
                if code == ERROR_NO_DEVICE_CREDENTIAL =>
            {
                Err(AuthError::Unavailable(message))
            }
            Resolution::Outcome(AuthOutcome::Error { code, message }) => {
                log::info!("authentication session {} error {code}", session.id);
                Err(AuthError::Denied(format!("platform error {code}: {message}")))
            }
            Resolution::TimedOut => {
                log::warn!("authentication session {} timed out", session.id);
                Err(AuthError::TimedOut(timeout))
            }
            Resolution::Cancelled => Err(AuthError::Cancelled),
        }
    }

    /// Cancel the in-flight session and refuse new ones. The dispatcher's
    /// loop exits once its queue drains.
    pub fn shutdown(&self) {
        lock(&self.requests).take();
        let mut state = lock(&self.shared.state);
        state.closed = true;
        if let Some(session) = &state.current {
            session.resolve(Resolution::Cancelled);
        }
        self.shared.idle.notify_all();
        log::debug!("authentication coordinator shut down");
    }
}

/// UI-owning side of the rendezvous.
pub struct PromptDispatcher {
    shared: Arc<Shared>,
    requests: Receiver<PromptRequest>,
    prompt: Box<dyn CredentialPrompt>,
}

impl PromptDispatcher {
    /// Serve requests until every coordinator handle is dropped or shut down.
    pub fn run(mut self) {
        self.bind_thread();
        while let Ok(request) = self.requests.recv() {
            self.handle(request);
        }
        log::debug!("prompt dispatcher stopped");
    }

    /// Handle every queued request without blocking. For embedding in an
    /// existing event loop. Returns the number handled, or `None` once all
    /// coordinators are gone.
    pub fn pump(&mut self) -> Option<usize> {
        self.bind_thread();
        let mut handled = 0;
        loop {
            match self.requests.try_recv() {
                Ok(request) => {
                    self.handle(request);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => return Some(handled),
                Err(TryRecvError::Disconnected) => return (handled > 0).then_some(handled),
            }
        }
    }

    fn bind_thread(&self) {
        *lock(&self.shared.ui_thread) = Some(thread::current().id());
    }

    fn handle(&mut self, request: PromptRequest) {
        let session = request.session;
        if !self.shared.begin_prompt(&session) {
            log::debug!("authentication session {} abandoned before prompt", session.id);
            return;
        }

        let completion = PromptCompletion {
            shared: Arc::clone(&self.shared),
            session: Some(session),
        };
        if !self.prompt.can_authenticate() {
            completion.error(ERROR_NO_DEVICE_CREDENTIAL, "no device credential enrolled");
            return;
        }
        self.prompt.present(&self.shared.config.prompt, completion);
    }
}

/// One-shot result channel handed to the platform prompt.
///
/// Consuming methods make a second signal impossible. Dropping it
/// unresolved reports [`ERROR_CANCELED`].
pub struct PromptCompletion {
    shared: Arc<Shared>,
    session: Option<Arc<Session>>,
}

impl PromptCompletion {
    pub fn succeed(mut self) {
        self.finish(AuthOutcome::Succeeded);
    }

    pub fn fail(mut self) {
        self.finish(AuthOutcome::Failed);
    }

    pub fn error(mut self, code: i32, message: impl Into<String>) {
        self.finish(AuthOutcome::Error {
            code,
            message: message.into(),
        });
    }

    fn finish(&mut self, outcome: AuthOutcome) {
        if let Some(session) = self.session.take() {
            self.shared.finish(&session, outcome);
        }
    }
}

impl Drop for PromptCompletion {
    fn drop(&mut self) {
        self.finish(AuthOutcome::Error {
            code: ERROR_CANCELED,
            message: "prompt dismissed without a result".into(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
