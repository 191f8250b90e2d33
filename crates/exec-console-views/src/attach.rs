//! Live/static mode control for one attached execution view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use exec_console_events::{
    ChannelLog, EventKind, LogStream, ReplayEntry, RunStatus, ServerEvent, Subscription,
};
use exec_console_link::{ConnectionState, Link, LinkError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};

use crate::api::{ApiError, ExecutionApi, ExecutionResult, ExecutionSnapshot, OutputFile};

/// Operating mode of an attached view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// Push-driven: channel joined, no polling.
    Live,
    /// Fetch-driven: the entity's state is no longer changing.
    Static,
}

/// Attach error.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

/// Attach configuration.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Session deadline for interactive views. Reaching it is treated like
    /// a server-pushed terminal event, even if that push never arrives.
    pub deadline: Option<Instant>,
    /// Deadline countdown granularity.
    pub tick: Duration,
    /// Entry bound passed to the log-snapshot fetch in static mode.
    pub log_snapshot_limit: usize,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            tick: Duration::from_secs(1),
            log_snapshot_limit: 1000,
        }
    }
}

/// Renderable state of one attached view.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub status: RunStatus,
    pub mode: ViewMode,
    /// Mirror of the link state, for reconnecting/disconnected indicators.
    pub connection: ConnectionState,
    pub log: ChannelLog,
    pub outputs: Vec<OutputFile>,
    pub result: Option<ExecutionResult>,
    /// Epoch milliseconds.
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Dismissible banner for failed fallback fetches.
    pub fetch_error: Option<String>,
    /// Countdown to the session deadline, when one is configured.
    pub deadline_remaining: Option<Duration>,
}

struct ViewShared {
    execution_id: String,
    link: Link,
    api: Arc<dyn ExecutionApi>,
    state: StdRwLock<ViewState>,
    revision: watch::Sender<u64>,
    attached: AtomicBool,
    /// Set when the one-time live-to-static transition has run (or when the
    /// view started static); never cleared.
    finalized: AtomicBool,
    /// Which pieces a manual retry re-fetches.
    retry_execution: AtomicBool,
    retry_log: AtomicBool,
    log_snapshot_limit: usize,
}

impl ViewShared {
    /// Apply a state mutation unless the consumer has detached; results
    /// arriving for a detached view are discarded.
    fn mutate(&self, f: impl FnOnce(&mut ViewState)) {
        if !self.attached.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.write().unwrap();
            f(&mut state);
        }
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn snapshot(&self) -> ViewState {
        self.state.read().unwrap().clone()
    }
}

/// One consumer's attachment to an execution.
///
/// Dropping the attachment (or calling [`Attachment::detach`]) removes its
/// subscriptions, leaves the channel when still live, and cancels its
/// timers. The link itself is shared and stays up.
pub struct Attachment {
    shared: Arc<ViewShared>,
    subs: Vec<Subscription>,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("execution_id", &self.shared.execution_id)
            .field("subs", &self.subs.len())
            .field("driver", &self.driver.is_some())
            .finish()
    }
}

/// Attach a consumer to an execution.
///
/// Fetches the execution snapshot once to pick the operating mode. A
/// non-terminal execution attaches live: connect, subscribe, join. An
/// already-terminal execution never enters live mode; its log and output
/// listing are fetched one-shot.
///
/// # Errors
/// Returns an error when the initial snapshot fetch or the connection
/// attempt fails. Later transport trouble is surfaced only through the
/// view's connection indicator.
pub async fn attach(
    link: Link,
    api: Arc<dyn ExecutionApi>,
    execution_id: impl Into<String>,
    options: AttachOptions,
) -> Result<Attachment, AttachError> {
    let execution_id = execution_id.into();
    let snapshot = api.fetch_execution(&execution_id).await?;
    let live = !snapshot.status.is_terminal();

    let (revision, _) = watch::channel(0);
    let initial = ViewState {
        status: snapshot.status,
        mode: if live { ViewMode::Live } else { ViewMode::Static },
        connection: link.state(),
        log: ChannelLog::new(),
        outputs: Vec::new(),
        result: snapshot.result,
        started_at: snapshot.started_at,
        completed_at: snapshot.completed_at,
        fetch_error: None,
        deadline_remaining: options
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now())),
    };

    let shared = Arc::new(ViewShared {
        execution_id: execution_id.clone(),
        link: link.clone(),
        api,
        state: StdRwLock::new(initial),
        revision,
        attached: AtomicBool::new(true),
        finalized: AtomicBool::new(!live),
        retry_execution: AtomicBool::new(false),
        retry_log: AtomicBool::new(!live),
        log_snapshot_limit: options.log_snapshot_limit,
    });

    if !live {
        // One-shot static view: the snapshot above is the status fetch;
        // supplement it with the log snapshot and the output listing.
        run_static_fetch(&shared, false, true).await;
        return Ok(Attachment {
            shared,
            subs: Vec::new(),
            driver: None,
        });
    }

    // Subscriptions go in before the join so the replay cannot race past
    // an unregistered listener.
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let mut subs = Vec::new();
    for kind in [
        EventKind::InitialReplay,
        EventKind::Output,
        EventKind::Error,
        EventKind::StatusChanged,
        EventKind::Completed,
        EventKind::MembershipAck,
    ] {
        let tx = queue_tx.clone();
        let id = execution_id.clone();
        subs.push(link.subscribe(kind, move |event| {
            if event.channel_id() == id {
                let _ = tx.send(event.clone());
            }
        }));
    }

    link.connect().await?;
    link.join(&execution_id);

    let driver = tokio::spawn(run_driver(
        Arc::clone(&shared),
        queue_rx,
        link.state_changes(),
        options,
    ));

    Ok(Attachment {
        shared,
        subs,
        driver: Some(driver),
    })
}

impl Attachment {
    /// Execution this view is attached to.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.shared.execution_id
    }

    /// Clone of the current view state.
    #[must_use]
    pub fn snapshot(&self) -> ViewState {
        self.shared.snapshot()
    }

    /// Revision counter bumped on every state change.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Manually retry a failed fallback fetch.
    pub async fn retry_fetch(&self) {
        self.shared.mutate(|state| state.fetch_error = None);
        let include_execution = self.shared.retry_execution.load(Ordering::SeqCst);
        let include_log = self.shared.retry_log.load(Ordering::SeqCst);
        run_static_fetch(&self.shared, include_execution, include_log).await;
    }

    /// Dismiss the fetch-error banner.
    pub fn dismiss_fetch_error(&self) {
        self.shared.mutate(|state| state.fetch_error = None);
    }

    /// Ask the backend to stop the execution.
    ///
    /// # Errors
    /// Returns the collaborator error; the view itself is updated by the
    /// resulting status events, not by this call.
    pub async fn stop(&self) -> Result<(), ApiError> {
        self.shared
            .api
            .stop_execution(&self.shared.execution_id)
            .await
    }

    /// Detach now instead of at drop time.
    pub fn detach(self) {}

    fn teardown(&mut self) {
        if !self.shared.attached.swap(false, Ordering::SeqCst) {
            return;
        }
        self.subs.clear();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if !self.shared.finalized.load(Ordering::SeqCst) {
            // Still live: give up the channel membership.
            self.shared.link.leave(&self.shared.execution_id);
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_driver(
    shared: Arc<ViewShared>,
    mut queue: mpsc::UnboundedReceiver<ServerEvent>,
    mut link_states: broadcast::Receiver<ConnectionState>,
    options: AttachOptions,
) {
    let mut ticker = interval(options.tick);
    let mut link_states_open = true;

    loop {
        tokio::select! {
            event = queue.recv() => {
                let Some(event) = event else { break };
                if handle_event(&shared, event).await {
                    break;
                }
            }
            changed = link_states.recv(), if link_states_open => {
                match changed {
                    Ok(connection) => shared.mutate(|state| state.connection = connection),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let connection = shared.link.state();
                        shared.mutate(|state| state.connection = connection);
                    }
                    Err(broadcast::error::RecvError::Closed) => link_states_open = false,
                }
            }
            _ = ticker.tick(), if options.deadline.is_some() => {
                let Some(deadline) = options.deadline else { continue };
                let remaining = deadline.saturating_duration_since(Instant::now());
                shared.mutate(|state| state.deadline_remaining = Some(remaining));
                if remaining.is_zero() {
                    // Deadline reached: same path as a pushed terminal
                    // event, whether or not that push ever arrives.
                    finalize(&shared, RunStatus::TimedOut).await;
                    break;
                }
            }
        }
    }
}

/// Apply one pushed event. Returns `true` once the view has gone static.
async fn handle_event(shared: &Arc<ViewShared>, event: ServerEvent) -> bool {
    match event {
        ServerEvent::InitialReplay { entries, .. } => {
            shared.mutate(|state| state.log.apply_replay(&entries));
            false
        }
        ServerEvent::Output {
            text, timestamp, ..
        } => {
            shared.mutate(|state| state.log.push_live(LogStream::Stdout, text, timestamp));
            false
        }
        ServerEvent::Error {
            text, timestamp, ..
        } => {
            shared.mutate(|state| state.log.push_live(LogStream::Stderr, text, timestamp));
            false
        }
        ServerEvent::StatusChanged { status, .. } => {
            shared.mutate(|state| state.status = status);
            if status.is_terminal() {
                finalize(shared, status).await;
                return true;
            }
            false
        }
        ServerEvent::Completed {
            status,
            exit_code,
            error_message,
            completed_at,
            ..
        } => {
            shared.mutate(|state| {
                state.status = status;
                state.completed_at = Some(completed_at);
                state.result = Some(ExecutionResult {
                    exit_code,
                    output: None,
                    error: error_message,
                });
            });
            finalize(shared, status).await;
            true
        }
        ServerEvent::MembershipAck { channel_id } => {
            tracing::debug!(channel = %channel_id, "view live-ready");
            false
        }
    }
}

/// The one-time live-to-static transition.
///
/// Runs at most once per attachment no matter how many terminal events
/// arrive: one follow-up fetch for the fields the push events do not carry,
/// then the channel is left and the view stays static for good.
async fn finalize(shared: &Arc<ViewShared>, status: RunStatus) {
    if shared.finalized.swap(true, Ordering::SeqCst) {
        return;
    }
    shared.mutate(|state| {
        state.status = status;
        state.mode = ViewMode::Static;
        state.deadline_remaining = None;
    });
    shared.link.leave(&shared.execution_id);
    shared.retry_execution.store(true, Ordering::SeqCst);
    run_static_fetch(shared, true, false).await;
}

/// Fetch the requested pieces and apply them, unless the view detached
/// while the calls were in flight. A failure becomes the dismissible
/// banner; it never touches the connection.
async fn run_static_fetch(shared: &Arc<ViewShared>, include_execution: bool, include_log: bool) {
    let id = shared.execution_id.as_str();
    let fetched = fetch_pieces(shared, id, include_execution, include_log).await;
    if !shared.attached.load(Ordering::SeqCst) {
        return;
    }
    match fetched {
        Ok((snapshot, log, outputs)) => shared.mutate(move |state| {
            if let Some(snapshot) = snapshot {
                if snapshot.status.is_terminal() {
                    state.status = snapshot.status;
                }
                if snapshot.started_at.is_some() {
                    state.started_at = snapshot.started_at;
                }
                if snapshot.completed_at.is_some() {
                    state.completed_at = snapshot.completed_at;
                }
                if snapshot.result.is_some() {
                    state.result = snapshot.result;
                }
            }
            if let Some(entries) = log {
                state.log.apply_replay(&entries);
            }
            state.outputs = outputs;
            state.fetch_error = None;
        }),
        Err(e) => {
            tracing::warn!(execution = id, error = %e, "static fetch failed");
            shared.mutate(|state| state.fetch_error = Some(e.to_string()));
        }
    }
}

async fn fetch_pieces(
    shared: &Arc<ViewShared>,
    id: &str,
    include_execution: bool,
    include_log: bool,
) -> Result<
    (
        Option<ExecutionSnapshot>,
        Option<Vec<ReplayEntry>>,
        Vec<OutputFile>,
    ),
    ApiError,
> {
    let snapshot = if include_execution {
        Some(shared.api.fetch_execution(id).await?)
    } else {
        None
    };
    let log = if include_log {
        Some(
            shared
                .api
                .fetch_log_snapshot(id, shared.log_snapshot_limit)
                .await?,
        )
    } else {
        None
    };
    let outputs = shared.api.fetch_output_listing(id).await?;
    Ok((snapshot, log, outputs))
}
