//! Connection lifecycle manager for the console's push channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use exec_console_events::{
    ClientCommand, EventDispatcher, EventKind, ServerEvent, Subscription,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::channels::{ChannelRegistry, MembershipState};
use crate::transport::{Connector, TransportError};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Console push endpoint.
    pub url: String,
    /// Backoff base: the delay before the second reconnect attempt.
    pub base_delay: Duration,
    /// Maximum reconnect attempts per episode before settling Disconnected.
    pub max_attempts: u32,
}

impl LinkConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            base_delay: Duration::from_millis(2000),
            max_attempts: 5,
        }
    }
}

/// Link error.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("authentication failed: {0}")]
    Auth(#[from] crate::auth::AuthError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

struct LinkInner {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    dispatcher: EventDispatcher,
    channels: ChannelRegistry,
    state: StdMutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    commands: StdMutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    /// Serialises negotiations: concurrent `connect()` callers queue here
    /// and observe the single in-flight attempt's outcome.
    connect_gate: Mutex<()>,
    /// Bumped per negotiated session; reader tasks from superseded sessions
    /// compare against it and stand down.
    epoch: AtomicU64,
    explicit_disconnect: AtomicBool,
}

/// Process-wide handle to the persistent console connection.
///
/// The handle is reference-counted: views receive clones and layer channel
/// memberships on the shared connection. Lifecycle teardown via
/// [`Link::disconnect`] belongs to the owning root context, never to an
/// individual view.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    #[must_use]
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(LinkInner {
                config,
                connector,
                tokens,
                dispatcher: EventDispatcher::new(),
                channels: ChannelRegistry::new(),
                state: StdMutex::new(ConnectionState::Disconnected),
                state_tx,
                commands: StdMutex::new(None),
                connect_gate: Mutex::new(()),
                epoch: AtomicU64::new(0),
                explicit_disconnect: AtomicBool::new(false),
            }),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Receiver of state transitions. Identical consecutive states are
    /// never emitted twice.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Stream adapter over [`Link::state_changes`].
    #[must_use]
    pub fn state_stream(&self) -> BoxStream<'static, ConnectionState> {
        BroadcastStream::new(self.state_changes())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Register a callback for one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.dispatcher.subscribe(kind, callback)
    }

    /// Whether live events for the channel are currently trusted.
    #[must_use]
    pub fn is_joined(&self, channel_id: &str) -> bool {
        self.inner.channels.is_joined(channel_id)
    }

    /// Membership state of a channel, if it was ever joined.
    #[must_use]
    pub fn membership(&self, channel_id: &str) -> Option<MembershipState> {
        self.inner.channels.state(channel_id)
    }

    /// Establish the connection.
    ///
    /// Idempotent: returns immediately when already connected, and
    /// concurrent callers await the single in-flight negotiation. The
    /// bearer credential is fetched from the provider at negotiation time.
    ///
    /// # Errors
    /// Returns an error when the credential is unavailable or negotiation
    /// fails. Neither enters the backoff path: explicit connects surface
    /// their failure to the caller.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let _gate = self.inner.connect_gate.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.inner
            .explicit_disconnect
            .store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        match self.negotiate().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Explicit teardown.
    ///
    /// Distinguished from an involuntary drop: no reconnection is attempted
    /// afterwards. Memberships are demoted so a later `connect()` rejoins
    /// and re-confirms them.
    pub fn disconnect(&self) {
        self.inner.explicit_disconnect.store(true, Ordering::SeqCst);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        *self.inner.commands.lock().unwrap() = None;
        self.inner.channels.mark_all_pending();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Join a channel.
    ///
    /// No-op when already joined or pending. When the connection is not yet
    /// established the join is deferred until negotiation succeeds. Send
    /// failures are logged and retried on the next reconnection.
    pub fn join(&self, channel_id: &str) {
        if !self.inner.channels.want_join(channel_id) {
            return;
        }
        if self.state() == ConnectionState::Connected {
            self.send_join(channel_id);
        } else {
            tracing::debug!(channel = channel_id, "join deferred until connected");
        }
    }

    /// Leave a channel. Best-effort: failures are logged, never surfaced.
    pub fn leave(&self, channel_id: &str) {
        if !self.inner.channels.mark_left(channel_id) {
            return;
        }
        let sender = self.inner.commands.lock().unwrap().clone();
        if let Some(sender) = sender {
            if sender
                .send(ClientCommand::Leave {
                    channel_id: channel_id.to_string(),
                })
                .is_err()
            {
                tracing::warn!(channel = channel_id, "failed to send leave");
            }
        }
    }

    fn send_join(&self, channel_id: &str) {
        let sender = self.inner.commands.lock().unwrap().clone();
        let Some(sender) = sender else {
            tracing::debug!(channel = channel_id, "join deferred until connected");
            return;
        };
        if sender
            .send(ClientCommand::Join {
                channel_id: channel_id.to_string(),
            })
            .is_err()
        {
            tracing::warn!(
                channel = channel_id,
                "failed to send join; will retry after reconnect"
            );
        }
    }

    /// One negotiation: credential, transport session, reader task, rejoins.
    ///
    /// Callers must hold the connect gate.
    ///
    /// The future is boxed with an explicit `Send` bound to break the
    /// auto-trait inference cycle created by the indirect recursion
    /// `run_reader` -> `reconnect` -> `negotiate` -> `spawn(run_reader)`;
    /// without the erasure rustc cannot resolve `Send` through the cycle.
    fn negotiate(&self) -> Pin<Box<dyn Future<Output = Result<(), LinkError>> + Send + '_>> {
        Box::pin(async move {
            let token = self.inner.tokens.bearer_token().await?;
            let session = self
                .inner
                .connector
                .connect(&self.inner.config.url, &token)
                .await?;

            let conn_id = Uuid::new_v4();
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *self.inner.commands.lock().unwrap() = Some(session.commands);
            self.set_state(ConnectionState::Connected);
            tracing::info!(%conn_id, "console link established");

            // Channels joined before connecting, and channels demoted by a
            // drop, are (re)joined now, each independently, so one failure
            // cannot block another.
            for channel in self.inner.channels.pending() {
                self.send_join(&channel);
            }

            let link = self.clone();
            tokio::spawn(link.run_reader(session.events, epoch, conn_id));
            Ok(())
        })
    }

    async fn run_reader(
        self,
        mut events: mpsc::UnboundedReceiver<Result<ServerEvent, TransportError>>,
        epoch: u64,
        conn_id: Uuid,
    ) {
        let failure = loop {
            match events.recv().await {
                Some(item) => {
                    if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                        return; // superseded; drop buffered traffic
                    }
                    match item {
                        Ok(event) => self.route(&event),
                        Err(e) => break Some(e),
                    }
                }
                None => break None,
            }
        };

        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if self.inner.explicit_disconnect.load(Ordering::SeqCst) {
            return;
        }

        match failure {
            Some(e) => tracing::warn!(%conn_id, error = %e, "console link dropped"),
            None => tracing::warn!(%conn_id, "console link closed by server"),
        }
        *self.inner.commands.lock().unwrap() = None;
        self.reconnect().await;
    }

    /// One reconnect episode: the first attempt is immediate, attempt `n`
    /// (n >= 2) waits `base_delay * 2^(n-2)`. An authentication failure
    /// aborts the episode; exhaustion settles Disconnected until a fresh
    /// explicit `connect()`.
    async fn reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
        self.inner.channels.mark_all_pending();

        for attempt in 0..self.inner.config.max_attempts {
            if attempt > 0 {
                let factor = 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(self.inner.config.base_delay.saturating_mul(factor)).await;
            }
            if self.inner.explicit_disconnect.load(Ordering::SeqCst) {
                return;
            }

            let _gate = self.inner.connect_gate.lock().await;
            if self.state() == ConnectionState::Connected {
                return; // an explicit connect() won the race
            }
            match self.negotiate().await {
                Ok(()) => {
                    tracing::info!(attempt, "reconnected");
                    return;
                }
                Err(LinkError::Auth(e)) => {
                    tracing::error!(error = %e, "credential unavailable; abandoning reconnection");
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Route one inbound event through membership gating into the
    /// dispatcher.
    fn route(&self, event: &ServerEvent) {
        let channel = event.channel_id();
        match event {
            ServerEvent::MembershipAck { .. } => {
                if !self.inner.channels.mark_joined(channel) {
                    tracing::debug!(channel, "membership ack for untracked channel dropped");
                    return;
                }
                tracing::debug!(channel, "membership confirmed");
            }
            _ if event.is_live() => {
                if !self.inner.channels.is_joined(channel) {
                    tracing::debug!(
                        channel,
                        kind = ?event.kind(),
                        "event for channel without confirmed membership dropped"
                    );
                    return;
                }
            }
            _ => {
                // Initial replay: part of the join handshake, accepted
                // while membership is still pending.
                if !self.inner.channels.is_tracked(channel) {
                    tracing::debug!(channel, "replay for untracked channel dropped");
                    return;
                }
            }
        }
        self.inner.dispatcher.dispatch(event);
    }

    fn set_state(&self, next: ConnectionState) {
        let mut current = self.inner.state.lock().unwrap();
        if *current == next {
            return;
        }
        tracing::debug!(from = ?*current, to = ?next, "connection state changed");
        *current = next;
        let _ = self.inner.state_tx.send(next);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    use exec_console_events::{LogStream, ReplayEntry, RunStatus};
    use tokio::time::Instant;

    use super::*;
    use crate::auth::{AuthError, StaticToken};
    use crate::transport::TransportSession;

    /// Far end of one fake session, held by the test.
    struct FakeSession {
        commands: mpsc::UnboundedReceiver<ClientCommand>,
        events: mpsc::UnboundedSender<Result<ServerEvent, TransportError>>,
    }

    #[derive(Default)]
    struct FakeConnector {
        /// Scripted failures: attempts pop from the front; empty = succeed.
        failures: StdMutex<VecDeque<bool>>,
        sessions: StdMutex<Vec<FakeSession>>,
        attempt_times: StdMutex<Vec<Instant>>,
        tokens_seen: StdMutex<Vec<String>>,
        connect_delay: Option<Duration>,
    }

    impl FakeConnector {
        fn attempts(&self) -> usize {
            self.attempt_times.lock().unwrap().len()
        }

        fn take_session(&self, index: usize) -> FakeSession {
            let mut sessions = self.sessions.lock().unwrap();
            assert!(sessions.len() > index, "session {index} not negotiated");
            sessions.remove(index)
        }

        fn session_count(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _url: &str,
            bearer_token: &str,
        ) -> Result<TransportSession, TransportError> {
            self.attempt_times.lock().unwrap().push(Instant::now());
            self.tokens_seen
                .lock()
                .unwrap()
                .push(bearer_token.to_string());
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            let fail = self
                .failures
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(false);
            if fail {
                return Err(TransportError::Negotiation("scripted failure".into()));
            }
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.sessions.lock().unwrap().push(FakeSession {
                commands: command_rx,
                events: event_tx,
            });
            Ok(TransportSession {
                commands: command_tx,
                events: event_rx,
            })
        }
    }

    fn make_link(connector: Arc<FakeConnector>) -> Link {
        Link::new(
            LinkConfig::new("ws://console.test/ws"),
            connector,
            Arc::new(StaticToken::new("token-1")),
        )
    }

    /// Poll until `cond` holds; sleeps so the paused clock can advance.
    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..20_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain_states(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(state) = rx.try_recv() {
            states.push(state);
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn connect_walks_through_connecting() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        let mut states = link.state_changes();

        link.connect().await.unwrap();

        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(
            drain_states(&mut states),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(
            connector.tokens_seen.lock().unwrap().as_slice(),
            ["token-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_when_connected() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));

        link.connect().await.unwrap();
        link.connect().await.unwrap();

        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_negotiation() {
        let connector = Arc::new(FakeConnector {
            connect_delay: Some(Duration::from_millis(100)),
            ..FakeConnector::default()
        });
        let link = make_link(Arc::clone(&connector));

        let a = link.clone();
        let b = link.clone();
        let (ra, rb) = tokio::join!(a.connect(), b.connect());
        ra.unwrap();
        rb.unwrap();

        assert_eq!(connector.attempts(), 1);
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_fails_without_backoff() {
        struct NoToken;
        #[async_trait::async_trait]
        impl TokenProvider for NoToken {
            async fn bearer_token(&self) -> Result<String, AuthError> {
                Err(AuthError::MissingCredential)
            }
        }

        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(
            LinkConfig::new("ws://console.test/ws"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(NoToken),
        );

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::Auth(_)));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        // The transport was never dialed and no retry loop started.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn involuntary_drop_triggers_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();
        let mut states = link.state_changes();

        let session = connector.take_session(0);
        drop(session.events); // server goes away

        wait_for(|| connector.session_count() == 1).await;
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(
            drain_states(&mut states),
            vec![ConnectionState::Reconnecting, ConnectionState::Connected]
        );
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_schedule_and_exhaustion() {
        // Scenario: base 2000ms, max 5 attempts. After a drop the retry
        // delays are 2000, 4000, 8000, 16000ms and a sixth attempt is
        // never made.
        let connector = Arc::new(FakeConnector::default());
        connector
            .failures
            .lock()
            .unwrap()
            .extend([false, true, true, true, true, true, true]);
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();

        let session = connector.take_session(0);
        drop(session.events);

        wait_for(|| link.state() == ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        // Initial connect + 5 reconnect attempts.
        assert_eq!(connector.attempts(), 6);

        let times = connector.attempt_times.lock().unwrap();
        let deltas: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        // deltas[0] covers connect, drop, first retry (immediate); the rest
        // are the backoff sleeps.
        assert_eq!(deltas[1], Duration::from_millis(2000));
        assert_eq!(deltas[2], Duration::from_millis(4000));
        assert_eq!(deltas[3], Duration::from_millis(8000));
        assert_eq!(deltas[4], Duration::from_millis(16000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_link_requires_fresh_connect() {
        let connector = Arc::new(FakeConnector::default());
        connector
            .failures
            .lock()
            .unwrap()
            .extend([false, true, true, true, true, true]);
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();

        drop(connector.take_session(0).events);
        wait_for(|| link.state() == ConnectionState::Disconnected).await;
        let attempts_after_episode = connector.attempts();

        // No further spontaneous attempts.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), attempts_after_episode);

        link.connect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_suppresses_reconnection() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();

        link.disconnect();
        assert_eq!(link.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_aborts_reconnect_episode() {
        struct FlakyTokens {
            calls: AtomicUsize,
        }
        #[async_trait::async_trait]
        impl TokenProvider for FlakyTokens {
            async fn bearer_token(&self) -> Result<String, AuthError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok("token-1".into())
                } else {
                    Err(AuthError::MissingCredential)
                }
            }
        }

        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(
            LinkConfig::new("ws://console.test/ws"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(FlakyTokens {
                calls: AtomicUsize::new(0),
            }),
        );
        link.connect().await.unwrap();

        drop(connector.take_session(0).events);
        wait_for(|| link.state() == ConnectionState::Disconnected).await;

        // The credential failed on the first retry: the transport was
        // dialed exactly once (the initial connect) and no backoff ran.
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn join_deferred_until_connected() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));

        link.join("exec-1");
        assert_eq!(link.membership("exec-1"), Some(MembershipState::Pending));

        link.connect().await.unwrap();
        let mut session = connector.take_session(0);
        let cmd = session.commands.recv().await.unwrap();
        assert!(matches!(cmd, ClientCommand::Join { channel_id } if channel_id == "exec-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_events_gated_on_membership_ack() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();
        let session = connector.take_session(0);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = link.subscribe(EventKind::Output, move |event| {
            if let ServerEvent::Output { text, .. } = event {
                seen_clone.lock().unwrap().push(text.clone());
            }
        });

        link.join("exec-1");
        let output = |text: &str| {
            ServerEvent::Output {
                channel_id: "exec-1".into(),
                text: text.into(),
                timestamp: None,
            }
        };

        // Before the ack: membership pending, live traffic untrusted.
        session.events.send(Ok(output("dropped"))).unwrap();
        session
            .events
            .send(Ok(ServerEvent::MembershipAck {
                channel_id: "exec-1".into(),
            }))
            .unwrap();
        session.events.send(Ok(output("delivered"))).unwrap();

        wait_for(|| link.is_joined("exec-1")).await;
        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["delivered"]);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_accepted_while_pending() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();
        let session = connector.take_session(0);

        let replays = Arc::new(StdMutex::new(0usize));
        let replays_clone = Arc::clone(&replays);
        let _sub = link.subscribe(EventKind::InitialReplay, move |_| {
            *replays_clone.lock().unwrap() += 1;
        });

        link.join("exec-1");
        session
            .events
            .send(Ok(ServerEvent::InitialReplay {
                channel_id: "exec-1".into(),
                entries: vec![ReplayEntry {
                    stream: LogStream::Stdout,
                    text: "start".into(),
                }],
            }))
            .unwrap();

        wait_for(|| *replays.lock().unwrap() == 1).await;
        assert!(!link.is_joined("exec-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_unjoined_channels_dropped() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();
        let session = connector.take_session(0);

        let hits = Arc::new(StdMutex::new(0usize));
        let hits_clone = Arc::clone(&hits);
        let _sub = link.subscribe(EventKind::StatusChanged, move |_| {
            *hits_clone.lock().unwrap() += 1;
        });

        session
            .events
            .send(Ok(ServerEvent::StatusChanged {
                channel_id: "never-joined".into(),
                status: RunStatus::Running,
            }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_channels_rejoined_after_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();
        let session = connector.take_session(0);

        link.join("exec-1");
        link.join("exec-2");
        for id in ["exec-1", "exec-2"] {
            session
                .events
                .send(Ok(ServerEvent::MembershipAck {
                    channel_id: id.into(),
                }))
                .unwrap();
        }
        wait_for(|| link.is_joined("exec-1") && link.is_joined("exec-2")).await;

        drop(session);
        wait_for(|| connector.session_count() == 1).await;
        let mut session = connector.take_session(0);

        // Both channels re-sent, neither live-ready until re-confirmed.
        let mut rejoined = Vec::new();
        for _ in 0..2 {
            match session.commands.recv().await.unwrap() {
                ClientCommand::Join { channel_id } => rejoined.push(channel_id),
                other => panic!("unexpected command: {other:?}"),
            }
        }
        rejoined.sort();
        assert_eq!(rejoined, ["exec-1", "exec-2"]);
        assert!(!link.is_joined("exec-1"));

        session
            .events
            .send(Ok(ServerEvent::MembershipAck {
                channel_id: "exec-1".into(),
            }))
            .unwrap();
        wait_for(|| link.is_joined("exec-1")).await;
        assert!(!link.is_joined("exec-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn leave_sends_command_and_stops_gating_in() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        link.connect().await.unwrap();
        let mut session = connector.take_session(0);

        link.join("exec-1");
        session
            .events
            .send(Ok(ServerEvent::MembershipAck {
                channel_id: "exec-1".into(),
            }))
            .unwrap();
        wait_for(|| link.is_joined("exec-1")).await;

        link.leave("exec-1");
        assert_eq!(link.membership("exec-1"), Some(MembershipState::Left));

        let mut saw_leave = false;
        while let Ok(cmd) = session.commands.try_recv() {
            if matches!(&cmd, ClientCommand::Leave { channel_id } if channel_id == "exec-1") {
                saw_leave = true;
            }
        }
        assert!(saw_leave);
    }

    #[tokio::test(start_paused = true)]
    async fn no_duplicate_consecutive_state_notifications() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        let mut states = link.state_changes();

        link.connect().await.unwrap();
        link.connect().await.unwrap();
        link.disconnect();
        link.disconnect();

        let seen = drain_states(&mut states);
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        for pair in seen.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn state_stream_yields_transitions() {
        let connector = Arc::new(FakeConnector::default());
        let link = make_link(Arc::clone(&connector));
        let mut stream = link.state_stream();

        link.connect().await.unwrap();
        assert_eq!(stream.next().await, Some(ConnectionState::Connecting));
        assert_eq!(stream.next().await, Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn rotating_credentials_fetched_per_attempt() {
        struct Rotating {
            calls: AtomicUsize,
        }
        #[async_trait::async_trait]
        impl TokenProvider for Rotating {
            async fn bearer_token(&self) -> Result<String, AuthError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("token-{n}"))
            }
        }

        let connector = Arc::new(FakeConnector::default());
        let link = Link::new(
            LinkConfig::new("ws://console.test/ws"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(Rotating {
                calls: AtomicUsize::new(0),
            }),
        );

        link.connect().await.unwrap();
        drop(connector.take_session(0).events);
        wait_for(|| connector.session_count() == 1).await;

        let tokens = connector.tokens_seen.lock().unwrap();
        assert_eq!(tokens.as_slice(), ["token-0", "token-1"]);
    }
}
