use std::{
    fmt::Display,
    future::pending,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use tokio::{
    sync::{
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
        watch,
    },
    time::{
        Instant,
        sleep_until,
    },
};

use crate::{
    connection::{
        backoff::{
            BackoffPolicy,
            RetryState,
        },
        config::ConnectionConfig,
    },
    core::{
        close::{
            CloseReason,
            close_code,
        },
        error::ConnectionError,
        uri::Uri,
    },
    session::{
        handle::SessionHandle,
        session::{
            Session,
            SessionConfig,
            SessionEvent,
            SessionInput,
        },
        types::SessionDetails,
    },
    transport::{
        registry::TransportRegistry,
        transport::{
            Transport,
            TransportCloseDetails,
            TransportEvent,
            TransportFactory,
            TransportInfo,
        },
    },
};

/// Why a connection closed, as reported to [`ConnectionHandler::on_close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseReason {
    /// No configured transport could be created.
    Unsupported,
    /// The transport never opened.
    Unreachable,
    /// The transport closed abnormally after opening at least once.
    Lost,
    /// The transport closed cleanly.
    Closed,
}

impl ConnectionCloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::Unreachable => "unreachable",
            Self::Lost => "lost",
            Self::Closed => "closed",
        }
    }
}

impl Display for ConnectionCloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Details reported alongside a [`ConnectionCloseReason`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionCloseDetails {
    /// The reason the session left, if it left at the protocol level.
    pub reason: Option<Uri>,
    /// The message accompanying the session leave.
    pub message: Option<String>,
    /// How long until the next attempt, if one will be made.
    pub retry_delay: Option<Duration>,
    /// The number of the next attempt, if one will be made.
    pub retry_count: Option<u32>,
    pub will_retry: bool,
}

impl ConnectionCloseDetails {
    fn unsupported() -> Self {
        Self {
            reason: None,
            message: None,
            retry_delay: None,
            retry_count: None,
            will_retry: false,
        }
    }
}

/// Receives connection lifecycle events.
///
/// Callbacks run on the connection task, so they must not block. Errors and panics are logged and
/// otherwise ignored.
pub trait ConnectionHandler: Send + Sync {
    /// Called when a session joins the realm, after every successful (re)connection.
    fn on_open(&self, session: SessionHandle, details: &SessionDetails) -> Result<()> {
        let _ = (session, details);
        Ok(())
    }

    /// Called whenever the transport closes, or when no transport could be created.
    ///
    /// Returning `true` stops any further reconnection.
    fn on_close(
        &self,
        reason: ConnectionCloseReason,
        details: &ConnectionCloseDetails,
    ) -> Result<bool> {
        let _ = (reason, details);
        Ok(false)
    }
}

/// A [`ConnectionHandler`] that ignores every event.
#[derive(Debug, Default)]
pub struct NoopConnectionHandler;

impl ConnectionHandler for NoopConnectionHandler {}

/// A snapshot of the connection's state.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// A session is established.
    pub is_open: bool,
    /// The transport is open.
    pub is_connected: bool,
    /// A reconnection attempt is scheduled.
    pub is_retrying: bool,
    /// The current transport, or the `none` transport.
    pub transport: TransportInfo,
    /// The established session.
    pub session: Option<SessionHandle>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            is_open: false,
            is_connected: false,
            is_retrying: false,
            transport: TransportInfo::none(),
            session: None,
        }
    }
}

enum ConnectionCommand {
    Open(oneshot::Sender<Result<()>>),
    Close {
        reason: Option<Uri>,
        message: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A connection to a WAMP router, which keeps a session alive across transport loss.
///
/// All state is owned by a background task. Dropping the connection stops the task and closes
/// the transport.
pub struct Connection {
    command_tx: UnboundedSender<ConnectionCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl Connection {
    /// Creates a new connection, building transport factories from the registry.
    ///
    /// Invalid transport entries are logged and skipped. The connection stays idle until
    /// [`Connection::open`] is called.
    pub fn new<H>(config: ConnectionConfig, registry: &TransportRegistry, handler: H) -> Result<Self>
    where
        H: ConnectionHandler + 'static,
    {
        let realm = config.validate()?;
        let factories = build_transport_factories(&config, registry)?;
        let (command_tx, command_rx) = unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let backoff = BackoffPolicy::new(&config);
        let driver = ConnectionDriver {
            session_config: SessionConfig {
                authmethods: config.authmethods.clone(),
                authid: config.authid.clone(),
                agent: config.agent.clone(),
                challenge_handler: config.challenge_handler.clone(),
                leave_timeout: config.leave_timeout(),
            },
            realm,
            retry_if_unreachable: config.retry_if_unreachable,
            retry_state: backoff.initial_state(),
            backoff,
            factories,
            handler: Arc::new(handler),
            command_rx,
            status_tx,
            transport: None,
            transport_open: false,
            transport_closing: false,
            session: None,
            session_close: None,
            retry_enabled: false,
            connect_successes: 0,
            retry_at: None,
            is_retrying: false,
        };
        tokio::spawn(driver.run());
        Ok(Self {
            command_tx,
            status_rx,
        })
    }

    async fn request<F>(&self, command: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> ConnectionCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| Error::new(ConnectionError::Stopped))?;
        reply_rx
            .await
            .map_err(|_| Error::new(ConnectionError::Stopped))?
    }

    /// Opens the connection, reconnecting on failure until closed.
    ///
    /// Fails with [`ConnectionError::AlreadyOpen`] if a transport exists or a retry is pending.
    pub async fn open(&self) -> Result<()> {
        self.request(ConnectionCommand::Open).await
    }

    /// Closes the connection and stops reconnecting.
    ///
    /// An established session leaves the realm gracefully with the given reason, defaulting to
    /// `wamp.close.normal`. Fails with [`ConnectionError::AlreadyClosed`] if there is neither a
    /// transport nor a pending retry.
    pub async fn close(&self, reason: Option<Uri>, message: Option<String>) -> Result<()> {
        self.request(|reply| ConnectionCommand::Close {
            reason,
            message,
            reply,
        })
        .await
    }

    /// The current state of the connection.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// The established session, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.status_rx.borrow().session.clone()
    }

    /// A receiver that observes every change to the connection's state.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }
}

fn build_transport_factories(
    config: &ConnectionConfig,
    registry: &TransportRegistry,
) -> Result<Vec<Box<dyn TransportFactory>>> {
    let mut factories = Vec::new();
    for entry in config.transport_entries()? {
        if entry.transport_type.is_empty() {
            warn!("Skipping transport entry without a type");
            continue;
        }
        if entry.url.as_deref().is_none_or(str::is_empty) {
            warn!(
                "Skipping {} transport entry without a url",
                entry.transport_type
            );
            continue;
        }
        let constructor = match registry.get(&entry.transport_type) {
            Some(constructor) => constructor,
            None => {
                warn!("Skipping unknown transport type {}", entry.transport_type);
                continue;
            }
        };
        match constructor(&entry) {
            Ok(factory) => factories.push(factory),
            Err(err) => warn!(
                "Skipping invalid {} transport entry: {err:#}",
                entry.transport_type
            ),
        }
    }
    Ok(factories)
}

async fn next_transport_event(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport {
        Some(transport) => transport.next_event().await,
        None => pending().await,
    }
}

async fn next_session_input(session: &mut Option<Session>) -> SessionInput {
    match session {
        Some(session) => session.next_input().await,
        None => pending().await,
    }
}

struct ConnectionDriver {
    realm: Uri,
    session_config: SessionConfig,
    retry_if_unreachable: bool,
    backoff: BackoffPolicy,
    factories: Vec<Box<dyn TransportFactory>>,
    handler: Arc<dyn ConnectionHandler>,
    command_rx: UnboundedReceiver<ConnectionCommand>,
    status_tx: watch::Sender<ConnectionStatus>,

    transport: Option<Box<dyn Transport>>,
    transport_open: bool,
    transport_closing: bool,
    session: Option<Session>,
    session_close: Option<(Uri, String)>,

    retry_state: RetryState,
    retry_enabled: bool,
    connect_successes: u64,
    retry_at: Option<Instant>,
    is_retrying: bool,
}

impl ConnectionDriver {
    async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_transport_event(&mut self.transport) => self.handle_transport_event(event),
                input = next_session_input(&mut self.session) => self.handle_session_input(input),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    debug!("Retrying connection to realm {}", self.realm);
                    self.attempt_connect();
                }
            }
            self.publish_status();
        }
        self.shutdown();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ConnectionStatus {
            is_open: self
                .session
                .as_ref()
                .is_some_and(|session| session.is_established()),
            is_connected: self.transport_open,
            is_retrying: self.is_retrying,
            transport: self
                .transport
                .as_ref()
                .map(|transport| transport.info().clone())
                .unwrap_or_else(TransportInfo::none),
            session: self.session.as_ref().and_then(|session| session.handle()),
        });
    }

    fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Open(reply) => {
                let result = self.open();
                self.publish_status();
                reply.send(result).ok();
            }
            ConnectionCommand::Close {
                reason,
                message,
                reply,
            } => {
                let result = self.close(reason, message);
                self.publish_status();
                reply.send(result).ok();
            }
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.transport.is_some() || self.retry_at.is_some() {
            return Err(ConnectionError::AlreadyOpen.into());
        }
        self.retry_state = self.backoff.initial_state();
        self.retry_enabled = true;
        self.attempt_connect();
        Ok(())
    }

    fn close(&mut self, reason: Option<Uri>, message: Option<String>) -> Result<()> {
        if self.transport.is_none() && self.retry_at.is_none() {
            return Err(ConnectionError::AlreadyClosed.into());
        }
        self.retry_enabled = false;
        if self.retry_at.take().is_some() {
            debug!("Cancelled pending retry for realm {}", self.realm);
            self.is_retrying = false;
        }

        match &mut self.session {
            Some(session) if session.is_established() => {
                session.leave(
                    reason.unwrap_or_else(|| CloseReason::Normal.uri()),
                    message.unwrap_or_default(),
                )?;
                self.flush_session();
            }
            _ => {
                if let Some(transport) = &mut self.transport {
                    self.transport_closing = true;
                    transport.close(close_code::NORMAL);
                }
            }
        }
        Ok(())
    }

    fn attempt_connect(&mut self) {
        let transport = self
            .factories
            .iter()
            .find_map(|factory| match factory.create() {
                Ok(transport) => Some(transport),
                Err(err) => {
                    warn!(
                        "Failed to create {} transport: {err:#}",
                        factory.transport_type()
                    );
                    None
                }
            });
        let transport = match transport {
            Some(transport) => transport,
            None => {
                error!("No usable transport for realm {}", self.realm);
                self.is_retrying = false;
                self.notify_close(
                    ConnectionCloseReason::Unsupported,
                    &ConnectionCloseDetails::unsupported(),
                );
                return;
            }
        };

        debug!(
            "Connecting to realm {} over {} transport to {}",
            self.realm,
            transport.info().transport_type,
            transport.info().url.as_deref().unwrap_or_default()
        );
        self.transport = Some(transport);
        self.transport_open = false;
        self.transport_closing = false;
        self.session_close = None;
        self.session = Some(Session::new(
            self.realm.clone(),
            self.session_config.clone(),
        ));
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if self.transport_closing {
                    return;
                }
                self.transport_open = true;
                self.retry_state = self.backoff.initial_state();
                self.connect_successes += 1;
                self.is_retrying = false;
                if let Some(session) = &mut self.session {
                    session.join();
                }
                self.flush_session();
            }
            TransportEvent::Message(message) => {
                if let Some(session) = &mut self.session {
                    session.handle_message(message);
                }
                self.flush_session();
            }
            TransportEvent::Close(details) => self.handle_transport_close(details),
        }
    }

    fn handle_transport_close(&mut self, details: TransportCloseDetails) {
        self.retry_at = None;
        self.transport = None;
        self.transport_open = false;
        self.transport_closing = false;
        debug!(
            "Transport for realm {} closed with code {} (clean: {}): {}",
            self.realm, details.code, details.was_clean, details.reason
        );

        let reason = if self.connect_successes == 0 {
            if !self.retry_if_unreachable {
                self.retry_enabled = false;
            }
            ConnectionCloseReason::Unreachable
        } else if !details.was_clean {
            ConnectionCloseReason::Lost
        } else {
            ConnectionCloseReason::Closed
        };

        let next_retry =
            self.backoff
                .advance(&mut self.retry_state, self.retry_enabled, &mut rand::rng());
        let session = self.session.take();
        self.is_retrying = false;
        self.publish_status();

        let (leave_reason, leave_message) = match self.session_close.take() {
            Some((reason, message)) => (Some(reason), Some(message)),
            None => (None, None),
        };
        let stop_retrying = self.notify_close(
            reason,
            &ConnectionCloseDetails {
                reason: leave_reason,
                message: leave_message,
                retry_delay: next_retry.delay,
                retry_count: next_retry.count,
                will_retry: next_retry.will_retry,
            },
        );
        if let Some(mut session) = session {
            session.teardown();
        }

        match next_retry.delay {
            Some(delay) if self.retry_enabled && !stop_retrying && next_retry.will_retry => {
                debug!(
                    "Retrying connection to realm {} in {delay:?} (attempt {})",
                    self.realm, self.retry_state.count
                );
                self.is_retrying = true;
                self.retry_at = Some(Instant::now() + delay);
            }
            _ => info!("Connection to realm {} closed ({reason})", self.realm),
        }
    }

    fn handle_session_input(&mut self, input: SessionInput) {
        if let Some(session) = &mut self.session {
            session.handle_input(input);
        }
        self.flush_session();
    }

    /// Moves queued messages to the transport, then reacts to session events.
    fn flush_session(&mut self) {
        let events = match (&mut self.session, &mut self.transport) {
            (Some(session), Some(transport)) => {
                for message in session.drain_outgoing() {
                    if let Err(err) = transport.send(message) {
                        debug!("Failed to send message to realm {}: {err:#}", self.realm);
                    }
                }
                session.take_events()
            }
            _ => return,
        };
        for event in events {
            match event {
                SessionEvent::Joined(details) => self.handle_joined(details),
                SessionEvent::Leaving { reason, message } => self.handle_leaving(reason, message),
                SessionEvent::Left { reason, message } => self.handle_left(reason, message),
            }
        }
    }

    fn handle_joined(&mut self, details: SessionDetails) {
        let session = match self.session.as_ref().and_then(|session| session.handle()) {
            Some(session) => session,
            None => return,
        };
        info!(
            "Joined realm {} with session {}",
            details.realm, details.session_id
        );
        self.publish_status();
        let handler = self.handler.clone();
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_open(session, &details))) {
            Ok(Ok(())) => (),
            Ok(Err(err)) => error!("Connection open handler failed: {err:#}"),
            Err(_) => error!("Connection open handler panicked"),
        }
    }

    fn handle_leaving(&mut self, reason: Uri, message: String) {
        debug!("Leaving realm {} with reason {reason}", self.realm);
        self.session_close = Some((reason, message));
        self.retry_enabled = false;
    }

    fn handle_left(&mut self, reason: Uri, message: String) {
        self.session_close = Some((reason, message));
        // Leaving the realm, from either side, never triggers reconnection.
        self.retry_enabled = false;
        self.transport_closing = true;
        if let Some(transport) = &mut self.transport {
            transport.close(close_code::NORMAL);
        }
    }

    fn notify_close(
        &self,
        reason: ConnectionCloseReason,
        details: &ConnectionCloseDetails,
    ) -> bool {
        let handler = self.handler.clone();
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.on_close(reason, details))) {
            Ok(Ok(stop_retrying)) => stop_retrying,
            Ok(Err(err)) => {
                error!("Connection close handler failed: {err:#}");
                false
            }
            Err(_) => {
                error!("Connection close handler panicked");
                false
            }
        }
    }

    fn shutdown(&mut self) {
        self.retry_at = None;
        self.is_retrying = false;
        if let Some(mut session) = self.session.take() {
            session.teardown();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close(close_code::GOING_AWAY);
        }
        self.transport_open = false;
        self.publish_status();
    }
}
