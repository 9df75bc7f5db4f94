use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::FutureExt;
use log::{
    debug,
    error,
    info,
    trace,
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
    },
    time::{
        Instant,
        sleep_until,
    },
};

use crate::{
    core::{
        close::CloseReason,
        error::{
            InteractionError,
            SessionError,
            WampError,
        },
        hash::{
            HashMap,
            HashSet,
        },
        id::{
            Id,
            SequentialIdAllocator,
        },
        roles::{
            PeerRole,
            roles_dictionary,
        },
        types::{
            Dictionary,
            Integer,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_reason,
        },
        message::{
            AuthenticateMessage,
            CallMessage,
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
            YieldMessage,
        },
    },
    session::{
        handle::{
            SessionCommand,
            SessionHandle,
        },
        handler::{
            ChallengeHandler,
            EventHandler,
            ProcedureHandler,
        },
        types::{
            Invocation,
            InvocationDetails,
            ReceivedEvent,
            Registration,
            RpcResult,
            RpcYield,
            SessionDetails,
            Subscription,
        },
    },
};

const INVOCATION_MESSAGE_TYPE: Integer = 68;

/// Settings for a single session, derived from the connection configuration.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub authmethods: Vec<String>,
    pub authid: Option<String>,
    pub agent: Option<String>,
    pub challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    pub leave_timeout: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    #[default]
    Closed,
    Handshaking,
    Established,
    Closing,
}

/// A lifecycle event reported to the connection.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionEvent {
    /// The router welcomed the session.
    Joined(SessionDetails),
    /// The application started a graceful close and GOODBYE was sent.
    Leaving { reason: Uri, message: String },
    /// The session ended at the protocol level.
    ///
    /// Reported at most once, for ABORT, GOODBYE, or an expired leave.
    Left { reason: Uri, message: String },
}

/// Work finished outside of the connection task.
pub(crate) enum Completion {
    Challenge(Result<String>),
    Invocation { request: Id, result: Result<RpcYield> },
}

/// An input for the session, other than a message from the peer.
pub(crate) enum SessionInput {
    Command(SessionCommand),
    Completion(Completion),
    LeaveTimeout,
}

enum PendingRequest {
    Call(oneshot::Sender<Result<RpcResult>>),
    Register {
        procedure: Uri,
        handler: Arc<dyn ProcedureHandler>,
        reply: oneshot::Sender<Result<Registration>>,
    },
    Unregister {
        registration: Id,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topic: Uri,
        handler: Arc<dyn EventHandler>,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        subscription: Id,
        reply: oneshot::Sender<Result<()>>,
    },
    Publish(oneshot::Sender<Result<Option<Id>>>),
}

impl PendingRequest {
    fn reject(self, error: Error) {
        match self {
            Self::Call(reply) => {
                reply.send(Err(error)).ok();
            }
            Self::Register { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            Self::Unregister { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            Self::Subscribe { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            Self::Unsubscribe { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            Self::Publish(reply) => {
                reply.send(Err(error)).ok();
            }
        }
    }
}

struct LocalRegistration {
    procedure: Uri,
    handler: Arc<dyn ProcedureHandler>,
}

struct LocalSubscription {
    topic: Uri,
    handlers: Vec<(u64, Arc<dyn EventHandler>)>,
}

/// The WAMP protocol engine for a single session over a single transport.
///
/// The session performs no I/O itself. Messages for the peer are queued in
/// [`Session::drain_outgoing`], and lifecycle events in [`Session::take_events`]; the connection
/// task moves them to the transport and the application.
pub(crate) struct Session {
    realm: Uri,
    config: SessionConfig,
    state: SessionState,
    handle: Option<SessionHandle>,

    id_allocator: SequentialIdAllocator,
    pending: HashMap<Id, PendingRequest>,
    registrations: HashMap<Id, LocalRegistration>,
    subscriptions: HashMap<Id, LocalSubscription>,
    active_invocations: HashSet<Id>,
    next_handler_key: u64,

    command_tx: UnboundedSender<SessionCommand>,
    command_rx: UnboundedReceiver<SessionCommand>,
    completion_tx: UnboundedSender<Completion>,
    completion_rx: UnboundedReceiver<Completion>,

    leave_reason: Option<(Uri, String)>,
    leave_deadline: Option<Instant>,
    left: bool,

    outgoing: VecDeque<Message>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(realm: Uri, config: SessionConfig) -> Self {
        let (command_tx, command_rx) = unbounded_channel();
        let (completion_tx, completion_rx) = unbounded_channel();
        Self {
            realm,
            config,
            state: SessionState::default(),
            handle: None,
            id_allocator: SequentialIdAllocator::default(),
            pending: HashMap::default(),
            registrations: HashMap::default(),
            subscriptions: HashMap::default(),
            active_invocations: HashSet::default(),
            next_handler_key: 0,
            command_tx,
            command_rx,
            completion_tx,
            completion_rx,
            leave_reason: None,
            leave_deadline: None,
            left: false,
            outgoing: VecDeque::default(),
            events: Vec::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// The handle for the application, once the session is established.
    pub fn handle(&self) -> Option<SessionHandle> {
        match self.state {
            SessionState::Established => self.handle.clone(),
            _ => None,
        }
    }

    /// Messages queued for the peer, in order.
    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.outgoing.drain(..)
    }

    /// Lifecycle events raised since the last call.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn send(&mut self, message: Message) {
        trace!(
            "Session on realm {} sending message: {message:?}",
            self.realm
        );
        self.outgoing.push_back(message);
    }

    fn transition_state(&mut self, state: SessionState) {
        if state == self.state {
            return;
        }
        trace!(
            "Session on realm {} transitioned from {:?} to {state:?}",
            self.realm, self.state
        );
        self.state = state;
    }

    fn report_left(&mut self, reason: Uri, message: String) {
        self.leave_deadline = None;
        self.reject_pending();
        if self.left {
            return;
        }
        self.left = true;
        info!(
            "Session on realm {} left with reason {reason}",
            self.realm
        );
        self.events.push(SessionEvent::Left { reason, message });
    }

    fn reject_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.reject(SessionError::SessionLost.into());
        }
    }

    /// Starts the handshake by sending HELLO.
    pub fn join(&mut self) {
        if self.state != SessionState::Closed || self.left {
            warn!(
                "Ignoring join on realm {} in state {:?}",
                self.realm, self.state
            );
            return;
        }
        let mut details = Dictionary::default();
        details.insert(
            "roles".to_owned(),
            Value::Dictionary(roles_dictionary(PeerRole::ALL)),
        );
        if !self.config.authmethods.is_empty() {
            details.insert(
                "authmethods".to_owned(),
                Value::List(
                    self.config
                        .authmethods
                        .iter()
                        .map(|method| Value::String(method.clone()))
                        .collect::<List>(),
                ),
            );
        }
        if let Some(authid) = &self.config.authid {
            details.insert("authid".to_owned(), Value::String(authid.clone()));
        }
        if let Some(agent) = &self.config.agent {
            details.insert("agent".to_owned(), Value::String(agent.clone()));
        }
        self.send(Message::Hello(HelloMessage {
            realm: self.realm.clone(),
            details,
        }));
        self.transition_state(SessionState::Handshaking);
    }

    /// Starts a graceful close by sending GOODBYE.
    ///
    /// [`SessionEvent::Leaving`] is raised immediately. [`SessionEvent::Left`] follows when the
    /// peer replies, or when the leave timeout expires.
    pub fn leave(&mut self, reason: Uri, message: String) -> Result<()> {
        match self.state {
            SessionState::Established => {
                self.send(goodbye_with_reason(reason.clone(), &message));
                self.transition_state(SessionState::Closing);
                self.events.push(SessionEvent::Leaving {
                    reason: reason.clone(),
                    message: message.clone(),
                });
                self.leave_reason = Some((reason, message));
                self.leave_deadline = Some(Instant::now() + self.config.leave_timeout);
                Ok(())
            }
            SessionState::Closing => Ok(()),
            _ => Err(SessionError::NotEstablished.into()),
        }
    }

    /// Ends the session because its transport closed.
    pub fn teardown(&mut self) {
        self.transition_state(SessionState::Closed);
        self.leave_deadline = None;
        self.reject_pending();
        self.registrations.clear();
        self.subscriptions.clear();
        self.active_invocations.clear();
        self.handle = None;
    }

    /// Waits for the next command, completion, or timeout.
    pub async fn next_input(&mut self) -> SessionInput {
        let leave_deadline = self.leave_deadline;
        tokio::select! {
            Some(command) = self.command_rx.recv() => SessionInput::Command(command),
            Some(completion) = self.completion_rx.recv() => SessionInput::Completion(completion),
            _ = sleep_until(leave_deadline.unwrap_or_else(Instant::now)), if leave_deadline.is_some() => SessionInput::LeaveTimeout,
        }
    }

    pub fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command(command) => self.handle_command(command),
            SessionInput::Completion(Completion::Challenge(result)) => {
                self.handle_challenge_result(result)
            }
            SessionInput::Completion(Completion::Invocation { request, result }) => {
                self.handle_invocation_result(request, result)
            }
            SessionInput::LeaveTimeout => self.handle_leave_timeout(),
        }
    }

    /// Handles a message from the peer.
    pub fn handle_message(&mut self, message: Message) {
        trace!(
            "Session on realm {} received message: {message:?}",
            self.realm
        );
        let result = match self.state {
            SessionState::Closed => {
                debug!(
                    "Ignoring {} message on a closed session",
                    message.message_name()
                );
                Ok(())
            }
            SessionState::Handshaking => self.handle_handshaking(message),
            SessionState::Established => self.handle_established(message),
            SessionState::Closing => self.handle_closing(message),
        };
        if let Err(err) = result {
            self.abort(err);
        }
    }

    fn abort(&mut self, err: Error) {
        warn!("Aborting session on realm {}: {err:#}", self.realm);
        self.send(abort_message_for_error(&err));
        self.transition_state(SessionState::Closed);
        self.report_left(Uri::for_error(&err), err.to_string());
    }

    fn handle_handshaking(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Welcome(message) => {
                let details =
                    SessionDetails::new(message.session, self.realm.clone(), message.details);
                self.handle = Some(SessionHandle::new(
                    details.clone(),
                    self.command_tx.clone(),
                ));
                self.transition_state(SessionState::Established);
                info!(
                    "Started session {} on realm {}",
                    message.session, self.realm
                );
                self.events.push(SessionEvent::Joined(details));
                Ok(())
            }
            Message::Challenge(message) => self.handle_challenge(message),
            Message::Abort(message) => {
                let text = WampError::message_from_payload(&message.details, &message.arguments);
                warn!(
                    "Router aborted session on realm {}: {} {text}",
                    self.realm, message.reason
                );
                self.transition_state(SessionState::Closed);
                self.report_left(message.reason, text);
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an establishing session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_challenge(&mut self, message: ChallengeMessage) -> Result<()> {
        let handler = match &self.config.challenge_handler {
            Some(handler) => handler.clone(),
            None => {
                return Err(InteractionError::CannotAuthenticate(format!(
                    "no challenge handler for {} authentication",
                    message.auth_method
                ))
                .into());
            }
        };
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler.challenge(&message.auth_method, &message.extra))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::msg("challenge handler panicked")));
            completion_tx.send(Completion::Challenge(result)).ok();
        });
        Ok(())
    }

    fn handle_challenge_result(&mut self, result: Result<String>) {
        if self.state != SessionState::Handshaking {
            return;
        }
        match result {
            Ok(signature) => self.send(Message::Authenticate(AuthenticateMessage {
                signature,
                extra: Dictionary::default(),
            })),
            Err(err) => self.abort(InteractionError::CannotAuthenticate(format!("{err:#}")).into()),
        }
    }

    fn handle_established(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Result(message) => {
                match self.pending.remove(&message.call_request) {
                    Some(PendingRequest::Call(reply)) => {
                        reply
                            .send(Ok(RpcResult {
                                arguments: message.yield_arguments,
                                arguments_keyword: message.yield_arguments_keyword,
                                details: message.details,
                            }))
                            .ok();
                    }
                    pending => self.unmatched_reply("RESULT", message.call_request, pending),
                }
                Ok(())
            }
            Message::Registered(message) => {
                match self.pending.remove(&message.register_request) {
                    Some(PendingRequest::Register {
                        procedure,
                        handler,
                        reply,
                    }) => {
                        self.registrations.insert(
                            message.registration,
                            LocalRegistration {
                                procedure: procedure.clone(),
                                handler,
                            },
                        );
                        reply
                            .send(Ok(Registration {
                                id: message.registration,
                                procedure,
                            }))
                            .ok();
                    }
                    pending => {
                        self.unmatched_reply("REGISTERED", message.register_request, pending)
                    }
                }
                Ok(())
            }
            Message::Unregistered(message) => {
                match self.pending.remove(&message.unregister_request) {
                    Some(PendingRequest::Unregister {
                        registration,
                        reply,
                    }) => {
                        self.registrations.remove(&registration);
                        reply.send(Ok(())).ok();
                    }
                    pending => {
                        self.unmatched_reply("UNREGISTERED", message.unregister_request, pending)
                    }
                }
                Ok(())
            }
            Message::Subscribed(message) => {
                match self.pending.remove(&message.subscribe_request) {
                    Some(PendingRequest::Subscribe {
                        topic,
                        handler,
                        reply,
                    }) => {
                        let key = self.next_handler_key;
                        self.next_handler_key += 1;
                        self.subscriptions
                            .entry(message.subscription)
                            .or_insert_with(|| LocalSubscription {
                                topic: topic.clone(),
                                handlers: Vec::default(),
                            })
                            .handlers
                            .push((key, handler));
                        reply
                            .send(Ok(Subscription {
                                id: message.subscription,
                                topic,
                                key,
                            }))
                            .ok();
                    }
                    pending => {
                        self.unmatched_reply("SUBSCRIBED", message.subscribe_request, pending)
                    }
                }
                Ok(())
            }
            Message::Unsubscribed(message) => {
                match self.pending.remove(&message.unsubscribe_request) {
                    Some(PendingRequest::Unsubscribe {
                        subscription,
                        reply,
                    }) => {
                        // A new handler may have been added while the request was in flight.
                        if self
                            .subscriptions
                            .get(&subscription)
                            .is_some_and(|subscription| subscription.handlers.is_empty())
                        {
                            self.subscriptions.remove(&subscription);
                        }
                        reply.send(Ok(())).ok();
                    }
                    pending => {
                        self.unmatched_reply("UNSUBSCRIBED", message.unsubscribe_request, pending)
                    }
                }
                Ok(())
            }
            Message::Published(message) => {
                match self.pending.remove(&message.publish_request) {
                    Some(PendingRequest::Publish(reply)) => {
                        reply.send(Ok(Some(message.publication))).ok();
                    }
                    pending => self.unmatched_reply("PUBLISHED", message.publish_request, pending),
                }
                Ok(())
            }
            Message::Error(message) => {
                self.handle_error(message);
                Ok(())
            }
            Message::Invocation(message) => {
                self.handle_invocation(message);
                Ok(())
            }
            Message::Event(message) => {
                self.handle_event(message);
                Ok(())
            }
            Message::Goodbye(message) => {
                let text = WampError::message_from_payload(&message.details, &List::default());
                self.send(goodbye_and_out());
                self.transition_state(SessionState::Closing);
                self.report_left(message.reason, text);
                Ok(())
            }
            Message::Abort(message) => {
                let text = WampError::message_from_payload(&message.details, &message.arguments);
                warn!(
                    "Router aborted session on realm {}: {} {text}",
                    self.realm, message.reason
                );
                self.transition_state(SessionState::Closed);
                self.report_left(message.reason, text);
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_closing(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(message) => {
                let text = match self.leave_reason.take() {
                    Some((_, text)) => text,
                    None => String::default(),
                };
                self.report_left(message.reason, text);
                Ok(())
            }
            Message::Abort(message) => {
                let text = WampError::message_from_payload(&message.details, &message.arguments);
                self.transition_state(SessionState::Closed);
                self.report_left(message.reason, text);
                Ok(())
            }
            message => {
                debug!(
                    "Ignoring {} message on a closing session",
                    message.message_name()
                );
                Ok(())
            }
        }
    }

    fn unmatched_reply(&mut self, message_name: &str, request: Id, pending: Option<PendingRequest>) {
        match pending {
            Some(pending) => {
                warn!("Received {message_name} for request {request} of a different kind");
                self.pending.insert(request, pending);
            }
            None => debug!("Ignoring {message_name} for unknown request {request}"),
        }
    }

    fn handle_error(&mut self, message: ErrorMessage) {
        let pending = match self.pending.remove(&message.request) {
            Some(pending) => pending,
            None => {
                debug!("Ignoring ERROR for unknown request {}", message.request);
                return;
            }
        };
        let error = WampError {
            message: WampError::message_from_payload(&message.details, &message.arguments),
            error: message.error,
            arguments: message.arguments,
            arguments_keyword: message.arguments_keyword,
            details: message.details,
        };
        pending.reject(error.into());
    }

    fn handle_invocation(&mut self, message: InvocationMessage) {
        let (procedure, handler) = match self.registrations.get(&message.registered_registration) {
            Some(registration) => (
                registration.procedure.clone(),
                registration.handler.clone(),
            ),
            None => {
                self.send(error_for_request(
                    INVOCATION_MESSAGE_TYPE,
                    message.request,
                    &InteractionError::NoSuchRegistration.into(),
                ));
                return;
            }
        };
        let request = message.request;
        if !self.active_invocations.insert(request) {
            warn!("Ignoring duplicate INVOCATION for request {request}");
            return;
        }
        let invocation = Invocation {
            arguments: message.call_arguments,
            arguments_keyword: message.call_arguments_keyword,
            details: InvocationDetails::new(
                message.registered_registration,
                procedure,
                message.details,
            ),
        };
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(handler.invoke(invocation))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::msg("procedure handler panicked")));
            completion_tx
                .send(Completion::Invocation { request, result })
                .ok();
        });
    }

    fn handle_invocation_result(&mut self, request: Id, result: Result<RpcYield>) {
        if !self.active_invocations.remove(&request) {
            return;
        }
        match self.state {
            SessionState::Established | SessionState::Closing => (),
            _ => return,
        }
        match result {
            Ok(rpc_yield) => self.send(Message::Yield(YieldMessage {
                invocation_request: request,
                options: Dictionary::default(),
                arguments: rpc_yield.arguments,
                arguments_keyword: rpc_yield.arguments_keyword,
            })),
            Err(err) => {
                debug!("Procedure handler for request {request} failed: {err:#}");
                self.send(error_for_request(INVOCATION_MESSAGE_TYPE, request, &err));
            }
        }
    }

    fn handle_event(&mut self, message: EventMessage) {
        let subscription = match self.subscriptions.get(&message.subscribed_subscription) {
            Some(subscription) => subscription,
            None => {
                debug!(
                    "Ignoring EVENT for unknown subscription {}",
                    message.subscribed_subscription
                );
                return;
            }
        };
        let event = ReceivedEvent::new(
            message.subscribed_subscription,
            message.published_publication,
            subscription.topic.clone(),
            message.details,
            message.publish_arguments,
            message.publish_arguments_keyword,
        );
        for (_, handler) in &subscription.handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => (),
                Ok(Err(err)) => error!(
                    "Event handler for {} failed: {err:#}",
                    event.details.topic
                ),
                Err(_) => error!("Event handler for {} panicked", event.details.topic),
            }
        }
    }

    fn handle_leave_timeout(&mut self) {
        self.leave_deadline = None;
        if self.state != SessionState::Closing || self.left {
            return;
        }
        warn!(
            "Router did not reply to GOODBYE on realm {} in time",
            self.realm
        );
        let (reason, message) = self
            .leave_reason
            .take()
            .unwrap_or_else(|| (CloseReason::Normal.uri(), String::default()));
        self.report_left(reason, message);
    }

    fn handle_command(&mut self, command: SessionCommand) {
        if let SessionCommand::Leave {
            reason,
            message,
            reply,
        } = command
        {
            reply.send(self.leave(reason, message)).ok();
            return;
        }

        if self.state != SessionState::Established {
            debug!(
                "Rejecting {} on realm {} in state {:?}",
                command.name(),
                self.realm,
                self.state
            );
            Self::reject_command(command, SessionError::NotEstablished.into());
            return;
        }

        match command {
            SessionCommand::Call {
                procedure,
                rpc_call,
                reply,
            } => {
                let request = self.id_allocator.generate_id();
                self.pending.insert(request, PendingRequest::Call(reply));
                self.send(Message::Call(CallMessage {
                    request,
                    options: rpc_call.options.to_dictionary(),
                    procedure,
                    arguments: rpc_call.arguments,
                    arguments_keyword: rpc_call.arguments_keyword,
                }));
            }
            SessionCommand::Register {
                procedure,
                options,
                handler,
                reply,
            } => {
                let request = self.id_allocator.generate_id();
                self.pending.insert(
                    request,
                    PendingRequest::Register {
                        procedure: procedure.clone(),
                        handler,
                        reply,
                    },
                );
                self.send(Message::Register(RegisterMessage {
                    request,
                    options: options.to_dictionary(),
                    procedure,
                }));
            }
            SessionCommand::Unregister {
                registration,
                reply,
            } => {
                if !self.registrations.contains_key(&registration.id) {
                    reply
                        .send(Err(InteractionError::NoSuchRegistration.into()))
                        .ok();
                    return;
                }
                let request = self.id_allocator.generate_id();
                self.pending.insert(
                    request,
                    PendingRequest::Unregister {
                        registration: registration.id,
                        reply,
                    },
                );
                self.send(Message::Unregister(UnregisterMessage {
                    request,
                    registered_registration: registration.id,
                }));
            }
            SessionCommand::Subscribe {
                topic,
                handler,
                reply,
            } => {
                let request = self.id_allocator.generate_id();
                self.pending.insert(
                    request,
                    PendingRequest::Subscribe {
                        topic: topic.clone(),
                        handler,
                        reply,
                    },
                );
                self.send(Message::Subscribe(SubscribeMessage {
                    request,
                    options: Dictionary::default(),
                    topic,
                }));
            }
            SessionCommand::Unsubscribe {
                subscription,
                reply,
            } => {
                let remaining = match self.subscriptions.get_mut(&subscription.id) {
                    Some(local) => {
                        let before = local.handlers.len();
                        local.handlers.retain(|(key, _)| *key != subscription.key);
                        if local.handlers.len() == before {
                            None
                        } else {
                            Some(local.handlers.len())
                        }
                    }
                    None => None,
                };
                match remaining {
                    None => {
                        reply
                            .send(Err(SessionError::AlreadyUnsubscribed.into()))
                            .ok();
                    }
                    Some(0) => {
                        let request = self.id_allocator.generate_id();
                        self.pending.insert(
                            request,
                            PendingRequest::Unsubscribe {
                                subscription: subscription.id,
                                reply,
                            },
                        );
                        self.send(Message::Unsubscribe(UnsubscribeMessage {
                            request,
                            subscribed_subscription: subscription.id,
                        }));
                    }
                    Some(_) => {
                        reply.send(Ok(())).ok();
                    }
                }
            }
            SessionCommand::Publish {
                topic,
                event,
                reply,
            } => {
                let request = self.id_allocator.generate_id();
                let acknowledge = event.options.acknowledge;
                self.send(Message::Publish(PublishMessage {
                    request,
                    options: event.options.to_dictionary(),
                    topic,
                    arguments: event.arguments,
                    arguments_keyword: event.arguments_keyword,
                }));
                if acknowledge {
                    self.pending.insert(request, PendingRequest::Publish(reply));
                } else {
                    reply.send(Ok(None)).ok();
                }
            }
            SessionCommand::Leave { .. } => (),
        }
    }

    fn reject_command(command: SessionCommand, error: Error) {
        match command {
            SessionCommand::Call { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            SessionCommand::Register { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            SessionCommand::Unregister { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            SessionCommand::Subscribe { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            SessionCommand::Unsubscribe { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            SessionCommand::Publish { reply, .. } => {
                reply.send(Err(error)).ok();
            }
            SessionCommand::Leave { reply, .. } => {
                reply.send(Err(error)).ok();
            }
        }
    }
}
