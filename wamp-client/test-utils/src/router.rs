//! An in-process WAMP router, reachable through the `direct` transport.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::{
    debug,
    warn,
};
use wamp_client::{
    connection::config::ConnectionConfig,
    core::{
        close::{
            CloseReason,
            close_code,
        },
        id::{
            Id,
            SequentialIdAllocator,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::goodbye_and_out,
        message::{
            AbortMessage,
            AuthenticateMessage,
            CallMessage,
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            GoodbyeMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    transport::{
        direct_transport::{
            DirectConnector,
            DirectFrame,
            DirectStream,
            direct_stream_pair,
            register_direct_transport,
        },
        registry::TransportRegistry,
        transport::TransportConfig,
    },
};

const URL: &str = "direct://test-router";

const UNSUBSCRIBE: u64 = 34;
const CALL: u64 = 48;
const REGISTER: u64 = 64;
const UNREGISTER: u64 = 66;
const INVOCATION: u64 = 68;

fn error_uri(component: &str) -> Uri {
    Uri::try_from(format!("wamp.error.{component}")).unwrap_or_default()
}

fn bool_option(options: &Dictionary, key: &str) -> Option<bool> {
    options.get(key).and_then(Value::bool)
}

fn id_list_option(options: &Dictionary, key: &str) -> Option<HashSet<u64>> {
    options
        .get(key)
        .and_then(Value::list)
        .map(|list| list.iter().filter_map(Value::integer).collect())
}

#[derive(Debug)]
struct PeerConnection {
    tx: tokio::sync::mpsc::UnboundedSender<DirectFrame>,
    session: Option<Id>,
    challenged: Option<HelloMessage>,
    closing: bool,
}

#[derive(Debug)]
struct RouterRegistration {
    procedure: Uri,
    connection: u64,
    disclose_caller: bool,
}

#[derive(Debug)]
struct RouterSubscription {
    topic: Uri,
    subscribers: HashSet<u64>,
}

#[derive(Debug)]
struct PendingInvocation {
    caller: u64,
    callee: u64,
    call_request: Id,
}

#[derive(Debug, Default)]
struct RouterState {
    unreachable: bool,
    abort_reason: Option<Uri>,
    drop_on_goodbye: bool,
    ticket: Option<String>,
    ids: SequentialIdAllocator,
    next_connection: u64,
    connections: HashMap<u64, PeerConnection>,
    registrations: HashMap<Id, RouterRegistration>,
    subscriptions: HashMap<Id, RouterSubscription>,
    invocations: HashMap<Id, PendingInvocation>,
    connection_attempts: usize,
    sessions_joined: usize,
}

impl RouterState {
    fn send(&self, connection: u64, message: Message) {
        if let Some(peer) = self.connections.get(&connection) {
            peer.tx.send(DirectFrame::Message(message)).ok();
        }
    }

    fn session_id(&self, connection: u64) -> Option<Id> {
        self.connections
            .get(&connection)
            .and_then(|peer| peer.session)
    }

    fn send_error(&self, connection: u64, request_type: u64, request: Id, component: &str) {
        self.send(
            connection,
            Message::Error(ErrorMessage {
                request_type,
                request,
                details: Dictionary::default(),
                error: error_uri(component),
                arguments: List::default(),
                arguments_keyword: Dictionary::default(),
            }),
        );
    }

    fn abort(&self, connection: u64, reason: Uri) {
        self.send(
            connection,
            Message::Abort(AbortMessage {
                details: Dictionary::default(),
                reason,
                arguments: List::default(),
                arguments_keyword: Dictionary::default(),
            }),
        );
    }

    fn handle_frame(&mut self, connection: u64, frame: DirectFrame) {
        match frame {
            DirectFrame::Message(message) => self.handle_message(connection, message),
            DirectFrame::Close { code, .. } => {
                debug!("Connection {connection} closed by peer with code {code}");
                self.remove_connection(connection);
            }
        }
    }

    fn handle_message(&mut self, connection: u64, message: Message) {
        let (established, challenged) = match self.connections.get(&connection) {
            Some(peer) => (peer.session.is_some(), peer.challenged.is_some()),
            None => return,
        };
        match message {
            Message::Hello(message) if !established && !challenged => {
                self.handle_hello(connection, message)
            }
            Message::Authenticate(message) if challenged => {
                self.handle_authenticate(connection, message)
            }
            Message::Goodbye(_) if established => self.handle_goodbye(connection),
            Message::Register(message) if established => self.handle_register(connection, message),
            Message::Unregister(message) if established => {
                self.handle_unregister(connection, message)
            }
            Message::Call(message) if established => self.handle_call(connection, message),
            Message::Yield(message) if established => self.handle_yield(message),
            Message::Error(message) if established && message.request_type == INVOCATION => {
                self.handle_invocation_error(message)
            }
            Message::Subscribe(message) if established => {
                self.handle_subscribe(connection, message)
            }
            Message::Unsubscribe(message) if established => {
                self.handle_unsubscribe(connection, message)
            }
            Message::Publish(message) if established => self.handle_publish(connection, message),
            message => warn!(
                "Router ignoring unexpected {} on connection {connection}",
                message.message_name()
            ),
        }
    }

    fn handle_hello(&mut self, connection: u64, message: HelloMessage) {
        if let Some(reason) = self.abort_reason.clone() {
            self.abort(connection, reason);
            return;
        }
        let ticket = match &self.ticket {
            Some(ticket) => ticket.clone(),
            None => {
                self.welcome(connection, &message, "anonymous", "anonymous");
                return;
            }
        };
        let offers_ticket = message
            .details
            .get("authmethods")
            .and_then(Value::list)
            .is_some_and(|methods| methods.iter().any(|method| method.string() == Some("ticket")));
        if !offers_ticket {
            debug!("Connection {connection} did not offer ticket ({ticket:?} required)");
            self.abort(connection, error_uri("no_auth_method"));
            return;
        }
        if let Some(peer) = self.connections.get_mut(&connection) {
            peer.challenged = Some(message);
        }
        self.send(
            connection,
            Message::Challenge(ChallengeMessage {
                auth_method: "ticket".to_owned(),
                extra: Dictionary::default(),
            }),
        );
    }

    fn handle_authenticate(&mut self, connection: u64, message: AuthenticateMessage) {
        let hello = match self
            .connections
            .get_mut(&connection)
            .and_then(|peer| peer.challenged.take())
        {
            Some(hello) => hello,
            None => return,
        };
        if self.ticket.as_deref() == Some(message.signature.as_str()) {
            self.welcome(connection, &hello, "ticket", "user");
        } else {
            self.abort(connection, error_uri("authentication_failed"));
        }
    }

    fn welcome(&mut self, connection: u64, hello: &HelloMessage, authmethod: &str, authrole: &str) {
        let session = self.ids.generate_id();
        let mut details = Dictionary::from_iter([
            ("authmethod".to_owned(), Value::from(authmethod)),
            ("authrole".to_owned(), Value::from(authrole)),
            (
                "roles".to_owned(),
                Value::Dictionary(Dictionary::from_iter([
                    ("broker".to_owned(), Value::Dictionary(Dictionary::default())),
                    ("dealer".to_owned(), Value::Dictionary(Dictionary::default())),
                ])),
            ),
        ]);
        if let Some(authid) = hello.details.get("authid") {
            details.insert("authid".to_owned(), authid.clone());
        }
        if let Some(peer) = self.connections.get_mut(&connection) {
            peer.session = Some(session);
        }
        self.sessions_joined += 1;
        debug!("Router welcomed session {session} on connection {connection}");
        self.send(connection, Message::Welcome(WelcomeMessage { session, details }));
    }

    fn handle_goodbye(&mut self, connection: u64) {
        if self.drop_on_goodbye {
            debug!("Router dropping connection {connection} instead of replying to GOODBYE");
            self.remove_connection(connection);
            return;
        }
        let closing = self
            .connections
            .get(&connection)
            .is_some_and(|peer| peer.closing);
        if !closing {
            self.send(connection, goodbye_and_out());
        }
        self.end_session(connection);
    }

    fn handle_register(&mut self, connection: u64, message: RegisterMessage) {
        if self
            .registrations
            .values()
            .any(|registration| registration.procedure == message.procedure)
        {
            self.send_error(
                connection,
                REGISTER,
                message.request,
                "procedure_already_exists",
            );
            return;
        }
        let registration = self.ids.generate_id();
        self.registrations.insert(
            registration,
            RouterRegistration {
                procedure: message.procedure,
                connection,
                disclose_caller: bool_option(&message.options, "disclose_caller")
                    .unwrap_or(false),
            },
        );
        self.send(
            connection,
            Message::Registered(RegisteredMessage {
                register_request: message.request,
                registration,
            }),
        );
    }

    fn handle_unregister(&mut self, connection: u64, message: UnregisterMessage) {
        match self.registrations.get(&message.registered_registration) {
            Some(registration) if registration.connection == connection => {
                self.registrations.remove(&message.registered_registration);
                self.send(
                    connection,
                    Message::Unregistered(UnregisteredMessage {
                        unregister_request: message.request,
                    }),
                );
            }
            _ => self.send_error(
                connection,
                UNREGISTER,
                message.request,
                "no_such_registration",
            ),
        }
    }

    fn handle_call(&mut self, connection: u64, message: CallMessage) {
        let (registration, callee, disclose_caller) = match self
            .registrations
            .iter()
            .find(|(_, registration)| registration.procedure == message.procedure)
        {
            Some((id, registration)) => (
                *id,
                registration.connection,
                registration.disclose_caller,
            ),
            None => {
                self.send_error(connection, CALL, message.request, "no_such_procedure");
                return;
            }
        };
        let mut details = Dictionary::default();
        if disclose_caller || bool_option(&message.options, "disclose_me").unwrap_or(false) {
            if let Some(caller) = self.session_id(connection) {
                details.insert("caller".to_owned(), Value::Integer(caller.value()));
            }
        }
        let request = self.ids.generate_id();
        self.invocations.insert(
            request,
            PendingInvocation {
                caller: connection,
                callee,
                call_request: message.request,
            },
        );
        self.send(
            callee,
            Message::Invocation(InvocationMessage {
                request,
                registered_registration: registration,
                details,
                call_arguments: message.arguments,
                call_arguments_keyword: message.arguments_keyword,
            }),
        );
    }

    fn handle_yield(&mut self, message: YieldMessage) {
        if let Some(invocation) = self.invocations.remove(&message.invocation_request) {
            self.send(
                invocation.caller,
                Message::Result(ResultMessage {
                    call_request: invocation.call_request,
                    details: Dictionary::default(),
                    yield_arguments: message.arguments,
                    yield_arguments_keyword: message.arguments_keyword,
                }),
            );
        }
    }

    fn handle_invocation_error(&mut self, message: ErrorMessage) {
        if let Some(invocation) = self.invocations.remove(&message.request) {
            self.send(
                invocation.caller,
                Message::Error(ErrorMessage {
                    request_type: CALL,
                    request: invocation.call_request,
                    details: message.details,
                    error: message.error,
                    arguments: message.arguments,
                    arguments_keyword: message.arguments_keyword,
                }),
            );
        }
    }

    fn handle_subscribe(&mut self, connection: u64, message: SubscribeMessage) {
        let existing = self
            .subscriptions
            .iter()
            .find(|(_, subscription)| subscription.topic == message.topic)
            .map(|(id, _)| *id);
        let subscription = match existing {
            Some(id) => id,
            None => {
                let id = self.ids.generate_id();
                self.subscriptions.insert(
                    id,
                    RouterSubscription {
                        topic: message.topic,
                        subscribers: HashSet::default(),
                    },
                );
                id
            }
        };
        if let Some(entry) = self.subscriptions.get_mut(&subscription) {
            entry.subscribers.insert(connection);
        }
        self.send(
            connection,
            Message::Subscribed(SubscribedMessage {
                subscribe_request: message.request,
                subscription,
            }),
        );
    }

    fn handle_unsubscribe(&mut self, connection: u64, message: UnsubscribeMessage) {
        let removed = self
            .subscriptions
            .get_mut(&message.subscribed_subscription)
            .is_some_and(|subscription| subscription.subscribers.remove(&connection));
        if !removed {
            self.send_error(
                connection,
                UNSUBSCRIBE,
                message.request,
                "no_such_subscription",
            );
            return;
        }
        self.subscriptions
            .retain(|_, subscription| !subscription.subscribers.is_empty());
        self.send(
            connection,
            Message::Unsubscribed(UnsubscribedMessage {
                unsubscribe_request: message.request,
            }),
        );
    }

    fn handle_publish(&mut self, connection: u64, message: PublishMessage) {
        let publication = self.ids.generate_id();
        let publisher = self.session_id(connection);
        let exclude_me = bool_option(&message.options, "exclude_me").unwrap_or(true);
        let excluded = id_list_option(&message.options, "exclude").unwrap_or_default();
        let eligible = id_list_option(&message.options, "eligible");
        let mut details = Dictionary::default();
        if bool_option(&message.options, "disclose_me").unwrap_or(false) {
            if let Some(publisher) = publisher {
                details.insert("publisher".to_owned(), Value::Integer(publisher.value()));
            }
        }

        let mut deliveries = Vec::new();
        for (id, subscription) in &self.subscriptions {
            if subscription.topic != message.topic {
                continue;
            }
            for subscriber in &subscription.subscribers {
                if exclude_me && *subscriber == connection {
                    continue;
                }
                let session = match self.session_id(*subscriber) {
                    Some(session) => session.value(),
                    None => continue,
                };
                if excluded.contains(&session)
                    || eligible
                        .as_ref()
                        .is_some_and(|eligible| !eligible.contains(&session))
                {
                    continue;
                }
                deliveries.push((*subscriber, *id));
            }
        }
        for (subscriber, subscription) in deliveries {
            self.send(
                subscriber,
                Message::Event(EventMessage {
                    subscribed_subscription: subscription,
                    published_publication: publication,
                    details: details.clone(),
                    publish_arguments: message.arguments.clone(),
                    publish_arguments_keyword: message.arguments_keyword.clone(),
                }),
            );
        }

        if bool_option(&message.options, "acknowledge").unwrap_or(false) {
            self.send(
                connection,
                Message::Published(PublishedMessage {
                    publish_request: message.request,
                    publication,
                }),
            );
        }
    }

    /// Forgets everything the session on the connection owned, keeping the connection itself.
    fn end_session(&mut self, connection: u64) {
        if let Some(peer) = self.connections.get_mut(&connection) {
            peer.session = None;
            peer.challenged = None;
            peer.closing = false;
        }
        self.registrations
            .retain(|_, registration| registration.connection != connection);
        for subscription in self.subscriptions.values_mut() {
            subscription.subscribers.remove(&connection);
        }
        self.subscriptions
            .retain(|_, subscription| !subscription.subscribers.is_empty());

        let orphaned = self
            .invocations
            .iter()
            .filter(|(_, invocation)| invocation.callee == connection)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in orphaned {
            if let Some(invocation) = self.invocations.remove(&id) {
                self.send_error(invocation.caller, CALL, invocation.call_request, "canceled");
            }
        }
        self.invocations
            .retain(|_, invocation| invocation.caller != connection);
    }

    fn remove_connection(&mut self, connection: u64) {
        self.end_session(connection);
        self.connections.remove(&connection);
    }
}

/// An in-process router serving a single realm to `direct` transports.
#[derive(Debug)]
pub struct TestRouter {
    realm: Uri,
    state: Arc<Mutex<RouterState>>,
}

impl TestRouter {
    /// Creates a router for the given realm.
    pub fn new(realm: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            realm: Uri::try_from(realm)?,
            state: Arc::new(Mutex::new(RouterState::default())),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A transport registry where the `direct` transport connects to this router.
    pub fn transport_registry(self: &Arc<Self>) -> TransportRegistry {
        let mut registry = TransportRegistry::default();
        register_direct_transport(&mut registry, self.clone());
        registry
    }

    /// The transport entry for this router.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new("direct", URL)
    }

    /// A connection configuration for this router's realm, retrying quickly.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            realm: self.realm.to_string(),
            transports: Vec::from_iter([self.transport_config()]),
            initial_retry_delay: 0.1,
            max_retry_delay: 1.0,
            retry_delay_jitter: 0.0,
            leave_timeout: 1.0,
            ..Default::default()
        }
    }

    /// Refuses new connections while unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Aborts every HELLO with the given reason.
    pub fn abort_hello(&self, reason: Option<Uri>) {
        self.lock().abort_reason = reason;
    }

    /// Drops the connection when a session sends GOODBYE, without replying.
    pub fn drop_on_goodbye(&self, drop: bool) {
        self.lock().drop_on_goodbye = drop;
    }

    /// Requires ticket authentication with the given ticket.
    pub fn require_ticket(&self, ticket: &str) {
        self.lock().ticket = Some(ticket.to_owned());
    }

    /// The number of connection attempts, including refused ones.
    pub fn connection_attempts(&self) -> usize {
        self.lock().connection_attempts
    }

    /// The number of sessions welcomed since the router started.
    pub fn sessions_joined(&self) -> usize {
        self.lock().sessions_joined
    }

    /// The number of sessions currently established.
    pub fn active_sessions(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|peer| peer.session.is_some())
            .count()
    }

    /// Closes every connection cleanly, without leaving sessions first.
    pub fn close_connections(&self) {
        let mut state = self.lock();
        for peer in state.connections.values() {
            peer.tx
                .send(DirectFrame::Close {
                    code: close_code::NORMAL,
                    reason: "router closing".to_owned(),
                })
                .ok();
        }
        let connections = state.connections.keys().copied().collect::<Vec<_>>();
        for connection in connections {
            state.remove_connection(connection);
        }
    }

    /// Drops every connection abruptly.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let connections = state.connections.keys().copied().collect::<Vec<_>>();
        for connection in connections {
            state.remove_connection(connection);
        }
    }

    /// Asks every established session to leave the realm.
    pub fn shut_down_sessions(&self) {
        let mut state = self.lock();
        let reason = CloseReason::SystemShutdown.uri();
        let connections = state
            .connections
            .iter()
            .filter(|(_, peer)| peer.session.is_some() && !peer.closing)
            .map(|(connection, _)| *connection)
            .collect::<Vec<_>>();
        for connection in connections {
            if let Some(peer) = state.connections.get_mut(&connection) {
                peer.closing = true;
            }
            state.send(
                connection,
                Message::Goodbye(GoodbyeMessage {
                    details: Dictionary::default(),
                    reason: reason.clone(),
                }),
            );
        }
    }
}

#[async_trait]
impl DirectConnector for TestRouter {
    async fn connect(&self, url: &str) -> Result<DirectStream> {
        let (connection, router_end, client_end) = {
            let mut state = self.lock();
            state.connection_attempts += 1;
            if state.unreachable {
                return Err(Error::msg(format!("{url} is unreachable")));
            }
            let (client_end, router_end) = direct_stream_pair();
            state.next_connection += 1;
            let connection = state.next_connection;
            state.connections.insert(
                connection,
                PeerConnection {
                    tx: router_end.tx.clone(),
                    session: None,
                    challenged: None,
                    closing: false,
                },
            );
            (connection, router_end, client_end)
        };
        // The router keeps only the sender it stored, so removing the connection drops the stream.
        let DirectStream { tx, mut rx } = router_end;
        drop(tx);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handle_frame(connection, frame);
            }
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_connection(connection);
        });
        Ok(client_end)
    }
}
