use crate::{
    core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    session::options::{
        CallOptions,
        PublishOptions,
    },
};

fn string_detail(details: &Dictionary, key: &str) -> Option<String> {
    details.get(key).and_then(Value::string).map(str::to_owned)
}

fn id_detail(details: &Dictionary, key: &str) -> Option<Id> {
    details
        .get(key)
        .and_then(Value::integer)
        .and_then(|id| Id::try_from(id).ok())
}

fn uri_detail(details: &Dictionary, key: &str) -> Option<Uri> {
    details
        .get(key)
        .and_then(Value::string)
        .and_then(|uri| Uri::try_from(uri).ok())
}

/// Details of an established session, from the router's WELCOME.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetails {
    /// The session ID assigned by the router.
    pub session_id: Id,
    /// The realm the session joined.
    pub realm: Uri,
    pub authid: Option<String>,
    pub authrole: Option<String>,
    pub authmethod: Option<String>,
    pub authprovider: Option<String>,
    /// The raw WELCOME details.
    pub details: Dictionary,
}

impl SessionDetails {
    pub(crate) fn new(session_id: Id, realm: Uri, details: Dictionary) -> Self {
        Self {
            session_id,
            realm,
            authid: string_detail(&details, "authid"),
            authrole: string_detail(&details, "authrole"),
            authmethod: string_detail(&details, "authmethod"),
            authprovider: string_detail(&details, "authprovider"),
            details,
        }
    }
}

/// An RPC call, made by a caller.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: CallOptions,
}

/// The result of an RPC call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// The value yielded by a procedure handler for a single invocation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// Details for a single invocation of a procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationDetails {
    /// The registration being invoked.
    pub registration: Id,
    /// The procedure being invoked.
    pub procedure: Uri,
    /// The calling session, if the caller disclosed itself.
    pub caller: Option<Id>,
    pub caller_authid: Option<String>,
    pub caller_authrole: Option<String>,
    /// The raw INVOCATION details.
    pub details: Dictionary,
}

impl InvocationDetails {
    pub(crate) fn new(registration: Id, procedure: Uri, details: Dictionary) -> Self {
        Self {
            registration,
            // A pattern-based registration reports the concrete procedure.
            procedure: uri_detail(&details, "procedure").unwrap_or(procedure),
            caller: id_detail(&details, "caller"),
            caller_authid: string_detail(&details, "caller_authid"),
            caller_authrole: string_detail(&details, "caller_authrole"),
            details,
        }
    }
}

/// An invocation of a registered procedure, passed to its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: InvocationDetails,
}

/// An event to publish to a topic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

/// Details for an event received on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetails {
    /// The subscription the event arrived on.
    pub subscription: Id,
    /// The publication ID assigned by the router.
    pub publication: Id,
    /// The topic the event was published to.
    pub topic: Uri,
    /// The publishing session, if the publisher disclosed itself.
    pub publisher: Option<Id>,
    /// The raw EVENT details.
    pub details: Dictionary,
}

/// An event received on a subscription, passed to each of its handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: EventDetails,
}

impl ReceivedEvent {
    pub(crate) fn new(
        subscription: Id,
        publication: Id,
        topic: Uri,
        details: Dictionary,
        arguments: List,
        arguments_keyword: Dictionary,
    ) -> Self {
        Self {
            arguments,
            arguments_keyword,
            details: EventDetails {
                subscription,
                publication,
                topic: uri_detail(&details, "topic").unwrap_or(topic),
                publisher: id_detail(&details, "publisher"),
                details,
            },
        }
    }
}

/// A procedure registered by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The registration ID assigned by the router.
    pub id: Id,
    pub procedure: Uri,
}

/// A single local subscription to a topic.
///
/// Several local subscriptions may share one router subscription ID; each keeps its own handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The subscription ID assigned by the router.
    pub id: Id,
    pub topic: Uri,
    pub(crate) key: u64,
}
