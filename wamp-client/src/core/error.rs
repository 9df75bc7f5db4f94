use thiserror::Error;

use crate::core::{
    types::{
        Dictionary,
        List,
        Value,
    },
    uri::Uri,
};

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed.
    #[error("{0}")]
    NotAllowed(String),
    /// Some internal error occurred.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error defined by the WAMP standard.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The peer could not answer an authentication challenge.
    #[error("cannot authenticate: {0}")]
    CannotAuthenticate(String),
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::CannotAuthenticate(_) => "cannot_authenticate",
        }
    }
}

/// An error carried by an ERROR message in reply to a single request.
///
/// Procedure handlers may return this error to control the URI and payload sent back to the
/// caller.
#[derive(Debug, Default, Clone, PartialEq, Error)]
#[error("{error}: {message}")]
pub struct WampError {
    pub error: Uri,
    pub message: String,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

impl WampError {
    /// Creates a new error with no payload.
    pub fn new(error: Uri) -> Self {
        Self {
            error,
            ..Default::default()
        }
    }

    /// Creates a new error with the given positional arguments.
    pub fn with_arguments(error: Uri, arguments: List) -> Self {
        let mut error = Self::new(error);
        error.arguments = arguments;
        error.message = Self::message_from_payload(&error.details, &error.arguments);
        error
    }

    /// Reads a human-readable message out of a received error payload.
    ///
    /// Prefers `details.message`, then a leading string argument.
    pub(crate) fn message_from_payload(details: &Dictionary, arguments: &List) -> String {
        if let Some(Value::String(message)) = details.get("message") {
            return message.clone();
        }
        match arguments.first() {
            Some(Value::String(message)) => message.clone(),
            _ => String::default(),
        }
    }
}

/// An error for an operation on a session that cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session has not completed the handshake, or is already closing.
    #[error("session is not established")]
    NotEstablished,
    /// The session ended before a reply for the request arrived.
    #[error("session lost before the request completed")]
    SessionLost,
    /// The subscription was already removed.
    #[error("subscription was already removed")]
    AlreadyUnsubscribed,
}

impl SessionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotEstablished => "not_established",
            Self::SessionLost => "session_lost",
            Self::AlreadyUnsubscribed => "no_such_subscription",
        }
    }
}

/// An error for a connection operation that conflicts with the connection's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A transport already exists.
    #[error("connection already open (or opening)")]
    AlreadyOpen,
    /// There is neither a transport nor a pending retry.
    #[error("connection already closed")]
    AlreadyClosed,
    /// No transport was configured at all.
    #[error("no transport specified")]
    NoTransports,
    /// The connection task is no longer running.
    #[error("connection task stopped")]
    Stopped,
}
