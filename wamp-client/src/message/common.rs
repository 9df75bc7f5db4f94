use anyhow::Error;

use crate::{
    core::{
        close::CloseReason,
        error::WampError,
        id::Id,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

fn message_details(message: &str) -> Dictionary {
    if message.is_empty() {
        Dictionary::default()
    } else {
        Dictionary::from_iter([("message".to_owned(), Value::String(message.to_owned()))])
    }
}

pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: message_details(&error.to_string()),
        reason: Uri::for_error(error),
        ..Default::default()
    })
}

pub fn goodbye_with_reason(reason: Uri, message: &str) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: message_details(message),
        reason,
    })
}

pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    goodbye_with_reason(close_reason.uri(), "")
}

pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// Builds the ERROR reply for a request that failed on this side.
///
/// A [`WampError`] keeps its own URI and payload. Any other error is reported with the URI from
/// [`Uri::for_error`] and its text as the only argument.
pub fn error_for_request(request_type: u64, request: Id, error: &Error) -> Message {
    match error.downcast_ref::<WampError>() {
        Some(error) => Message::Error(ErrorMessage {
            request_type,
            request,
            details: error.details.clone(),
            error: error.error.clone(),
            arguments: error.arguments.clone(),
            arguments_keyword: error.arguments_keyword.clone(),
        }),
        None => Message::Error(ErrorMessage {
            request_type,
            request,
            details: Dictionary::default(),
            error: Uri::for_error(error),
            arguments: Vec::from_iter([Value::String(error.to_string())]),
            arguments_keyword: Dictionary::default(),
        }),
    }
}
