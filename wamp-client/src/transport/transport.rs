use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    core::{
        close::close_code,
        types::{
            Dictionary,
            Value,
        },
    },
    message::message::Message,
};

/// Static metadata describing a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// The transport type name, as registered in the [`TransportRegistry`][`crate::transport::registry::TransportRegistry`].
    pub transport_type: String,
    /// The URL the transport connects to.
    pub url: Option<String>,
    /// The negotiated sub-protocol, once known.
    pub protocol: Option<String>,
}

impl TransportInfo {
    /// Metadata reported when no transport exists.
    pub fn none() -> Self {
        Self {
            transport_type: "none".to_owned(),
            url: None,
            protocol: None,
        }
    }
}

/// Details for a transport closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCloseDetails {
    /// WebSocket-style close code.
    pub code: u16,
    /// Human-readable close reason.
    pub reason: String,
    /// Whether the transport closed normally.
    pub was_clean: bool,
}

impl TransportCloseDetails {
    /// Details for a transport that closed with the given code.
    ///
    /// Only [`close_code::NORMAL`] is considered clean.
    pub fn with_code<S>(code: u16, reason: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            code,
            reason: reason.into(),
            was_clean: code == close_code::NORMAL,
        }
    }

    /// Details for a transport that failed or was lost without a close handshake.
    pub fn abnormal<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Self::with_code(close_code::ABNORMAL, reason)
    }
}

/// An event reported by a [`Transport`].
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is open and messages may be exchanged.
    Open,
    /// A WAMP message was received.
    Message(Message),
    /// The transport closed.
    ///
    /// This is the final event of every transport, whether or not it ever opened.
    Close(TransportCloseDetails),
}

/// A transport, over which WAMP messages can be sent and received.
///
/// A transport starts connecting as soon as it is created. Its events are consumed through
/// [`Transport::next_event`], which must be cancel-safe, since it is polled alongside timers and
/// application commands.
#[async_trait]
pub trait Transport: Send + Debug {
    /// Static metadata for the transport.
    fn info(&self) -> &TransportInfo;

    /// Queues a message for sending.
    fn send(&mut self, message: Message) -> Result<()>;

    /// Starts closing the transport with the given close code.
    ///
    /// The transport reports [`TransportEvent::Close`] once the close completes.
    fn close(&mut self, code: u16);

    /// Waits for the next transport event.
    async fn next_event(&mut self) -> TransportEvent;
}

/// A factory for creating a new [`Transport`], built once from a [`TransportConfig`].
pub trait TransportFactory: Send + Sync + Debug {
    /// The transport type name.
    fn transport_type(&self) -> &str;

    /// Creates a new transport.
    ///
    /// Fails only when the transport cannot be constructed at all. Failing to reach the peer is
    /// reported later as [`TransportEvent::Close`].
    fn create(&self) -> Result<Box<dyn Transport>>;
}

/// Configuration for a single transport entry.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// The transport type name.
    #[serde(rename = "type")]
    pub transport_type: String,
    /// The URL to connect to.
    pub url: Option<String>,
    /// Sub-protocols to offer.
    pub protocols: Option<Vec<String>>,
    /// Type-specific options.
    #[serde(flatten)]
    pub options: Dictionary,
}

impl TransportConfig {
    /// Creates a configuration for the given transport type and URL.
    pub fn new<T, U>(transport_type: T, url: U) -> Self
    where
        T: Into<String>,
        U: Into<String>,
    {
        Self {
            transport_type: transport_type.into(),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Reads a type-specific string-to-string option, such as extra headers.
    pub fn string_map_option(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.options.get(key) {
            None => Ok(Vec::default()),
            Some(Value::Dictionary(values)) => values
                .iter()
                .map(|(key, value)| match value {
                    Value::String(value) => Ok((key.clone(), value.clone())),
                    _ => Err(anyhow::Error::msg(format!("option {key} must be a string"))),
                })
                .collect(),
            Some(_) => Err(anyhow::Error::msg(format!(
                "transport option {key} must be a dictionary"
            ))),
        }
    }
}
