use std::{
    fmt::Debug,
    sync::Arc,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};

use crate::{
    message::message::Message,
    transport::{
        registry::TransportRegistry,
        transport::{
            Transport,
            TransportCloseDetails,
            TransportConfig,
            TransportEvent,
            TransportFactory,
            TransportInfo,
        },
    },
};

const TRANSPORT_TYPE: &str = "direct";
const PROTOCOL: &str = "direct";

/// A frame exchanged over a [`DirectStream`].
#[derive(Debug)]
pub enum DirectFrame {
    /// A WAMP message, passed without serialization.
    Message(Message),
    /// The sender is closing the stream.
    Close { code: u16, reason: String },
}

/// One end of an in-process, bidirectional message stream.
#[derive(Debug)]
pub struct DirectStream {
    pub tx: UnboundedSender<DirectFrame>,
    pub rx: UnboundedReceiver<DirectFrame>,
}

/// Creates two connected ends of an in-process stream.
pub fn direct_stream_pair() -> (DirectStream, DirectStream) {
    let (a_tx, b_rx) = unbounded_channel();
    let (b_tx, a_rx) = unbounded_channel();
    (
        DirectStream { tx: a_tx, rx: a_rx },
        DirectStream { tx: b_tx, rx: b_rx },
    )
}

/// Something that accepts direct connections, such as an in-process router.
#[async_trait]
pub trait DirectConnector: Send + Sync + Debug {
    /// Connects to the peer at the given URL.
    ///
    /// Failing here is treated as the peer being unreachable.
    async fn connect(&self, url: &str) -> Result<DirectStream>;
}

/// A transport that exchanges messages with an in-process peer.
#[derive(Debug)]
pub struct DirectTransport {
    info: TransportInfo,
    connector: Option<Arc<dyn DirectConnector>>,
    stream: Option<DirectStream>,
    local_close: Option<u16>,
    finished: bool,
}

impl DirectTransport {
    fn finish(&mut self, details: TransportCloseDetails) -> TransportEvent {
        self.finished = true;
        self.stream = None;
        TransportEvent::Close(details)
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn send(&mut self, message: Message) -> Result<()> {
        match &self.stream {
            Some(stream) if self.local_close.is_none() => stream
                .tx
                .send(DirectFrame::Message(message))
                .map_err(|_| Error::msg("direct stream is closed")),
            _ => Err(Error::msg("direct transport is not open")),
        }
    }

    fn close(&mut self, code: u16) {
        if self.finished || self.local_close.is_some() {
            return;
        }
        self.local_close = Some(code);
        self.connector = None;
        if let Some(stream) = &self.stream {
            stream
                .tx
                .send(DirectFrame::Close {
                    code,
                    reason: String::new(),
                })
                .ok();
        }
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.finished {
            return TransportEvent::Close(TransportCloseDetails::abnormal("transport finished"));
        }
        if let Some(code) = self.local_close {
            return self.finish(TransportCloseDetails::with_code(code, ""));
        }

        if self.stream.is_none() {
            // The connector stays in place until the connection succeeds, so a cancelled attempt
            // is simply retried.
            let connector = match &self.connector {
                Some(connector) => connector.clone(),
                None => return self.finish(TransportCloseDetails::abnormal("no connector")),
            };
            let url = self.info.url.clone().unwrap_or_default();
            return match connector.connect(&url).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.connector = None;
                    self.info.protocol = Some(PROTOCOL.to_owned());
                    TransportEvent::Open
                }
                Err(err) => self.finish(TransportCloseDetails::abnormal(err.to_string())),
            };
        }

        let frame = match &mut self.stream {
            Some(stream) => stream.rx.recv().await,
            None => None,
        };
        match frame {
            Some(DirectFrame::Message(message)) => TransportEvent::Message(message),
            Some(DirectFrame::Close { code, reason }) => {
                self.finish(TransportCloseDetails::with_code(code, reason))
            }
            None => self.finish(TransportCloseDetails::abnormal("direct stream dropped")),
        }
    }
}

/// A factory for [`DirectTransport`].
#[derive(Debug)]
pub struct DirectTransportFactory {
    connector: Arc<dyn DirectConnector>,
    url: String,
}

impl DirectTransportFactory {
    /// Validates the transport entry and creates a new factory.
    pub fn new(connector: Arc<dyn DirectConnector>, config: &TransportConfig) -> Result<Self> {
        let url = match &config.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => return Err(Error::msg("direct transport requires a url")),
        };
        Ok(Self { connector, url })
    }
}

impl TransportFactory for DirectTransportFactory {
    fn transport_type(&self) -> &str {
        TRANSPORT_TYPE
    }

    fn create(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(DirectTransport {
            info: TransportInfo {
                transport_type: TRANSPORT_TYPE.to_owned(),
                url: Some(self.url.clone()),
                protocol: None,
            },
            connector: Some(self.connector.clone()),
            stream: None,
            local_close: None,
            finished: false,
        }))
    }
}

/// Registers the `direct` transport type, backed by the given connector.
pub fn register_direct_transport(
    registry: &mut TransportRegistry,
    connector: Arc<dyn DirectConnector>,
) {
    registry.register(TRANSPORT_TYPE, move |config| {
        Ok(Box::new(DirectTransportFactory::new(
            connector.clone(),
            config,
        )?))
    });
}
