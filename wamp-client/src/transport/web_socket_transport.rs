use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    warn,
};
use tokio::{
    net::TcpStream,
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
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    connect_async,
    tungstenite::{
        ClientRequestBuilder,
        Message as WebSocketMessage,
        http::header::SEC_WEBSOCKET_PROTOCOL,
        protocol::{
            CloseFrame,
            frame::coding::CloseCode,
        },
    },
};

use crate::{
    core::close::close_code,
    message::message::Message,
    serializer::serializer::{
        Serializer,
        SerializerType,
        new_serializer,
    },
    transport::transport::{
        Transport,
        TransportCloseDetails,
        TransportConfig,
        TransportEvent,
        TransportFactory,
        TransportInfo,
    },
};

const TRANSPORT_TYPE: &str = "websocket";

/// How long to wait for the peer to answer a close frame sent by this side.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Validated options for WebSocket transports.
#[derive(Debug, Clone)]
struct WebSocketOptions {
    url: String,
    protocols: Vec<SerializerType>,
    headers: Vec<(String, String)>,
}

impl WebSocketOptions {
    fn new(config: &TransportConfig) -> Result<Self> {
        let url = match &config.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => return Err(Error::msg("websocket transport requires a url")),
        };
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::msg(format!(
                "websocket url must use the ws or wss scheme: {url}"
            )));
        }
        let protocols = match &config.protocols {
            Some(protocols) if !protocols.is_empty() => protocols
                .iter()
                .map(|protocol| SerializerType::try_from(protocol.as_str()))
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::from_iter([SerializerType::Json]),
        };
        let headers = config.string_map_option("headers")?;
        Ok(Self {
            url,
            protocols,
            headers,
        })
    }
}

enum Command {
    Send(Message),
    Close(u16),
}

/// A transport over a WebSocket connection.
///
/// The socket is driven by a background task, which reports events over a channel.
#[derive(Debug)]
pub struct WebSocketTransport {
    info: TransportInfo,
    command_tx: UnboundedSender<Command>,
    event_rx: UnboundedReceiver<TransportEvent>,
    protocol_rx: oneshot::Receiver<String>,
    finished: bool,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send(message) => write!(f, "Send({})", message.message_name()),
            Self::Close(code) => write!(f, "Close({code})"),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn send(&mut self, message: Message) -> Result<()> {
        self.command_tx
            .send(Command::Send(message))
            .map_err(|_| Error::msg("websocket transport is closed"))
    }

    fn close(&mut self, code: u16) {
        self.command_tx.send(Command::Close(code)).ok();
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.finished {
            return TransportEvent::Close(TransportCloseDetails::abnormal("transport finished"));
        }
        let event = match self.event_rx.recv().await {
            Some(event) => event,
            None => TransportEvent::Close(TransportCloseDetails::abnormal(
                "websocket task stopped unexpectedly",
            )),
        };
        match &event {
            TransportEvent::Open => {
                // The task reports the negotiated protocol before opening.
                if let Ok(protocol) = self.protocol_rx.try_recv() {
                    self.info.protocol = Some(protocol);
                }
            }
            TransportEvent::Close(_) => self.finished = true,
            TransportEvent::Message(_) => (),
        }
        event
    }
}

struct WebSocketTask {
    options: WebSocketOptions,
    command_rx: UnboundedReceiver<Command>,
    event_tx: UnboundedSender<TransportEvent>,
    protocol_tx: oneshot::Sender<String>,
}

impl WebSocketTask {
    async fn run(self) {
        let Self {
            options,
            mut command_rx,
            event_tx,
            protocol_tx,
        } = self;
        let (mut stream, serializer_type) = match Self::connect(&options).await {
            Ok(connection) => connection,
            Err(err) => {
                debug!("Failed to connect to {}: {err:#}", options.url);
                event_tx
                    .send(TransportEvent::Close(TransportCloseDetails::abnormal(
                        err.to_string(),
                    )))
                    .ok();
                return;
            }
        };
        protocol_tx
            .send(serializer_type.protocol().to_owned())
            .ok();
        event_tx.send(TransportEvent::Open).ok();

        let serializer = new_serializer(serializer_type);
        let details = Self::message_loop(
            &mut stream,
            serializer.as_ref(),
            serializer_type,
            &mut command_rx,
            &event_tx,
        )
        .await;
        event_tx.send(TransportEvent::Close(details)).ok();
    }

    async fn connect(
        options: &WebSocketOptions,
    ) -> Result<(WebSocketStream<MaybeTlsStream<TcpStream>>, SerializerType)> {
        let mut request = ClientRequestBuilder::new(options.url.as_str().try_into()?);
        for protocol in &options.protocols {
            request = request.with_sub_protocol(protocol.protocol().to_owned());
        }
        for (key, value) in &options.headers {
            request = request.with_header(key, value);
        }

        let (stream, response) = connect_async(request).await?;
        let serializer_type = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => SerializerType::try_from(protocol.to_str()?)?,
            None => return Err(Error::msg("handshake did not produce a sub-protocol")),
        };
        Ok((stream, serializer_type))
    }

    async fn message_loop(
        stream: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
        serializer: &dyn Serializer,
        serializer_type: SerializerType,
        command_rx: &mut UnboundedReceiver<Command>,
        event_tx: &UnboundedSender<TransportEvent>,
    ) -> TransportCloseDetails {
        let mut local_close = None;
        let mut close_deadline = None;
        loop {
            tokio::select! {
                _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                    debug!("Peer did not complete the websocket close handshake in time");
                    return TransportCloseDetails::with_code(
                        local_close.unwrap_or(close_code::NORMAL),
                        "close handshake timed out",
                    );
                }
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => return TransportCloseDetails::abnormal(err.to_string()),
                        None => {
                            return match local_close {
                                Some(code) => TransportCloseDetails::with_code(code, ""),
                                None => TransportCloseDetails::abnormal("connection closed without a close frame"),
                            };
                        }
                    };
                    if frame.is_text() || frame.is_binary() {
                        match serializer.deserialize(&frame.into_data()) {
                            Ok(message) => {
                                event_tx.send(TransportEvent::Message(message)).ok();
                            }
                            Err(err) => {
                                warn!("Dropping websocket connection after undecodable message: {err:#}");
                                stream.close(Some(CloseFrame {
                                    code: CloseCode::Protocol,
                                    reason: "undecodable message".into(),
                                })).await.ok();
                                return TransportCloseDetails::with_code(close_code::PROTOCOL_ERROR, err.to_string());
                            }
                        }
                    } else if frame.is_ping() {
                        // tungstenite queues the pong; flushing sends it out.
                        stream.flush().await.ok();
                    } else if let WebSocketMessage::Close(close_frame) = frame {
                        // Complete the close handshake before reporting.
                        stream.close(None).await.ok();
                        return match (local_close, close_frame) {
                            (Some(code), _) => TransportCloseDetails::with_code(code, ""),
                            (None, Some(close_frame)) => TransportCloseDetails::with_code(close_frame.code.into(), close_frame.reason.as_str()),
                            (None, None) => TransportCloseDetails::with_code(close_code::NORMAL, ""),
                        };
                    }
                }
                command = command_rx.recv(), if local_close.is_none() => {
                    match command {
                        Some(Command::Send(message)) => {
                            let data = match serializer.serialize(&message) {
                                Ok(data) => data,
                                Err(err) => {
                                    warn!("Failed to serialize {} message: {err:#}", message.message_name());
                                    continue;
                                }
                            };
                            let frame = if serializer_type.is_binary() {
                                WebSocketMessage::Binary(data.into())
                            } else {
                                match String::from_utf8(data) {
                                    Ok(text) => WebSocketMessage::Text(text.into()),
                                    Err(err) => {
                                        warn!("Serialized message is not valid text: {err}");
                                        continue;
                                    }
                                }
                            };
                            if let Err(err) = stream.send(frame).await {
                                return TransportCloseDetails::abnormal(err.to_string());
                            }
                        }
                        Some(Command::Close(code)) => {
                            local_close = Some(code);
                            close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                            if let Err(err) = stream.close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            })).await {
                                debug!("Failed to send websocket close frame: {err}");
                                return TransportCloseDetails::with_code(code, "");
                            }
                        }
                        None => {
                            // The transport was dropped, so nobody is listening for events.
                            stream.close(None).await.ok();
                            return TransportCloseDetails::with_code(close_code::GOING_AWAY, "");
                        }
                    }
                }
            }
        }
    }
}

/// A factory for [`WebSocketTransport`].
#[derive(Debug)]
pub struct WebSocketTransportFactory {
    options: WebSocketOptions,
}

impl WebSocketTransportFactory {
    /// Validates the transport entry and creates a new factory.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            options: WebSocketOptions::new(config)?,
        })
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn transport_type(&self) -> &str {
        TRANSPORT_TYPE
    }

    fn create(&self) -> Result<Box<dyn Transport>> {
        let (command_tx, command_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        let (protocol_tx, protocol_rx) = oneshot::channel();
        let task = WebSocketTask {
            options: self.options.clone(),
            command_rx,
            event_tx,
            protocol_tx,
        };
        tokio::runtime::Handle::try_current()
            .map_err(|err| Error::new(err).context("websocket transport requires a tokio runtime"))?
            .spawn(task.run());
        Ok(Box::new(WebSocketTransport {
            info: TransportInfo {
                transport_type: TRANSPORT_TYPE.to_owned(),
                url: Some(self.options.url.clone()),
                protocol: None,
            },
            command_tx,
            event_rx,
            protocol_rx,
            finished: false,
        }))
    }
}
