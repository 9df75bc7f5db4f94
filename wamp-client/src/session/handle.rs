use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use tokio::sync::{
    mpsc::UnboundedSender,
    oneshot,
};

use crate::{
    core::{
        close::CloseReason,
        error::SessionError,
        id::Id,
        uri::Uri,
    },
    session::{
        handler::{
            EventHandler,
            ProcedureHandler,
        },
        options::RegisterOptions,
        types::{
            PublishedEvent,
            Registration,
            RpcCall,
            RpcResult,
            SessionDetails,
            Subscription,
        },
    },
};

/// A request from a [`SessionHandle`] to its session.
pub(crate) enum SessionCommand {
    Call {
        procedure: Uri,
        rpc_call: RpcCall,
        reply: oneshot::Sender<Result<RpcResult>>,
    },
    Register {
        procedure: Uri,
        options: RegisterOptions,
        handler: Arc<dyn ProcedureHandler>,
        reply: oneshot::Sender<Result<Registration>>,
    },
    Unregister {
        registration: Registration,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topic: Uri,
        handler: Arc<dyn EventHandler>,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        subscription: Subscription,
        reply: oneshot::Sender<Result<()>>,
    },
    Publish {
        topic: Uri,
        event: PublishedEvent,
        reply: oneshot::Sender<Result<Option<Id>>>,
    },
    Leave {
        reason: Uri,
        message: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl SessionCommand {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Publish { .. } => "publish",
            Self::Leave { .. } => "leave",
        }
    }
}

/// A handle to an established WAMP session.
///
/// The handle is cheap to clone. Once the session ends, every operation fails with
/// [`SessionError::SessionLost`]; a reconnected connection hands out a new handle.
#[derive(Clone)]
pub struct SessionHandle {
    details: Arc<SessionDetails>,
    command_tx: UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(details: SessionDetails, command_tx: UnboundedSender<SessionCommand>) -> Self {
        Self {
            details: Arc::new(details),
            command_tx,
        }
    }

    /// The session ID assigned by the router.
    pub fn id(&self) -> Id {
        self.details.session_id
    }

    /// The realm the session joined.
    pub fn realm(&self) -> &Uri {
        &self.details.realm
    }

    /// Details of the session, from the router's WELCOME.
    pub fn details(&self) -> &SessionDetails {
        &self.details
    }

    /// Checks if the session behind this handle has ended.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn request<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| Error::new(SessionError::SessionLost))?;
        reply_rx
            .await
            .map_err(|_| Error::new(SessionError::SessionLost))?
    }

    /// Calls a procedure and waits for its result.
    ///
    /// An ERROR reply is returned as a [`WampError`][`crate::core::error::WampError`].
    pub async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<RpcResult> {
        self.request(|reply| SessionCommand::Call {
            procedure,
            rpc_call,
            reply,
        })
        .await
    }

    /// Registers a procedure.
    ///
    /// The handler is never invoked before the router acknowledges the registration.
    pub async fn register<H>(
        &self,
        procedure: Uri,
        options: RegisterOptions,
        handler: H,
    ) -> Result<Registration>
    where
        H: ProcedureHandler + 'static,
    {
        self.request(|reply| SessionCommand::Register {
            procedure,
            options,
            handler: Arc::new(handler),
            reply,
        })
        .await
    }

    /// Unregisters a procedure.
    pub async fn unregister(&self, registration: &Registration) -> Result<()> {
        self.request(|reply| SessionCommand::Unregister {
            registration: registration.clone(),
            reply,
        })
        .await
    }

    /// Subscribes to a topic.
    ///
    /// Each call adds its own handler, even if the session is already subscribed to the topic.
    pub async fn subscribe<H>(&self, topic: Uri, handler: H) -> Result<Subscription>
    where
        H: EventHandler + 'static,
    {
        self.request(|reply| SessionCommand::Subscribe {
            topic,
            handler: Arc::new(handler),
            reply,
        })
        .await
    }

    /// Removes the handler added by a single call to [`SessionHandle::subscribe`].
    ///
    /// The router is only told to unsubscribe once the last handler for the subscription is
    /// removed.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.request(|reply| SessionCommand::Unsubscribe {
            subscription: subscription.clone(),
            reply,
        })
        .await
    }

    /// Publishes an event to a topic.
    ///
    /// Returns the publication ID if the publication was acknowledged.
    pub async fn publish(&self, topic: Uri, event: PublishedEvent) -> Result<Option<Id>> {
        self.request(|reply| SessionCommand::Publish {
            topic,
            event,
            reply,
        })
        .await
    }

    /// Leaves the realm gracefully.
    ///
    /// Leaving does not trigger reconnection.
    pub async fn leave(&self, reason: Option<Uri>, message: Option<String>) -> Result<()> {
        self.request(|reply| SessionCommand::Leave {
            reason: reason.unwrap_or_else(|| CloseReason::Normal.uri()),
            message: message.unwrap_or_default(),
            reply,
        })
        .await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.details.session_id)
            .field("realm", &self.details.realm)
            .finish()
    }
}
