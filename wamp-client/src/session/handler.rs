use std::{
    fmt::Debug,
    future::Future,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::types::Dictionary,
    session::types::{
        Invocation,
        ReceivedEvent,
        RpcYield,
    },
};

/// A handler for invocations of a registered procedure.
///
/// Returning an error sends an ERROR reply to the caller. A [`WampError`][`crate::core::error::WampError`]
/// controls the reported URI and payload; any other error is reported as
/// `wamp.error.runtime_error`.
#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield>;
}

#[async_trait]
impl<F, Fut> ProcedureHandler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RpcYield>> + Send + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield> {
        self(invocation).await
    }
}

/// A handler for events received on a subscription.
///
/// Handlers run on the connection task, in the order they were subscribed, so they should not
/// block. Errors are logged and do not affect other handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ReceivedEvent) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&ReceivedEvent) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &ReceivedEvent) -> Result<()> {
        self(event)
    }
}

/// Computes the signature for an authentication challenge sent by the router.
#[async_trait]
pub trait ChallengeHandler: Send + Sync + Debug {
    async fn challenge(&self, method: &str, extra: &Dictionary) -> Result<String>;
}

/// Answers `ticket` challenges with a fixed ticket.
#[derive(Debug, Clone)]
pub struct TicketChallengeHandler {
    ticket: String,
}

impl TicketChallengeHandler {
    pub fn new<S>(ticket: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            ticket: ticket.into(),
        }
    }
}

#[async_trait]
impl ChallengeHandler for TicketChallengeHandler {
    async fn challenge(&self, method: &str, _: &Dictionary) -> Result<String> {
        match method {
            "ticket" => Ok(self.ticket.clone()),
            _ => Err(anyhow::Error::msg(format!(
                "unsupported authentication method: {method}"
            ))),
        }
    }
}
