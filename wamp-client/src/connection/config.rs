use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use serde::Deserialize;

use crate::{
    core::{
        error::ConnectionError,
        uri::Uri,
    },
    session::handler::ChallengeHandler,
    transport::transport::TransportConfig,
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// The longest accepted delay or timeout, one year.
const MAX_SECONDS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// The maximum number of reconnection attempts after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum MaxRetries {
    /// Retries forever, unless the application stops it.
    Unlimited,
    /// Retries at most this many times in a row.
    Limited(u32),
}

impl MaxRetries {
    /// Checks if the given attempt, counting from 1, may be made.
    pub fn allows(&self, attempt: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) => attempt <= *max,
        }
    }
}

impl Default for MaxRetries {
    fn default() -> Self {
        Self::Limited(15)
    }
}

impl TryFrom<i64> for MaxRetries {
    type Error = Error;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unlimited),
            0.. => Ok(Self::Limited(u32::try_from(value)?)),
            _ => Err(Error::msg(format!(
                "max_retries must be -1 or non-negative, got {value}"
            ))),
        }
    }
}

/// Configuration for a [`Connection`][`crate::connection::connection::Connection`].
///
/// Deserializes from the usual option names. Unknown options are ignored, and every option has a
/// default. Delays are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default URL for transport entries that do not name one.
    pub url: Option<String>,
    /// The realm to join.
    pub realm: String,
    /// Transport entries, tried in order.
    ///
    /// If empty, a single `websocket` entry for [`Self::url`] is used.
    pub transports: Vec<TransportConfig>,
    /// Default sub-protocols for transport entries that do not name any.
    pub protocols: Option<Vec<String>>,
    /// Authentication methods announced in HELLO.
    pub authmethods: Vec<String>,
    /// Authentication ID announced in HELLO.
    pub authid: Option<String>,
    /// Agent announced in HELLO.
    pub agent: Option<String>,
    /// Retry when the router was never reached.
    pub retry_if_unreachable: bool,
    pub max_retries: MaxRetries,
    pub initial_retry_delay: f64,
    pub max_retry_delay: f64,
    /// Multiplier applied to the retry delay after every attempt.
    pub retry_delay_growth: f64,
    /// Standard deviation of the retry delay, as a fraction of the delay.
    pub retry_delay_jitter: f64,
    /// How long to wait for the router to answer GOODBYE.
    pub leave_timeout: f64,
    /// Answers authentication challenges from the router.
    #[serde(skip)]
    pub challenge_handler: Option<Arc<dyn ChallengeHandler>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            realm: String::default(),
            transports: Vec::default(),
            protocols: None,
            authmethods: Vec::default(),
            authid: None,
            agent: Some(DEFAULT_AGENT.to_owned()),
            retry_if_unreachable: true,
            max_retries: MaxRetries::default(),
            initial_retry_delay: 1.5,
            max_retry_delay: 300.0,
            retry_delay_growth: 1.5,
            retry_delay_jitter: 0.1,
            leave_timeout: 5.0,
            challenge_handler: None,
        }
    }
}

impl ConnectionConfig {
    fn validate_seconds(name: &str, value: f64) -> Result<()> {
        if !(0.0..=MAX_SECONDS).contains(&value) {
            return Err(Error::msg(format!(
                "{name} must be between 0 and {MAX_SECONDS} seconds, got {value}"
            )));
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<Uri> {
        let realm = Uri::try_from(self.realm.as_str())
            .map_err(|err| Error::new(err).context("invalid realm"))?;
        Self::validate_seconds("initial_retry_delay", self.initial_retry_delay)?;
        Self::validate_seconds("max_retry_delay", self.max_retry_delay)?;
        Self::validate_seconds("leave_timeout", self.leave_timeout)?;
        if !self.retry_delay_growth.is_finite() || self.retry_delay_growth <= 0.0 {
            return Err(Error::msg("retry_delay_growth must be positive"));
        }
        if !self.retry_delay_jitter.is_finite() || self.retry_delay_jitter < 0.0 {
            return Err(Error::msg("retry_delay_jitter must be non-negative"));
        }
        Ok(realm)
    }

    pub(crate) fn leave_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.leave_timeout.min(MAX_SECONDS)).unwrap_or_default()
    }

    /// The transport entries to build factories from, with top-level defaults applied.
    pub(crate) fn transport_entries(&self) -> Result<Vec<TransportConfig>> {
        let mut entries = self.transports.clone();
        if entries.is_empty() {
            match &self.url {
                Some(url) => entries.push(TransportConfig::new("websocket", url.clone())),
                None => return Err(ConnectionError::NoTransports.into()),
            }
        }
        for entry in &mut entries {
            if entry.url.is_none() {
                entry.url = self.url.clone();
            }
            if entry.protocols.is_none() {
                entry.protocols = self.protocols.clone();
            }
        }
        Ok(entries)
    }
}
