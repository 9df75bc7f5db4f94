use std::{
    fmt::Display,
    sync::LazyLock,
};

use anyhow::Error;
use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

use crate::core::error::{
    BasicError,
    InteractionError,
    SessionError,
    WampError,
};

/// Error for an invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI: {0}")]
pub struct InvalidUri(String);

/// Validates a URI against the relaxed WAMP URI rules.
///
/// Components may not be empty and may not contain whitespace, `.`, or `#`.
pub fn validate_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([^\s\.#]+\.)*([^\s\.#]+)$").unwrap());
    if !RE.is_match(uri.as_ref()) {
        return Err(InvalidUri(uri.as_ref().to_owned()));
    }
    Ok(())
}

/// A uniform resource identifier, used for realms, procedures, topics, errors, and close reasons.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping validation.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// The error URI that should be reported to a peer for the given error.
    pub fn for_error(error: &Error) -> Self {
        if let Some(error) = error.downcast_ref::<WampError>() {
            return error.error.clone();
        }
        if let Some(error) = error.downcast_ref::<InteractionError>() {
            return Self::from_known(format!("wamp.error.{}", error.uri_component()));
        }
        if let Some(error) = error.downcast_ref::<BasicError>() {
            return Self::from_known(format!("wamp.error.{}", error.uri_component()));
        }
        if let Some(error) = error.downcast_ref::<SessionError>() {
            return Self::from_known(format!("wamp.error.{}", error.uri_component()));
        }
        Self::from_known("wamp.error.runtime_error")
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Uri::try_from(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

#[cfg(test)]
mod uri_test {
    use anyhow::Error;

    use crate::core::{
        error::{
            BasicError,
            InteractionError,
            WampError,
        },
        uri::{
            Uri,
            validate_uri,
        },
    };

    #[test]
    fn validates_relaxed_uris() {
        assert_matches::assert_matches!(validate_uri("com"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com.math.square"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com.myapp.Topic-1"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com..square"), Err(_));
        assert_matches::assert_matches!(validate_uri(".com.math"), Err(_));
        assert_matches::assert_matches!(validate_uri("com.math."), Err(_));
        assert_matches::assert_matches!(validate_uri("com.my app"), Err(_));
        assert_matches::assert_matches!(validate_uri("com.app#"), Err(_));
        assert_matches::assert_matches!(validate_uri(""), Err(_));
    }

    #[test]
    fn fails_deserialization_invalid_uri() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com..topic""#), Err(err) => {
            assert!(err.to_string().contains("expected a URI"));
        });
    }

    #[test]
    fn maps_errors_to_uris() {
        assert_eq!(
            Uri::for_error(&InteractionError::NoSuchRegistration.into()).as_ref(),
            "wamp.error.no_such_registration"
        );
        assert_eq!(
            Uri::for_error(&BasicError::InvalidArgument("bad".to_owned()).into()).as_ref(),
            "wamp.error.invalid_argument"
        );
        assert_eq!(
            Uri::for_error(&WampError::new(Uri::try_from("com.math.overflow").unwrap()).into())
                .as_ref(),
            "com.math.overflow"
        );
        assert_eq!(
            Uri::for_error(&Error::msg("boom")).as_ref(),
            "wamp.error.runtime_error"
        );
    }
}
