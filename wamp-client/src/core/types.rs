use serde::{
    Deserialize,
    Serialize,
};

use crate::core::hash::HashMap;

pub type Integer = u64;

pub type SignedInteger = i64;

pub type Dictionary = HashMap<String, Value>;

pub type List = Vec<Value>;

/// A single value carried in WAMP arguments, keyword arguments, and detail dictionaries.
///
/// Non-negative integers are always read as [`Value::Integer`], and only negative ones as
/// [`Value::SignedInteger`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(Integer),
    SignedInteger(SignedInteger),
    Float(f64),
    String(String),
    Bool(bool),
    Dictionary(Dictionary),
    List(List),
}

impl Value {
    pub fn integer(&self) -> Option<Integer> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// The value as a signed integer, if it fits.
    pub fn signed_integer(&self) -> Option<SignedInteger> {
        match self {
            Self::SignedInteger(value) => Some(*value),
            Self::Integer(value) => SignedInteger::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            Self::SignedInteger(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn dictionary(&self) -> Option<&Dictionary> {
        match self {
            Self::Dictionary(value) => Some(value),
            _ => None,
        }
    }

    pub fn list(&self) -> Option<&List> {
        match self {
            Self::List(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Integer> for Value {
    fn from(value: Integer) -> Self {
        Self::Integer(value)
    }
}

impl From<SignedInteger> for Value {
    fn from(value: SignedInteger) -> Self {
        match Integer::try_from(value) {
            Ok(value) => Self::Integer(value),
            Err(_) => Self::SignedInteger(value),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Dictionary> for Value {
    fn from(value: Dictionary) -> Self {
        Self::Dictionary(value)
    }
}

impl From<List> for Value {
    fn from(value: List) -> Self {
        Self::List(value)
    }
}

#[cfg(test)]
mod types_test {
    use crate::core::types::{
        Dictionary,
        Value,
    };

    #[test]
    fn keeps_negative_integers_distinct_from_floats() {
        let value = serde_json::from_str::<Value>("-3").unwrap();
        assert_eq!(value, Value::SignedInteger(-3));
        assert_eq!(value.signed_integer(), Some(-3));
        assert_eq!(value.integer(), None);
        assert_eq!(serde_json::to_string(&value).unwrap(), "-3");
        assert_eq!(
            rmp_serde::from_slice::<Value>(&rmp_serde::to_vec(&value).unwrap()).unwrap(),
            Value::SignedInteger(-3)
        );

        assert_matches::assert_matches!(serde_json::from_str::<Value>("1.5"), Ok(Value::Float(value)) => {
            assert_eq!(value, 1.5);
        });
        assert_matches::assert_matches!(serde_json::from_str::<Value>("529"), Ok(Value::Integer(529)));
        assert_eq!(Value::from(7_i64), Value::Integer(7));
        assert_eq!(Value::from(-7_i64), Value::SignedInteger(-7));
        assert_eq!(Value::Integer(7).signed_integer(), Some(7));
    }

    #[test]
    fn reads_nested_values() {
        let value = serde_json::from_str::<Value>(r#"{"caller": 12, "tags": ["a", true]}"#).unwrap();
        let dictionary = value.dictionary().unwrap();
        assert_eq!(dictionary.get("caller").and_then(Value::integer), Some(12));
        assert_eq!(
            dictionary.get("tags").and_then(Value::list).map(|list| list.len()),
            Some(2)
        );
        assert_eq!(Value::from(Dictionary::default()).list(), None);
    }
}
