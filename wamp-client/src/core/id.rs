use std::fmt::Display;

use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

/// An integer ID, used for identification of sessions, requests, registrations, subscriptions,
/// and publications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    /// The minimum allowable value of an ID.
    pub const MIN: Id = Id(1);

    /// The maximum allowable value of an ID.
    pub const MAX: Id = Id(1 << 53);

    /// The raw integer value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::MIN
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Error for an ID being out of range.
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < Self::MIN.0 || value > Self::MAX.0 {
            Err(IdOutOfRange { value })
        } else {
            Ok(Id(value))
        }
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match u64::try_from(v) {
            Ok(v) => self.visit_u64(v),
            Err(_) => Err(E::invalid_value(Unexpected::Signed(v), &self)),
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// Generates request IDs sequentially.
///
/// Request IDs are scoped to a single session, so each session owns its own allocator. IDs start
/// at [`Id::MIN`] and are never handed out twice before the range is exhausted.
#[derive(Debug, Default)]
pub struct SequentialIdAllocator {
    next: u64,
}

impl SequentialIdAllocator {
    /// Generates a new ID.
    pub fn generate_id(&mut self) -> Id {
        self.next = if self.next >= Id::MAX.0 {
            Id::MIN.0
        } else {
            self.next + 1
        };
        Id(self.next)
    }
}

#[cfg(test)]
mod id_test {
    use crate::core::id::{
        Id,
        SequentialIdAllocator,
    };

    #[test]
    fn fails_deserialization_out_of_range() {
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"0"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"9007199254740993"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"-1"#), Err(_));
    }

    #[test]
    fn allocates_monotonically_from_minimum() {
        let mut allocator = SequentialIdAllocator::default();
        let ids = (0..5).map(|_| allocator.generate_id()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            (1..=5)
                .map(|id| Id::try_from(id).unwrap())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn wraps_after_maximum() {
        let mut allocator = SequentialIdAllocator {
            next: Id::MAX.value() - 1,
        };
        assert_eq!(allocator.generate_id(), Id::MAX);
        assert_eq!(allocator.generate_id(), Id::MIN);
    }
}
