use crate::core::types::{
    Dictionary,
    Value,
};

/// A role a client peer can take on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl PeerRole {
    /// All client roles.
    pub const ALL: [PeerRole; 4] = [
        PeerRole::Caller,
        PeerRole::Callee,
        PeerRole::Publisher,
        PeerRole::Subscriber,
    ];

    /// Advanced-profile features announced for the role.
    fn features(&self) -> &'static [&'static str] {
        match self {
            Self::Caller => &["caller_identification"],
            Self::Callee => &["caller_identification"],
            Self::Publisher => &["publisher_identification", "publisher_exclusion"],
            Self::Subscriber => &["publisher_identification"],
        }
    }
}

impl From<PeerRole> for &'static str {
    fn from(value: PeerRole) -> Self {
        match value {
            PeerRole::Caller => "caller",
            PeerRole::Callee => "callee",
            PeerRole::Publisher => "publisher",
            PeerRole::Subscriber => "subscriber",
        }
    }
}

/// Builds the `roles` dictionary announced in HELLO.
pub fn roles_dictionary<I>(roles: I) -> Dictionary
where
    I: IntoIterator<Item = PeerRole>,
{
    roles
        .into_iter()
        .map(|role| {
            let features = role
                .features()
                .iter()
                .map(|feature| ((*feature).to_owned(), Value::Bool(true)))
                .collect::<Dictionary>();
            let name: &'static str = role.into();
            (
                name.to_owned(),
                Value::Dictionary(Dictionary::from_iter([(
                    "features".to_owned(),
                    Value::Dictionary(features),
                )])),
            )
        })
        .collect()
}

#[cfg(test)]
mod roles_test {
    use crate::core::{
        roles::{
            PeerRole,
            roles_dictionary,
        },
        types::Value,
    };

    #[test]
    fn announces_caller_identification() {
        let roles = roles_dictionary(PeerRole::ALL);
        assert_eq!(roles.len(), 4);
        let callee_features = roles
            .get("callee")
            .and_then(Value::dictionary)
            .and_then(|callee| callee.get("features"))
            .and_then(Value::dictionary)
            .unwrap();
        assert_eq!(
            callee_features.get("caller_identification"),
            Some(&Value::Bool(true))
        );
    }
}
