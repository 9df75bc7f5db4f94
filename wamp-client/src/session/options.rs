use std::time::Duration;

use crate::core::{
    id::Id,
    invocation_policy::InvocationPolicy,
    types::{
        Dictionary,
        List,
        Value,
    },
};

/// Options for calling a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// Asks the router to reveal this session to the callee.
    pub disclose_me: bool,
    /// Asks the router to cancel the call if the callee does not reply in time.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub(crate) fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }
        if let Some(timeout) = self.timeout {
            options.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }
        options
    }
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Asks the router to reveal callers to this callee.
    pub disclose_caller: bool,
    /// How the router selects among several callees of the same procedure.
    pub invoke: Option<InvocationPolicy>,
}

impl RegisterOptions {
    pub(crate) fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.disclose_caller {
            options.insert("disclose_caller".to_owned(), Value::Bool(true));
        }
        if let Some(invoke) = self.invoke {
            let invoke: &'static str = invoke.into();
            options.insert("invoke".to_owned(), Value::String(invoke.to_owned()));
        }
        options
    }
}

/// Options for publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Waits for the router to acknowledge the publication.
    pub acknowledge: bool,
    /// Should the publisher be excluded from receiving the event?
    pub exclude_me: bool,
    /// Asks the router to reveal this session to subscribers.
    pub disclose_me: bool,
    /// Blocked session IDs.
    pub exclude: Vec<Id>,
    /// Allowed session IDs.
    pub eligible: Vec<Id>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            acknowledge: false,
            exclude_me: true,
            disclose_me: false,
            exclude: Vec::default(),
            eligible: Vec::default(),
        }
    }
}

impl PublishOptions {
    fn id_list(ids: &[Id]) -> Value {
        Value::List(
            ids.iter()
                .map(|id| Value::Integer(id.value()))
                .collect::<List>(),
        )
    }

    pub(crate) fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.acknowledge {
            options.insert("acknowledge".to_owned(), Value::Bool(true));
        }
        if !self.exclude_me {
            options.insert("exclude_me".to_owned(), Value::Bool(false));
        }
        if self.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }
        if !self.exclude.is_empty() {
            options.insert("exclude".to_owned(), Self::id_list(&self.exclude));
        }
        if !self.eligible.is_empty() {
            options.insert("eligible".to_owned(), Self::id_list(&self.eligible));
        }
        options
    }
}

#[cfg(test)]
mod options_test {
    use std::time::Duration;

    use crate::{
        core::{
            id::Id,
            invocation_policy::InvocationPolicy,
            types::{
                Dictionary,
                Value,
            },
        },
        session::options::{
            CallOptions,
            PublishOptions,
            RegisterOptions,
        },
    };

    #[test]
    fn default_options_are_empty_on_the_wire() {
        assert_eq!(CallOptions::default().to_dictionary(), Dictionary::default());
        assert_eq!(
            RegisterOptions::default().to_dictionary(),
            Dictionary::default()
        );
        assert_eq!(
            PublishOptions::default().to_dictionary(),
            Dictionary::default()
        );
    }

    #[test]
    fn call_timeout_is_sent_in_milliseconds() {
        let options = CallOptions {
            disclose_me: true,
            timeout: Some(Duration::from_secs(2)),
        }
        .to_dictionary();
        assert_eq!(options.get("disclose_me"), Some(&Value::Bool(true)));
        assert_eq!(options.get("timeout"), Some(&Value::Integer(2000)));
    }

    #[test]
    fn register_options_name_invocation_policy() {
        let options = RegisterOptions {
            disclose_caller: false,
            invoke: Some(InvocationPolicy::RoundRobin),
        }
        .to_dictionary();
        assert_eq!(
            options.get("invoke"),
            Some(&Value::String("roundrobin".to_owned()))
        );
    }

    #[test]
    fn publish_options_list_session_ids() {
        let options = PublishOptions {
            acknowledge: true,
            exclude_me: false,
            exclude: Vec::from_iter([Id::try_from(7).unwrap()]),
            ..Default::default()
        }
        .to_dictionary();
        assert_eq!(options.get("acknowledge"), Some(&Value::Bool(true)));
        assert_eq!(options.get("exclude_me"), Some(&Value::Bool(false)));
        assert_eq!(
            options.get("exclude"),
            Some(&Value::List(Vec::from_iter([Value::Integer(7)])))
        );
        assert!(options.get("eligible").is_none());
    }
}
