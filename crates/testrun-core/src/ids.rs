//! Newtype wrappers for identifiers to ensure type safety.
//!
//! Channel and message ids are hierarchical: a channel id is scoped to the
//! worker that opened it (`<worker>/channel/<n>`) and a message id to its
//! channel (`<channel>/message/<n>`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique identifier for one execution unit (one test file, one lifetime).
    WorkerId
);

string_id!(
    /// Identifier of a shared-worker channel, unique within its owning worker.
    ChannelId
);

string_id!(
    /// Identifier of a message posted on a shared-worker channel.
    MessageId
);

impl WorkerId {
    /// Create a new WorkerId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random WorkerId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ChannelId {
    /// Build the id of the `sequence`th channel opened by `worker`.
    pub fn new(worker: &WorkerId, sequence: u64) -> Self {
        Self(format!("{worker}/channel/{sequence}"))
    }
}

impl MessageId {
    /// Build the id of the `sequence`th message a unit posted on `channel`.
    pub fn new(channel: &ChannelId, sequence: u64) -> Self {
        Self(format!("{channel}/message/{sequence}"))
    }

    /// Build the id of the `sequence`th message the shared worker posted on `channel`.
    pub fn from_host(channel: &ChannelId, sequence: u64) -> Self {
        Self(format!("{channel}/host-message/{sequence}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_generate() {
        let id1 = WorkerId::generate();
        let id2 = WorkerId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_hierarchical_ids() {
        let worker = WorkerId::new("w1");
        let channel = ChannelId::new(&worker, 3);
        assert_eq!(channel.as_str(), "w1/channel/3");

        let message = MessageId::new(&channel, 7);
        assert_eq!(format!("{}", message), "w1/channel/3/message/7");
        assert_ne!(MessageId::from_host(&channel, 7), message);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let channel = ChannelId::from("w/channel/1");
        let json = serde_json::to_string(&channel).unwrap();
        assert_eq!(json, "\"w/channel/1\"");
    }
}
