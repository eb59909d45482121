//! Identifier newtypes shared by sessions, media and compositors

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Participant name as known to the signaling server
    PeerId
);

string_id!(
    /// Unique identifier for a media track
    TrackId
);

string_id!(
    /// Unique identifier for a media stream (a group of tracks)
    StreamId
);

impl PeerId {
    /// Names starting with `@` address media servers rather than participants
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.0.starts_with('@')
    }
}

impl TrackId {
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }
}

impl StreamId {
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }
}
