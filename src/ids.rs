use std::fmt::{self, Display};
use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Create a new id from any type that can be converted into an `Arc<str>`.
            pub fn new(id: impl Into<Arc<str>>) -> Self {
                Self(id.into())
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s.into())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.into())
            }
        }
    };
}

string_id! {
    /// Identifies one logical MSRP message across all of its chunks (`Message-ID`).
    MessageId
}

string_id! {
    /// Correlates a SEND chunk with its response. Shared by every piece of one chunk.
    TransactionId
}

string_id! {
    /// The session part of a local MSRP URI. Unique among the participants of one registry.
    SessionId
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl MessageId {
    pub fn generate() -> Self {
        Self::from(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl TransactionId {
    pub fn generate() -> Self {
        Self::from(random_token(12))
    }
}

impl SessionId {
    pub fn generate() -> Self {
        Self::from(random_token(16))
    }
}
