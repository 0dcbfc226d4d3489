//! Strongly-typed identifier newtypes for domain concepts.
//!
//! Every remote object the assistant API hands back (threads, messages, runs) and
//! the assistant being invoked are addressed by opaque strings. Wrapping them keeps
//! a thread id from being passed where a message id is expected.
//!
//! ```ignore
//! use dingtalk_assistant::{AssistantId, ThreadId};
//!
//! let thread: ThreadId = "thread_123".into();
//! let assistant: AssistantId = "assistant_abc".into();
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declares a trimmed string newtype that serializes as a bare JSON string.
macro_rules! string_id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into().trim().to_string())
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            /// Values are trimmed on construction, so whitespace-only input is empty.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id_type!(ThreadId, "Assistant thread (session) identifier.");

string_id_type!(MessageId, "Message identifier within a thread.");

string_id_type!(RunId, "Identifier of one assistant run over a thread.");

string_id_type!(
    AssistantId,
    "Identifier of the configured assistant (its `assistantId` in the DingTalk console)."
);
