// File: src/core/ids.rs

//! Identifier types for the chat synchronization engine.
//!
//! This module is intentionally **type-heavy** and **logic-light**: it
//! provides strongly-typed id newtypes and helpers for minting, parsing,
//! and formatting them.
//!
//! The backend issues opaque string identifiers (it is free to use UUIDs,
//! short codes, or anything else), so every newtype here wraps a `String`
//! rather than a `uuid::Uuid`. Records minted locally (optimistic writes,
//! offline fallback) use freshly generated UUID v4 strings, which the
//! backend accepts as just another opaque id.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mint a fresh opaque id for locally created records.
#[inline]
#[must_use]
fn mint_local_id() -> String {
    Uuid::new_v4().to_string()
}

/// Declare an opaque string-backed id newtype with a consistent API.
macro_rules! define_opaque_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a new locally generated identifier (UUID v4 string).
            #[inline]
            #[must_use]
            pub fn generate() -> Self {
                Self(mint_local_id())
            }

            /// Wrap an identifier received from the backend.
            #[inline]
            #[must_use]
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow as `&str`.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume into the underlying `String`.
            #[inline]
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }

            /// True when the id carries no characters, e.g. a defaulted wire field.
            #[inline]
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            #[inline]
            fn default() -> Self {
                Self::generate()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            #[inline]
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<$name> for String {
            #[inline]
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl FromStr for $name {
            type Err = core::convert::Infallible;

            #[inline]
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }
    };
}

// ===== Core IDs =============================================================

define_opaque_id!(
    /// Identifier of a conversation thread.
    ///
    /// Either assigned by the backend in a send/create response or minted
    /// locally when the user starts chatting offline.
    ConversationId
);

define_opaque_id!(
    /// Identifier of a single message within a conversation.
    MessageId
);

define_opaque_id!(
    /// Identifier of one in-progress assistant streaming turn.
    ///
    /// Only ever observed on the wire (`stream_start` frames); never stored.
    StreamId
);

// ===== Rusqlite integration ================================================

mod rusqlite_impl {
    use super::{ConversationId, MessageId};

    use rusqlite::types::{
        FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef,
    };

    macro_rules! impl_rusqlite_opaque_newtype {
        ($t:ty) => {
            impl ToSql for $t {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    // Stored as TEXT so the DB file stays human-inspectable
                    Ok(ToSqlOutput::Owned(Value::Text(self.as_str().to_owned())))
                }
            }

            impl FromSql for $t {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    match value {
                        ValueRef::Text(t) => std::str::from_utf8(t)
                            .map(Self::from)
                            .map_err(|e| FromSqlError::Other(Box::new(e))),
                        _ => Err(FromSqlError::InvalidType),
                    }
                }
            }
        };
    }

    impl_rusqlite_opaque_newtype!(ConversationId);
    impl_rusqlite_opaque_newtype!(MessageId);
}

#[cfg(test)]
mod tests {
    use super::{ConversationId, MessageId, StreamId};

    #[test]
    fn test_minted_ids_are_unique_and_non_empty() {
        let a = ConversationId::generate();
        let b = ConversationId::generate();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn test_wire_ids_round_trip_verbatim() {
        let id = MessageId::from_raw("m1");
        assert_eq!(id.as_str(), "m1");
        assert_eq!(id.to_string(), "m1");
        assert_eq!(String::from(id), "m1");
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = ConversationId::from_raw("c1");
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, "\"c1\"");
        let back: ConversationId = serde_json::from_str(&json).unwrap_or_default();
        assert_eq!(back, id);
    }

    #[test]
    fn test_defaulted_stream_id_is_minted() {
        let id = StreamId::default();
        assert!(!id.is_empty());
    }
}
