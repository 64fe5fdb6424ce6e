//! Storage naming rules.
//!
//! A storage name is either a bare channel name (`orders`) for the anonymous
//! storage, or `subscriber@channel` for a subscriber storage. The subscriber
//! part may be empty (`@orders` is channel `orders`' default subscriber);
//! the channel part never is. At most one `@` is permitted, and all other
//! characters come from `[A-Za-z0-9_-]`.

use std::fmt;

use qmq_error::{QmqError, Result};

/// A validated storage name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageName {
    raw: String,
    /// Byte position of the `@` separator, if present.
    at: Option<usize>,
}

impl StorageName {
    /// Parse and validate a storage name.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(QmqError::invalid_name(raw, "empty name"));
        }
        let mut at = None;
        for (pos, ch) in raw.char_indices() {
            match ch {
                '@' => {
                    if at.is_some() {
                        return Err(QmqError::invalid_name(raw.clone(), "more than one '@'"));
                    }
                    at = Some(pos);
                }
                'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '-' => {}
                other => {
                    return Err(QmqError::invalid_name(
                        raw.clone(),
                        format!("illegal character {other:?}"),
                    ));
                }
            }
        }
        if let Some(pos) = at {
            if pos + 1 == raw.len() {
                return Err(QmqError::invalid_name(raw, "empty channel part after '@'"));
            }
        }
        Ok(Self { raw, at })
    }

    /// Build the name for `subscriber@channel`.
    pub fn subscriber_storage(subscriber: &str, channel: &str) -> Result<Self> {
        Self::parse(format!("{subscriber}@{channel}"))
    }

    /// The full storage name as stored on disk.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The channel part (after the `@`, or the whole name without one).
    #[must_use]
    pub fn channel(&self) -> &str {
        match self.at {
            Some(pos) => &self.raw[pos + 1..],
            None => &self.raw,
        }
    }

    /// The subscriber part, or None for the anonymous storage.
    ///
    /// The default subscriber (`@channel`) yields `Some("")`.
    #[must_use]
    pub fn subscriber(&self) -> Option<&str> {
        self.at.map(|pos| &self.raw[..pos])
    }

    /// Whether this names a subscriber storage (contains an `@`).
    #[must_use]
    pub fn is_subscriber(&self) -> bool {
        self.at.is_some()
    }

    /// The human-facing id: the storage name with a leading `@` stripped,
    /// so the default subscriber reads as the bare channel name.
    #[must_use]
    pub fn display_id(&self) -> &str {
        self.raw.strip_prefix('@').unwrap_or(&self.raw)
    }
}

impl fmt::Display for StorageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for StorageName {
    type Err = QmqError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
