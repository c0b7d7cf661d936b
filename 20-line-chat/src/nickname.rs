use std::{borrow::Borrow, fmt};

use thiserror::Error;

pub const DEFAULT_MAX_NICKNAME_BYTES: usize = 32;

/// Case-sensitive, validated identifier a client chooses when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nickname(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NicknameError {
    #[error("nickname cannot be empty")]
    Empty,
    #[error("nickname cannot be longer than {max} bytes")]
    TooLong { max: usize },
    #[error("nickname cannot contain control characters")]
    ControlCharacter,
}

impl Nickname {
    /// Parses a raw line into a nickname, trimming surrounding whitespace.
    pub fn parse(raw: &str, max_bytes: usize) -> Result<Self, NicknameError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(NicknameError::Empty);
        }
        if trimmed.len() > max_bytes {
            return Err(NicknameError::TooLong { max: max_bytes });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(NicknameError::ControlCharacter);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Nickname {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Nickname {
    type Error = NicknameError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::parse(raw, DEFAULT_MAX_NICKNAME_BYTES)
    }
}
