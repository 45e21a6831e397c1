use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Number of characters in every short code.
pub const SHORT_CODE_LENGTH: usize = 8;

/// A validated short code identifier for a shortened URL.
///
/// Short codes are exactly [`SHORT_CODE_LENGTH`] characters long and contain
/// only ASCII letters and digits.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShortCode(String);

impl ShortCode {
    /// Creates a new `ShortCode` after validating the input.
    pub fn new(code: impl Into<String>) -> std::result::Result<Self, CoreError> {
        let code = code.into();
        Self::validate(&code)?;
        Ok(Self(code))
    }

    /// Creates a `ShortCode` without validation.
    ///
    /// Use this only for codes produced by trusted internal sources
    /// (the code generator, or rows this service wrote itself).
    pub fn new_unchecked(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Extracts the short code from a rendered short URL.
    ///
    /// Accepts either a bare code (`"AbC123xY"`) or a full short URL
    /// (`"http://localhost:8080/AbC123xY"`), in which case the last path
    /// segment is used.
    pub fn from_short_url(short_url: &str) -> std::result::Result<Self, CoreError> {
        let tail = short_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        Self::new(tail)
    }

    /// Generates the full shortened URL based on the provided base URL.
    pub fn to_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self)
    }

    /// Returns the short code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(code: &str) -> std::result::Result<(), CoreError> {
        if code.len() != SHORT_CODE_LENGTH {
            return Err(CoreError::InvalidShortCode(format!(
                "length must be {}, got {}",
                SHORT_CODE_LENGTH,
                code.len()
            )));
        }

        if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidShortCode(format!(
                "must contain only alphanumeric characters: '{}'",
                code
            )));
        }

        Ok(())
    }
}

impl Display for ShortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ShortCode {
    type Error = CoreError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ShortCode> for String {
    fn from(value: ShortCode) -> Self {
        value.0
    }
}
