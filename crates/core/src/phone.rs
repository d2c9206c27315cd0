//! E.164 phone number value object.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A validated E.164 phone number (`+` followed by 7..=15 digits).
///
/// The queue never sends to a raw string; construction is the validation
/// boundary, so everything downstream can trust the format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        let Some(digits) = trimmed.strip_prefix('+') else {
            return Err(DomainError::validation(format!(
                "phone number must start with '+': {trimmed:?}"
            )));
        };
        if !(7..=15).contains(&digits.len()) {
            return Err(DomainError::validation(format!(
                "phone number must have 7-15 digits, got {}",
                digits.len()
            )));
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "phone number contains non-digits: {trimmed:?}"
            )));
        }
        // Leading zero after the country-code '+' is not valid E.164.
        if digits.starts_with('0') {
            return Err(DomainError::validation(
                "phone number country code cannot start with 0",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}
