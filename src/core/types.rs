//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`StateId`] - Identifier of one piece of persisted infrastructure state
//! - [`HolderId`] - Identity recorded in a lock record
//! - [`BucketName`] - Validated object-store bucket name
//! - [`TableName`] - Validated lock-table name
//! - [`UtcTimestamp`] - RFC3339 timestamp
//!
//! # Validation
//!
//! These types enforce validity at construction time. Invalid values
//! cannot be represented, preventing entire classes of bugs.
//!
//! # Examples
//!
//! ```
//! use stackguard::core::types::{BucketName, StateId};
//!
//! let bucket = BucketName::new("my-terraform-state").unwrap();
//! let state = StateId::new("qa/my-app").unwrap();
//!
//! assert!(BucketName::new("Has_Upper").is_err());
//! assert!(StateId::new("").is_err());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid state id: {0}")]
    InvalidStateId(String),

    #[error("invalid holder id: {0}")]
    InvalidHolderId(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("invalid table name: {0}")]
    InvalidTableName(String),
}

/// Identifier of one piece of persisted state.
///
/// This is the primary key of a lock record. At most one lock record may
/// exist per state id at any instant.
///
/// # Example
///
/// ```
/// use stackguard::core::types::StateId;
///
/// let id = StateId::new("mgmt/vpc").unwrap();
/// assert_eq!(id.as_str(), "mgmt/vpc");
///
/// assert!(StateId::new("  ").is_err());
/// assert!(StateId::new("tab\there").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateId(String);

impl StateId {
    /// Create a new validated state id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidStateId` if the id is blank or contains
    /// control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TypeError::InvalidStateId("state id cannot be empty".into()));
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(TypeError::InvalidStateId(
                "state id cannot contain control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the state id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StateId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StateId> for String {
    fn from(id: StateId) -> Self {
        id.0
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a lock holder.
///
/// The default identity is `user@host`, which stays stable across
/// processes of the same operator so a long-term lock taken with
/// `acquire-lock` can later be released with `release-lock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HolderId(String);

impl HolderId {
    /// Create a new validated holder id.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TypeError::InvalidHolderId("holder id cannot be empty".into()));
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(TypeError::InvalidHolderId(
                "holder id cannot contain control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Derive the holder identity of the current operator.
    ///
    /// Uses `$USER` (or `$USERNAME`) and `$HOSTNAME`, falling back to
    /// `unknown` and `localhost`.
    pub fn current() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self(format!("{}@{}", user, host))
    }

    /// Get the holder id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HolderId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HolderId> for String {
    fn from(id: HolderId) -> Self {
        id.0
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated object-store bucket name.
///
/// Follows the S3 naming rules:
/// - 3 to 63 characters
/// - Lowercase letters, digits, `.` and `-` only
/// - Must start and end with a letter or digit
/// - Cannot contain `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketName(String);

impl BucketName {
    /// Create a new validated bucket name.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), TypeError> {
        if name.len() < 3 || name.len() > 63 {
            return Err(TypeError::InvalidBucketName(format!(
                "'{}' must be between 3 and 63 characters",
                name
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
        {
            return Err(TypeError::InvalidBucketName(format!(
                "'{}' may only contain lowercase letters, digits, '.' and '-'",
                name
            )));
        }
        let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
            return Err(TypeError::InvalidBucketName(format!(
                "'{}' must start and end with a letter or digit",
                name
            )));
        }
        if name.contains("..") {
            return Err(TypeError::InvalidBucketName(format!(
                "'{}' cannot contain '..'",
                name
            )));
        }
        Ok(())
    }

    /// Get the bucket name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BucketName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BucketName> for String {
    fn from(name: BucketName) -> Self {
        name.0
    }
}

impl std::fmt::Display for BucketName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated lock-table name (3 to 255 characters of `[A-Za-z0-9_.-]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Create a new validated table name.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.len() < 3 || name.len() > 255 {
            return Err(TypeError::InvalidTableName(format!(
                "'{}' must be between 3 and 255 characters",
                name
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(TypeError::InvalidTableName(format!(
                "'{}' may only contain letters, digits, '_', '-' and '.'",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the table name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TableName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(name: TableName) -> Self {
        name.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A UTC timestamp, serialized as RFC3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(DateTime<Utc>);

impl UtcTimestamp {
    /// The current time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing `DateTime<Utc>`.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parse an RFC3339 string.
    pub fn parse(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Get the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl std::fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
