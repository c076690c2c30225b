//! Domain identifiers (strongly-typed names).
//!
//! Every identity in the protocol is a caller-supplied string: planners choose
//! task ids, operators choose namespaces and branches, workers choose their own
//! identity. They all share one validated representation, `Name<T>`, and the
//! phantom marker `T` keeps them from being mixed up at compile time.
//!
//! Task ids and namespaces become path components inside the substrate, so the
//! validation rules are the ones a file name must satisfy.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NameError;

/// Marker trait for each name kind.
pub trait NameMarker: Send + Sync + 'static {
    /// Human-readable kind used in error messages ("task id", "namespace", ...).
    const KIND: &'static str;

    /// Whether `/` may appear inside the name (branch names only).
    const ALLOWS_SLASH: bool = false;
}

/// Generic validated name.
///
/// `T` is never stored; it only exists at compile time.
///
/// # Example
/// ```ignore
/// let task: TaskId = "TASK-001".parse()?;
/// let ns: Namespace = "backend".parse()?;
/// // let _: Namespace = task; // <- does not compile
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name<T: NameMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: NameMarker> Name<T> {
    /// Validate and wrap a name.
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into();
        validate::<T>(&value)?;
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    /// For names built from text already known to be valid.
    pub(crate) fn new_unchecked(value: String) -> Self {
        debug_assert!(validate::<T>(&value).is_ok());
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

fn validate<T: NameMarker>(value: &str) -> Result<(), NameError> {
    let invalid = |reason: &'static str| NameError::Invalid {
        kind: T::KIND,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value == "." || value == ".." {
        return Err(invalid("must not be a relative path component"));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("must not contain whitespace or control characters"));
    }
    if value.contains('\\') {
        return Err(invalid("must not contain a backslash"));
    }
    if value.contains('/') {
        if !T::ALLOWS_SLASH {
            return Err(invalid("must not contain '/'"));
        }
        if value.starts_with('/') || value.ends_with('/') || value.contains("//") {
            return Err(invalid("must not have empty path segments"));
        }
    }
    Ok(())
}

impl<T: NameMarker> fmt::Display for Name<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: NameMarker> FromStr for Name<T> {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<T: NameMarker> AsRef<str> for Name<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl<T: NameMarker> Serialize for Name<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: NameMarker> Deserialize<'de> for Name<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

// ========================================
// Marker types
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl NameMarker for Task {
    const KIND: &'static str = "task id";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl NameMarker for Worker {
    const KIND: &'static str = "worker id";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Project {}

impl NameMarker for Project {
    const KIND: &'static str = "namespace";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Branch {}

impl NameMarker for Branch {
    const KIND: &'static str = "branch";
    const ALLOWS_SLASH: bool = true;
}

// ========================================
// Type aliases
// ========================================

/// Identifier of a task, unique within its namespace.
pub type TaskId = Name<Task>;

/// Identity of a worker process. Must be unique across the fleet.
pub type WorkerId = Name<Worker>;

/// A project: an independent partition of the backlog.
pub type Namespace = Name<Project>;

/// A coordination branch of the substrate.
pub type BranchName = Name<Branch>;

/// Branch used when the caller does not pick one.
pub const DEFAULT_BRANCH: &str = "default";

impl Default for BranchName {
    fn default() -> Self {
        Self {
            value: DEFAULT_BRANCH.to_string(),
            _marker: PhantomData,
        }
    }
}
