//! Stream versioning and the optimistic write condition gating appends.

use std::fmt;

use crate::condition::Condition;

/// The version of an event stream: the number of events appended to it so
/// far. `0` means the stream does not exist (or has been deleted).
///
/// Within a stream, events carry versions `1..=N` with no gaps and no
/// duplicates; see the `streamversion` extension attribute.
pub type StreamVersion = u64;

/// A predicate over the current version of an event stream, evaluated
/// atomically by the store before appending.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    /// No expectation: the append succeeds whatever the current version is.
    Any,

    /// The current stream version must satisfy the condition.
    StreamVersion(Condition<StreamVersion>),
}

impl WriteCondition {
    /// Expect the stream to be exactly at `version`.
    pub fn stream_version_eq(version: StreamVersion) -> Self {
        WriteCondition::StreamVersion(Condition::eq(version))
    }

    /// Expect the current stream version to satisfy an arbitrary condition.
    pub fn stream_version(condition: Condition<StreamVersion>) -> Self {
        WriteCondition::StreamVersion(condition)
    }

    /// Evaluates the condition against the stream's current version.
    pub fn is_fulfilled_by(&self, current: StreamVersion) -> bool {
        match self {
            WriteCondition::Any => true,
            WriteCondition::StreamVersion(condition) => condition.matches(&current),
        }
    }

    /// Builds the failure carrying this condition's description and the
    /// version that was actually found.
    pub fn not_fulfilled(&self, actual: StreamVersion) -> WriteConditionNotFulfilled {
        WriteConditionNotFulfilled {
            expected: self.to_string(),
            actual,
        }
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCondition::Any => f.write_str("any"),
            WriteCondition::StreamVersion(condition) => write!(f, "{}", condition),
        }
    }
}

/// Returned by an append whose [WriteCondition] did not hold.
///
/// The message embeds the condition's human-readable description verbatim,
/// e.g. `"... Expected version to be equal to 10 but was 1."`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the write condition was not fulfilled. Expected version {expected} but was {actual}.")]
pub struct WriteConditionNotFulfilled {
    /// Description of the expected version, taken from the condition.
    pub expected: String,

    /// The stream version that was actually found.
    pub actual: StreamVersion,
}
