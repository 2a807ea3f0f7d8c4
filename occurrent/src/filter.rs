//! Filters select events by their attributes.
//!
//! A [Filter] is a conjunction of `(attribute path, condition)` pairs.
//! Recognized paths are the CloudEvent context attributes, the `streamid` and
//! `streamversion` extensions, any other extension attribute, and dotted
//! paths into a JSON payload (`data.order.total`).
//!
//! Filters have two lowerings with identical semantics: backends translate
//! them to their native query language, and [`Filter::matches`] evaluates
//! them in memory. The in-memory evaluation follows document-store missing-
//! field semantics: `ne` and `not` match events where the attribute is
//! absent, every other comparison does not.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::condition::{Comparison, Composition, Condition};
use crate::event::{CloudEvent, Data, ExtensionValue, STREAM_ID, STREAM_VERSION};

/// An attribute value a condition can compare against.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Time(DateTime<FixedOffset>),
}

impl AttributeValue {
    fn is_orderable(&self) -> bool {
        !matches!(self, AttributeValue::Boolean(_))
    }
}

impl PartialOrd for AttributeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (AttributeValue::String(a), AttributeValue::String(b)) => a.partial_cmp(b),
            (AttributeValue::Integer(a), AttributeValue::Integer(b)) => a.partial_cmp(b),
            (AttributeValue::Boolean(a), AttributeValue::Boolean(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            },
            (AttributeValue::Time(a), AttributeValue::Time(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Boolean(b) => write!(f, "{}", b),
            AttributeValue::Time(t) => f.write_str(&t.to_rfc3339()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::Integer(value as i64)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Boolean(value)
    }
}

impl From<DateTime<FixedOffset>> for AttributeValue {
    fn from(value: DateTime<FixedOffset>) -> Self {
        AttributeValue::Time(value)
    }
}

/// Error returned when constructing a filter that cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFilter {
    #[error("unknown attribute path '{0}'")]
    UnknownAttribute(String),
    #[error("attribute '{path}' compares a non-orderable value with an ordering operator")]
    NotOrderable { path: String },
}

const CONTEXT_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "type",
    "specversion",
    "subject",
    "time",
    "datacontenttype",
    "dataschema",
];

fn is_known_path(path: &str) -> bool {
    if CONTEXT_ATTRIBUTES.contains(&path) || path == "data" {
        return true;
    }
    if let Some(rest) = path.strip_prefix("data.") {
        return !rest.is_empty() && rest.split('.').all(|segment| !segment.is_empty());
    }
    // Extension attribute names, streamid and streamversion included.
    !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// A conjunction of conditions over event attributes. The empty filter
/// matches every event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    constraints: Vec<(String, Condition<AttributeValue>)>,
}

impl Filter {
    /// The filter that matches all events.
    pub fn all() -> Self {
        Filter::default()
    }

    /// A filter with a single condition on the given attribute path.
    pub fn attribute(
        path: impl Into<String>,
        condition: Condition<AttributeValue>,
    ) -> Result<Self, InvalidFilter> {
        Filter::all().and_attribute(path, condition)
    }

    /// Adds a condition on the given attribute path to this filter.
    pub fn and_attribute(
        mut self,
        path: impl Into<String>,
        condition: Condition<AttributeValue>,
    ) -> Result<Self, InvalidFilter> {
        let path = path.into();
        if !is_known_path(&path) {
            return Err(InvalidFilter::UnknownAttribute(path));
        }
        if condition.requires_ordering() && !condition_operands_orderable(&condition) {
            return Err(InvalidFilter::NotOrderable { path });
        }
        self.constraints.push((path, condition));
        Ok(self)
    }

    /// Events of the given stream.
    pub fn stream_id(id: &str) -> Self {
        Filter {
            constraints: vec![(STREAM_ID.to_owned(), Condition::eq(id.into()))],
        }
    }

    /// Events whose stream version satisfies the condition.
    pub fn stream_version(condition: Condition<AttributeValue>) -> Self {
        Filter {
            constraints: vec![(STREAM_VERSION.to_owned(), condition)],
        }
    }

    /// Events of the given type.
    pub fn ty(ty: &str) -> Self {
        Filter {
            constraints: vec![("type".to_owned(), Condition::eq(ty.into()))],
        }
    }

    /// Events with the given subject.
    pub fn subject(subject: &str) -> Self {
        Filter {
            constraints: vec![("subject".to_owned(), Condition::eq(subject.into()))],
        }
    }

    /// Events whose time satisfies the condition.
    pub fn time(condition: Condition<AttributeValue>) -> Self {
        Filter {
            constraints: vec![("time".to_owned(), condition)],
        }
    }

    /// The conjunction of this filter and another.
    #[must_use]
    pub fn and(mut self, other: Filter) -> Self {
        self.constraints.extend(other.constraints);
        self
    }

    /// The constraints making up this filter, in insertion order.
    pub fn constraints(&self) -> &[(String, Condition<AttributeValue>)] {
        &self.constraints
    }

    pub fn is_all(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Evaluates the filter against an event in memory.
    pub fn matches(&self, event: &CloudEvent) -> bool {
        self.constraints
            .iter()
            .all(|(path, condition)| matches_condition(condition, resolve(event, path).as_ref()))
    }
}

fn condition_operands_orderable(condition: &Condition<AttributeValue>) -> bool {
    match condition {
        Condition::Single { op, operand } => !op.requires_ordering() || operand.is_orderable(),
        Condition::Multi { operands, .. } => operands.iter().all(condition_operands_orderable),
    }
}

fn matches_condition(condition: &Condition<AttributeValue>, value: Option<&AttributeValue>) -> bool {
    match condition {
        Condition::Single { op, operand } => match value {
            Some(value) => match op {
                Comparison::Eq => value == operand,
                Comparison::Ne => value != operand,
                Comparison::Lt => matches!(value.partial_cmp(operand), Some(Ordering::Less)),
                Comparison::Gt => matches!(value.partial_cmp(operand), Some(Ordering::Greater)),
                Comparison::Lte => matches!(
                    value.partial_cmp(operand),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                Comparison::Gte => matches!(
                    value.partial_cmp(operand),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
            },
            // Missing attributes only satisfy negated comparisons.
            None => *op == Comparison::Ne,
        },
        Condition::Multi { op, operands } => match op {
            Composition::And => operands.iter().all(|c| matches_condition(c, value)),
            Composition::Or => operands.iter().any(|c| matches_condition(c, value)),
            Composition::Not => !matches_condition(&operands[0], value),
        },
    }
}

fn resolve(event: &CloudEvent, path: &str) -> Option<AttributeValue> {
    match path {
        "id" => Some(AttributeValue::String(event.id.clone())),
        "source" => Some(AttributeValue::String(event.source.clone())),
        "type" => Some(AttributeValue::String(event.ty.clone())),
        "specversion" => Some(AttributeValue::String(event.specversion.clone())),
        "subject" => event.subject.clone().map(AttributeValue::String),
        "time" => event.time.map(AttributeValue::Time),
        "datacontenttype" => event.datacontenttype.clone().map(AttributeValue::String),
        "dataschema" => event.dataschema.clone().map(AttributeValue::String),
        _ => {
            if path == "data" || path.starts_with("data.") {
                return resolve_data(event.data.as_ref()?, path.strip_prefix("data").unwrap());
            }
            event.extensions.get(path).map(|value| match value {
                ExtensionValue::String(s) => AttributeValue::String(s.clone()),
                ExtensionValue::Integer(i) => AttributeValue::Integer(*i),
                ExtensionValue::Boolean(b) => AttributeValue::Boolean(*b),
            })
        },
    }
}

fn resolve_data(data: &Data, dotted: &str) -> Option<AttributeValue> {
    let mut node = data.as_json()?;
    for segment in dotted.split('.').filter(|s| !s.is_empty()) {
        node = node.get(segment)?;
    }
    match node {
        serde_json::Value::String(s) => Some(AttributeValue::String(s.clone())),
        serde_json::Value::Number(n) => n.as_i64().map(AttributeValue::Integer),
        serde_json::Value::Bool(b) => Some(AttributeValue::Boolean(*b)),
        _ => None,
    }
}
