//! The CloudEvent envelope and its Occurrent-specific extension attributes.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::version::StreamVersion;

/// Name of the extension attribute that groups events into an event stream.
pub const STREAM_ID: &str = "streamid";

/// Name of the extension attribute carrying the 1-based, dense version of an
/// event within its stream.
pub const STREAM_VERSION: &str = "streamversion";

/// The CloudEvents spec version written by this library.
pub const SPEC_VERSION: &str = "1.0";

/// The payload of a [CloudEvent].
///
/// JSON payloads are kept as a structured tree so that filters can address
/// into them with dotted `data.` paths; everything else is raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl Data {
    /// The payload rendered as bytes, regardless of how it is held in memory.
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Data::Json(value) => Cow::Owned(value.to_string().into_bytes()),
            Data::Binary(bytes) => Cow::Borrowed(bytes),
        }
    }

    /// The payload as a structured tree, if it is JSON.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Data::Json(value) => Some(value),
            Data::Binary(_) => None,
        }
    }
}

/// Value of a CloudEvent extension attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for ExtensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionValue::String(s) => f.write_str(s),
            ExtensionValue::Integer(i) => write!(f, "{}", i),
            ExtensionValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        ExtensionValue::String(value.to_owned())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        ExtensionValue::String(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        ExtensionValue::Integer(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        ExtensionValue::Boolean(value)
    }
}

/// A CloudEvent, the envelope every event in the store is wrapped in.
///
/// The required context attributes (`id`, `source`, `type`, `specversion`)
/// are plain fields; everything the CloudEvents spec treats as optional is an
/// `Option`. Extension attributes live in a sorted map so that encoding is
/// deterministic.
///
/// `(source, id)` identifies an event globally. Events persisted to a store
/// additionally carry the [STREAM_ID] and [STREAM_VERSION] extensions, which
/// are assigned by the store on append; values set by the caller are
/// overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    pub ty: String,
    pub specversion: String,
    pub subject: Option<String>,
    pub time: Option<DateTime<FixedOffset>>,
    pub datacontenttype: Option<String>,
    pub dataschema: Option<String>,
    pub data: Option<Data>,
    pub extensions: BTreeMap<String, ExtensionValue>,
}

impl CloudEvent {
    pub fn builder() -> CloudEventBuilder {
        CloudEventBuilder::default()
    }

    /// The id of the event stream this event belongs to, if it has been
    /// persisted.
    pub fn stream_id(&self) -> Option<&str> {
        match self.extensions.get(STREAM_ID) {
            Some(ExtensionValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The version of this event within its stream, if it has been persisted.
    pub fn stream_version(&self) -> Option<StreamVersion> {
        match self.extensions.get(STREAM_VERSION) {
            Some(ExtensionValue::Integer(v)) if *v > 0 => Some(*v as StreamVersion),
            _ => None,
        }
    }

    /// Returns a copy of this event carrying the given stream identity in its
    /// extension attributes. Used by stores when assigning versions on append.
    #[must_use]
    pub fn with_stream_identity(mut self, stream_id: &str, version: StreamVersion) -> Self {
        self.extensions
            .insert(STREAM_ID.to_owned(), ExtensionValue::String(stream_id.to_owned()));
        self.extensions
            .insert(STREAM_VERSION.to_owned(), ExtensionValue::Integer(version as i64));
        self
    }
}

/// Error returned when building a [CloudEvent] that violates the envelope
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCloudEvent {
    #[error("cloud event attribute '{0}' cannot be empty")]
    EmptyAttribute(&'static str),
    #[error("extension attribute name '{0}' is invalid, names must be non-empty lowercase alphanumeric")]
    InvalidExtensionName(String),
}

/// Builder for [CloudEvent] values.
#[derive(Debug, Clone, Default)]
pub struct CloudEventBuilder {
    id: String,
    source: String,
    ty: String,
    subject: Option<String>,
    time: Option<DateTime<FixedOffset>>,
    datacontenttype: Option<String>,
    dataschema: Option<String>,
    data: Option<Data>,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl CloudEventBuilder {
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn ty(mut self, ty: impl Into<String>) -> Self {
        self.ty = ty.into();
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn time(mut self, time: DateTime<FixedOffset>) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn datacontenttype(mut self, datacontenttype: impl Into<String>) -> Self {
        self.datacontenttype = Some(datacontenttype.into());
        self
    }

    #[must_use]
    pub fn dataschema(mut self, dataschema: impl Into<String>) -> Self {
        self.dataschema = Some(dataschema.into());
        self
    }

    /// Sets a JSON payload and, unless set explicitly, an
    /// `application/json` content type.
    #[must_use]
    pub fn json_data(mut self, value: serde_json::Value) -> Self {
        self.data = Some(Data::Json(value));
        if self.datacontenttype.is_none() {
            self.datacontenttype = Some("application/json".to_owned());
        }
        self
    }

    #[must_use]
    pub fn binary_data(mut self, bytes: Vec<u8>) -> Self {
        self.data = Some(Data::Binary(bytes));
        self
    }

    #[must_use]
    pub fn extension(mut self, name: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<CloudEvent, InvalidCloudEvent> {
        if self.id.is_empty() {
            return Err(InvalidCloudEvent::EmptyAttribute("id"));
        }
        if self.source.is_empty() {
            return Err(InvalidCloudEvent::EmptyAttribute("source"));
        }
        if self.ty.is_empty() {
            return Err(InvalidCloudEvent::EmptyAttribute("type"));
        }

        for name in self.extensions.keys() {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !valid {
                return Err(InvalidCloudEvent::InvalidExtensionName(name.clone()));
            }
        }

        Ok(CloudEvent {
            id: self.id,
            source: self.source,
            ty: self.ty,
            specversion: SPEC_VERSION.to_owned(),
            subject: self.subject,
            time: self.time,
            datacontenttype: self.datacontenttype,
            dataschema: self.dataschema,
            data: self.data,
            extensions: self.extensions,
        })
    }
}
