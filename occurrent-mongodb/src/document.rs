//! Bijective mapping between CloudEvents and MongoDB documents.
//!
//! Every CloudEvent attribute becomes a top-level field, extensions included,
//! so the documents stay queryable with plain MongoDB operators. `data` is
//! stored structured when the content type is JSON, raw bytes otherwise. The
//! backend-private `_id` never survives decoding.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use chrono::{DateTime, Utc};

use occurrent::event::{CloudEvent, Data, ExtensionValue, SPEC_VERSION};

/// How event `time` is persisted.
///
/// Chosen at store construction and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRepresentation {
    /// A canonical RFC 3339 string normalised to UTC, preserving sub-second
    /// precision. Time filters and sorts compare the stored strings
    /// lexicographically, which matches chronological order exactly because
    /// every string carries the same `+00:00` offset.
    Rfc3339String,

    /// A native BSON datetime with millisecond precision. Times with
    /// sub-millisecond components or a non-UTC offset are rejected.
    Date,
}

/// Error returned while mapping events to and from documents.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error(
        "event time {time} has sub-millisecond precision which the DATE time representation \
         cannot hold; use the RFC_3339_STRING representation or truncate the time to milliseconds"
    )]
    SubMillisecondTime { time: String },

    #[error(
        "event time {time} is not in UTC which the DATE time representation requires; use the \
         RFC_3339_STRING representation or normalise the time to UTC"
    )]
    NonUtcTime { time: String },

    #[error("failed to encode event data: {0}")]
    EncodeData(#[source] anyhow::Error),

    #[error("event document is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("event document field '{field}' has an unexpected type")]
    UnexpectedType { field: String },

    #[error("failed to parse event time '{value}': {source}")]
    ParseTime {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

fn is_json_content_type(datacontenttype: Option<&str>) -> bool {
    datacontenttype.map_or(false, |ct| ct.contains("json"))
}

/// Encodes a CloudEvent into a document.
///
/// The event is expected to already carry its `streamid` and `streamversion`
/// extensions; stores assign them before encoding.
pub fn encode(event: &CloudEvent, time_representation: TimeRepresentation) -> Result<Document, DocumentError> {
    let mut document = Document::new();

    document.insert("specversion", &event.specversion);
    document.insert("id", &event.id);
    document.insert("source", &event.source);
    document.insert("type", &event.ty);

    if let Some(subject) = &event.subject {
        document.insert("subject", subject);
    }
    if let Some(datacontenttype) = &event.datacontenttype {
        document.insert("datacontenttype", datacontenttype);
    }
    if let Some(dataschema) = &event.dataschema {
        document.insert("dataschema", dataschema);
    }

    if let Some(time) = &event.time {
        let encoded = match time_representation {
            // Normalised to UTC: filters lower time operands the same way,
            // so string comparison stays chronological whatever offset the
            // event was built with.
            TimeRepresentation::Rfc3339String => {
                Bson::String(time.with_timezone(&Utc).to_rfc3339())
            },
            TimeRepresentation::Date => {
                if time.offset().local_minus_utc() != 0 {
                    return Err(DocumentError::NonUtcTime {
                        time: time.to_rfc3339(),
                    });
                }
                if time.timestamp_subsec_nanos() % 1_000_000 != 0 {
                    return Err(DocumentError::SubMillisecondTime {
                        time: time.to_rfc3339(),
                    });
                }
                Bson::DateTime(bson::DateTime::from_millis(time.timestamp_millis()))
            },
        };
        document.insert("time", encoded);
    }

    if let Some(data) = &event.data {
        let encoded = match data {
            Data::Json(value) if is_json_content_type(event.datacontenttype.as_deref()) => {
                Bson::try_from(value.clone())
                    .map_err(|err| DocumentError::EncodeData(anyhow::Error::new(err)))?
            },
            other => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: other.as_bytes().into_owned(),
            }),
        };
        document.insert("data", encoded);
    }

    for (name, value) in &event.extensions {
        let encoded = match value {
            ExtensionValue::String(s) => Bson::String(s.clone()),
            ExtensionValue::Integer(i) => Bson::Int64(*i),
            ExtensionValue::Boolean(b) => Bson::Boolean(*b),
        };
        document.insert(name, encoded);
    }

    Ok(document)
}

fn take_required_string(document: &mut Document, field: &'static str) -> Result<String, DocumentError> {
    match document.remove(field) {
        Some(Bson::String(value)) => Ok(value),
        Some(_) => Err(DocumentError::UnexpectedType {
            field: field.to_owned(),
        }),
        None => Err(DocumentError::MissingField(field)),
    }
}

fn take_optional_string(document: &mut Document, field: &str) -> Result<Option<String>, DocumentError> {
    match document.remove(field) {
        Some(Bson::String(value)) => Ok(Some(value)),
        Some(_) => Err(DocumentError::UnexpectedType {
            field: field.to_owned(),
        }),
        None => Ok(None),
    }
}

/// Decodes an event document back into a CloudEvent, stripping the
/// backend-private `_id` field.
pub fn decode(mut document: Document, time_representation: TimeRepresentation) -> Result<CloudEvent, DocumentError> {
    document.remove("_id");

    let specversion = take_optional_string(&mut document, "specversion")?
        .unwrap_or_else(|| SPEC_VERSION.to_owned());
    let id = take_required_string(&mut document, "id")?;
    let source = take_required_string(&mut document, "source")?;
    let ty = take_required_string(&mut document, "type")?;
    let subject = take_optional_string(&mut document, "subject")?;
    let datacontenttype = take_optional_string(&mut document, "datacontenttype")?;
    let dataschema = take_optional_string(&mut document, "dataschema")?;

    let time = match document.remove("time") {
        None => None,
        Some(Bson::String(value)) => {
            let parsed = DateTime::parse_from_rfc3339(&value)
                .map_err(|source| DocumentError::ParseTime { value, source })?;
            Some(parsed)
        },
        Some(Bson::DateTime(value)) => Some(value.to_chrono().fixed_offset()),
        Some(_) => {
            return Err(DocumentError::UnexpectedType {
                field: "time".to_owned(),
            })
        },
    };

    // Ignored on decode; kept here so an explicit mismatch does not leak
    // into the extension attributes below.
    let _ = time_representation;

    // JSON payloads are not necessarily objects: a scalar payload encodes to
    // a scalar BSON value, which converts straight back to its JSON form.
    let data = match document.remove("data") {
        None => None,
        Some(Bson::Binary(value)) => Some(Data::Binary(value.bytes)),
        Some(
            value @ (Bson::Document(_)
            | Bson::Array(_)
            | Bson::String(_)
            | Bson::Int32(_)
            | Bson::Int64(_)
            | Bson::Double(_)
            | Bson::Boolean(_)
            | Bson::Null),
        ) => Some(Data::Json(value.into())),
        Some(_) => {
            return Err(DocumentError::UnexpectedType {
                field: "data".to_owned(),
            })
        },
    };

    let mut extensions = std::collections::BTreeMap::new();
    for (name, value) in document {
        let decoded = match value {
            Bson::String(s) => ExtensionValue::String(s),
            Bson::Int32(i) => ExtensionValue::Integer(i64::from(i)),
            Bson::Int64(i) => ExtensionValue::Integer(i),
            Bson::Boolean(b) => ExtensionValue::Boolean(b),
            _ => return Err(DocumentError::UnexpectedType { field: name }),
        };
        extensions.insert(name.clone(), decoded);
    }

    Ok(CloudEvent {
        id,
        source,
        ty,
        specversion,
        subject,
        time,
        datacontenttype,
        dataschema,
        data,
        extensions,
    })
}
