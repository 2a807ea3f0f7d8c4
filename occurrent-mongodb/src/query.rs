//! Lowers the attribute filter language to MongoDB query documents.

use bson::{doc, Bson, Document};
use chrono::Utc;

use occurrent::condition::{Comparison, Composition, Condition};
use occurrent::filter::{AttributeValue, Filter};

use crate::document::TimeRepresentation;

/// Lowers a filter to a MongoDB query over event documents.
pub fn to_query(filter: &Filter, time_representation: TimeRepresentation) -> Document {
    to_query_prefixed(filter, time_representation, "")
}

/// Same as [to_query] but with every field name prefixed, as needed when
/// matching change-stream documents (`fullDocument.`).
pub fn to_query_prefixed(
    filter: &Filter,
    time_representation: TimeRepresentation,
    prefix: &str,
) -> Document {
    let mut clauses: Vec<Document> = filter
        .constraints()
        .iter()
        .map(|(path, condition)| {
            lower_condition(&format!("{}{}", prefix, path), condition, time_representation)
        })
        .collect();

    match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    }
}

fn lower_condition(
    field: &str,
    condition: &Condition<AttributeValue>,
    time_representation: TimeRepresentation,
) -> Document {
    match condition {
        Condition::Single { op, operand } => {
            let operator = match op {
                Comparison::Eq => "$eq",
                Comparison::Lt => "$lt",
                Comparison::Gt => "$gt",
                Comparison::Lte => "$lte",
                Comparison::Gte => "$gte",
                Comparison::Ne => "$ne",
            };
            doc! { field: { operator: encode_value(operand, time_representation) } }
        },
        Condition::Multi { op, operands } => match op {
            Composition::And => doc! {
                "$and": operands
                    .iter()
                    .map(|c| lower_condition(field, c, time_representation))
                    .collect::<Vec<_>>()
            },
            Composition::Or => doc! {
                "$or": operands
                    .iter()
                    .map(|c| lower_condition(field, c, time_representation))
                    .collect::<Vec<_>>()
            },
            // $not only accepts operator expressions, $nor composes whole
            // predicates, which covers nested and/or operands too.
            Composition::Not => doc! {
                "$nor": [lower_condition(field, &operands[0], time_representation)]
            },
        },
    }
}

fn encode_value(value: &AttributeValue, time_representation: TimeRepresentation) -> Bson {
    match value {
        AttributeValue::String(s) => Bson::String(s.clone()),
        AttributeValue::Integer(i) => Bson::Int64(*i),
        AttributeValue::Boolean(b) => Bson::Boolean(*b),
        AttributeValue::Time(t) => match time_representation {
            // Normalised to UTC, the same encoding the document mapper
            // stores, so string comparison stays chronological.
            TimeRepresentation::Rfc3339String => Bson::String(t.with_timezone(&Utc).to_rfc3339()),
            TimeRepresentation::Date => {
                Bson::DateTime(bson::DateTime::from_millis(t.timestamp_millis()))
            },
        },
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use occurrent::condition::Condition;
    use occurrent::filter::Filter;

    use super::*;

    #[test]
    fn empty_filter_lowers_to_an_empty_document() {
        assert_eq!(
            to_query(&Filter::all(), TimeRepresentation::Rfc3339String),
            Document::new()
        );
    }

    #[test]
    fn single_constraint_lowers_to_a_field_predicate() {
        let filter = Filter::stream_id("orders");

        assert_eq!(
            to_query(&filter, TimeRepresentation::Rfc3339String),
            doc! { "streamid": { "$eq": "orders" } }
        );
    }

    #[test]
    fn multiple_constraints_lower_to_and() {
        let filter = Filter::stream_id("orders").and(Filter::ty("order.placed"));

        assert_eq!(
            to_query(&filter, TimeRepresentation::Rfc3339String),
            doc! { "$and": [
                { "streamid": { "$eq": "orders" } },
                { "type": { "$eq": "order.placed" } },
            ] }
        );
    }

    #[test]
    fn composite_conditions_lower_recursively() {
        let filter = Filter::stream_version(Condition::or(
            Condition::lt(2u64.into()),
            Condition::not(Condition::eq(5u64.into())),
            [],
        ));

        assert_eq!(
            to_query(&filter, TimeRepresentation::Rfc3339String),
            doc! { "$or": [
                { "streamversion": { "$lt": 2_i64 } },
                { "$nor": [ { "streamversion": { "$eq": 5_i64 } } ] },
            ] }
        );
    }

    #[test]
    fn time_values_follow_the_representation() {
        let time = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap().fixed_offset();
        let filter = Filter::time(Condition::lte(time.into()));

        assert_eq!(
            to_query(&filter, TimeRepresentation::Rfc3339String),
            doc! { "time": { "$lte": time.to_rfc3339() } }
        );

        assert_eq!(
            to_query(&filter, TimeRepresentation::Date),
            doc! { "time": { "$lte": Bson::DateTime(bson::DateTime::from_millis(time.timestamp_millis())) } }
        );
    }

    #[test]
    fn prefixing_rewrites_field_names() {
        let filter = Filter::stream_id("orders");

        assert_eq!(
            to_query_prefixed(&filter, TimeRepresentation::Rfc3339String, "fullDocument."),
            doc! { "fullDocument.streamid": { "$eq": "orders" } }
        );
    }
}
