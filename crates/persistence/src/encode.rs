//! BSON encoding of samples for the primary store. The document field names
//! are a contract with dashboard consumers; value encoding is polymorphic
//! over the sample's native type.

use mongodb::bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use telemetry::{Sample, SampleValue};

pub fn sample_document(sample: &Sample) -> Document {
    let mut document = doc! {
        "serverId": &sample.server_id,
        "serverName": &sample.server_name,
        "timestampUtc": mongodb::bson::DateTime::from_chrono(sample.timestamp_utc),
        "nodeId": &sample.node_id,
        "displayName": &sample.display_name,
        "browsePath": &sample.browse_path,
        "dataType": &sample.data_type,
        "value": value_bson(&sample.value),
        "statusCode": sample.status_code as i64,
        "quality": &sample.quality,
    };
    if let Some(ts) = sample.source_timestamp {
        document.insert("sourceTimestamp", mongodb::bson::DateTime::from_chrono(ts));
    }
    if let Some(ts) = sample.server_timestamp {
        document.insert("serverTimestamp", mongodb::bson::DateTime::from_chrono(ts));
    }
    document
}

fn value_bson(value: &SampleValue) -> Bson {
    match value {
        SampleValue::Null => Bson::Null,
        SampleValue::Bool(value) => Bson::Boolean(*value),
        SampleValue::Int(value) => Bson::Int64(*value),
        // BSON has no unsigned 64-bit type; values beyond i64 range are
        // stringified rather than silently wrapped.
        SampleValue::UInt(value) => match i64::try_from(*value) {
            Ok(value) => Bson::Int64(value),
            Err(_) => Bson::String(value.to_string()),
        },
        SampleValue::Float(value) => Bson::Double(*value),
        SampleValue::Decimal(value) => match value.parse::<mongodb::bson::Decimal128>() {
            Ok(decimal) => Bson::Decimal128(decimal),
            Err(_) => Bson::String(value.clone()),
        },
        SampleValue::String(value) => Bson::String(value.clone()),
        SampleValue::Bytes(bytes) => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.clone(),
        }),
        SampleValue::Timestamp(ts) => Bson::DateTime(mongodb::bson::DateTime::from_chrono(*ts)),
        SampleValue::Uuid(value) => Bson::String(value.to_string()),
        SampleValue::Array(items) => Bson::Array(items.iter().map(value_bson).collect()),
    }
}
