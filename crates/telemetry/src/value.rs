use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SampleValue is the tagged union of every value shape a monitored item can
/// deliver. Integer widths below 64 bits are widened on conversion, and the
/// declared OPC UA type name is carried separately on the Sample, so nothing
/// is lost by collapsing them here.
///
/// The serde representation is adjacently tagged, which keeps a serialized
/// value self-describing: a `Timestamp` read back from a fallback file is a
/// `Timestamp`, not a string that happens to parse as one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum SampleValue {
    Null,
    Bool(bool),
    Int(i64),
    #[serde(rename = "uint")]
    UInt(u64),
    Float(f64),
    /// Decimal values are carried as their canonical string rendering.
    Decimal(String),
    String(String),
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Array(Vec<SampleValue>),
}

impl SampleValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SampleValue::Null)
    }

    /// A short name for the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SampleValue::Null => "null",
            SampleValue::Bool(_) => "bool",
            SampleValue::Int(_) => "int",
            SampleValue::UInt(_) => "uint",
            SampleValue::Float(_) => "float",
            SampleValue::Decimal(_) => "decimal",
            SampleValue::String(_) => "string",
            SampleValue::Bytes(_) => "bytes",
            SampleValue::Timestamp(_) => "timestamp",
            SampleValue::Uuid(_) => "uuid",
            SampleValue::Array(_) => "array",
        }
    }
}

mod base64_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::decode(&encoded).map_err(D::Error::custom)
    }
}
