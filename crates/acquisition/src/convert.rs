//! Conversion of OPC UA variants into sample values. Integer widths widen
//! to 64 bits; the declared type name is preserved alongside the value.

use opcua::types::Variant;
use telemetry::SampleValue;

pub fn variant_value(variant: &Variant) -> SampleValue {
    match variant {
        Variant::Empty => SampleValue::Null,
        Variant::Boolean(value) => SampleValue::Bool(*value),
        Variant::SByte(value) => SampleValue::Int(i64::from(*value)),
        Variant::Int16(value) => SampleValue::Int(i64::from(*value)),
        Variant::Int32(value) => SampleValue::Int(i64::from(*value)),
        Variant::Int64(value) => SampleValue::Int(*value),
        Variant::Byte(value) => SampleValue::UInt(u64::from(*value)),
        Variant::UInt16(value) => SampleValue::UInt(u64::from(*value)),
        Variant::UInt32(value) => SampleValue::UInt(u64::from(*value)),
        Variant::UInt64(value) => SampleValue::UInt(*value),
        Variant::Float(value) => SampleValue::Float(f64::from(*value)),
        Variant::Double(value) => SampleValue::Float(*value),
        Variant::String(value) => {
            SampleValue::String(value.value().clone().unwrap_or_default())
        }
        Variant::DateTime(value) => SampleValue::Timestamp(value.as_chrono()),
        Variant::Guid(value) => match uuid::Uuid::parse_str(&value.to_string()) {
            Ok(id) => SampleValue::Uuid(id),
            Err(_) => SampleValue::String(value.to_string()),
        },
        Variant::StatusCode(value) => SampleValue::UInt(u64::from(value.bits())),
        Variant::ByteString(value) => {
            SampleValue::Bytes(value.value.clone().unwrap_or_default())
        }
        Variant::QualifiedName(value) => {
            SampleValue::String(value.name.value().clone().unwrap_or_default())
        }
        Variant::LocalizedText(value) => {
            SampleValue::String(value.text.value().clone().unwrap_or_default())
        }
        Variant::NodeId(value) => SampleValue::String(value.to_string()),
        Variant::ExpandedNodeId(value) => SampleValue::String(value.to_string()),
        Variant::XmlElement(value) => SampleValue::String(value.to_string()),
        Variant::Array(array) => {
            SampleValue::Array(array.values.iter().map(variant_value).collect())
        }
        // Anything else has no natural document encoding; stringify it.
        other => SampleValue::String(format!("{other:?}")),
    }
}

/// The declared type name of a variant, e.g. "Double" or "UInt16".
pub fn data_type_name(variant: &Variant) -> String {
    format!("{:?}", variant.type_id())
}

#[cfg(test)]
mod test {
    use super::*;
    use opcua::types::{ByteString, LocalizedText, UAString};

    #[test]
    fn numeric_widths_widen() {
        assert_eq!(variant_value(&Variant::SByte(-3)), SampleValue::Int(-3));
        assert_eq!(variant_value(&Variant::Int16(-300)), SampleValue::Int(-300));
        assert_eq!(variant_value(&Variant::Byte(200)), SampleValue::UInt(200));
        assert_eq!(
            variant_value(&Variant::UInt64(u64::MAX)),
            SampleValue::UInt(u64::MAX)
        );
        assert_eq!(variant_value(&Variant::Float(1.5)), SampleValue::Float(1.5));
    }

    #[test]
    fn null_and_strings() {
        assert_eq!(variant_value(&Variant::Empty), SampleValue::Null);
        assert_eq!(
            variant_value(&Variant::String(UAString::from("ok"))),
            SampleValue::String("ok".to_string())
        );
        assert_eq!(
            variant_value(&Variant::String(UAString::null())),
            SampleValue::String(String::new())
        );
        assert_eq!(
            variant_value(&Variant::LocalizedText(Box::new(LocalizedText::new(
                "en", "running"
            )))),
            SampleValue::String("running".to_string())
        );
    }

    #[test]
    fn byte_strings_become_bytes() {
        assert_eq!(
            variant_value(&Variant::ByteString(ByteString::from(vec![1u8, 2, 3]))),
            SampleValue::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn arrays_convert_recursively() {
        let array = Variant::from(vec![1i32, 2, 3]);
        assert_eq!(
            variant_value(&array),
            SampleValue::Array(vec![
                SampleValue::Int(1),
                SampleValue::Int(2),
                SampleValue::Int(3),
            ])
        );
    }

    #[test]
    fn type_names_follow_the_variant() {
        assert_eq!(data_type_name(&Variant::Double(0.0)), "Double");
        assert_eq!(data_type_name(&Variant::UInt16(0)), "UInt16");
        assert_eq!(data_type_name(&Variant::Boolean(true)), "Boolean");
    }
}
