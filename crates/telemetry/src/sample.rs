use super::SampleValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One value-change record produced by a monitored item.
///
/// A Sample is immutable once it enters the ingress queue. Its camelCase
/// serde names are a contract: dashboard consumers read the same field names
/// from the primary store, and fallback files carry one serialized Sample
/// per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Identifier of the server configuration which produced this sample.
    pub server_id: String,
    pub server_name: String,
    /// Receive time, stamped at notification-handler entry.
    pub timestamp_utc: DateTime<Utc>,
    pub node_id: String,
    pub display_name: String,
    /// Hierarchical browse path of the node, or the node id / display name
    /// when no path is configured for it.
    pub browse_path: String,
    /// Declared OPC UA data type name, e.g. "Double" or "UInt16".
    pub data_type: String,
    pub value: SampleValue,
    pub status_code: u32,
    pub quality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn fixture() -> Sample {
        Sample {
            server_id: "plc-1".to_string(),
            server_name: "Line 1 PLC".to_string(),
            timestamp_utc: Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap(),
            node_id: "ns=2;s=Line1.Temperature".to_string(),
            display_name: "Temperature".to_string(),
            browse_path: "Plant/Line1/Temperature".to_string(),
            data_type: "Double".to_string(),
            value: SampleValue::Float(21.5),
            status_code: 0,
            quality: "Good".to_string(),
            source_timestamp: Some(Utc.with_ymd_and_hms(2024, 5, 17, 9, 29, 59).unwrap()),
            server_timestamp: None,
        }
    }

    #[test]
    fn serialized_field_names_are_contract() {
        let encoded = serde_json::to_value(fixture()).unwrap();
        let object = encoded.as_object().unwrap();
        for field in [
            "serverId",
            "serverName",
            "timestampUtc",
            "nodeId",
            "displayName",
            "browsePath",
            "dataType",
            "value",
            "statusCode",
            "quality",
            "sourceTimestamp",
        ] {
            assert!(object.contains_key(field), "missing {field}");
        }
        // Absent optionals are omitted entirely, not serialized as null.
        assert!(!object.contains_key("serverTimestamp"));
    }

    #[test]
    fn line_round_trip_is_value_equal() {
        let sample = fixture();
        let line = serde_json::to_string(&sample).unwrap();
        assert!(!line.contains('\n'));
        let back: Sample = serde_json::from_str(&line).unwrap();
        assert_eq!(sample, back);
    }
}
