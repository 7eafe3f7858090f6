use chrono::{DateTime, Utc};
use serde_json::Value;

/// One completed-game record as it exists in the source store: unique key,
/// verbatim payload JSON, creation time. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: String,
    pub game_json: String,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    /// Decode one export entry. `fallback_key` covers dump shapes keyed by
    /// source key at the top level; `fallback_created_at` covers entries
    /// without their own timestamp. Returns None when the entry has no usable
    /// key or payload (the caller counts it as malformed).
    pub fn from_export_value(
        v: &Value,
        fallback_key: Option<&str>,
        fallback_created_at: DateTime<Utc>,
    ) -> Option<RawRecord> {
        let key = v
            .get("firebaseKey")
            .and_then(|k| k.as_str())
            .or(fallback_key)?
            .trim()
            .to_string();
        if key.is_empty() {
            return None;
        }
        // gameJson is normally a string of JSON; tolerate dumps that inline
        // the object and re-serialize those verbatim.
        let game_json = match v.get("gameJson") {
            Some(Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => return None,
        };
        let created_at = v
            .get("createdAt")
            .and_then(parse_timestamp_value)
            .unwrap_or(fallback_created_at);
        Some(RawRecord {
            key,
            game_json,
            created_at,
        })
    }
}

/// RFC 3339 string or integer epoch millis.
pub(crate) fn parse_timestamp_value(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = v.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    if let Some(ms) = v.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    None
}

/// Bundled fixture games for `seed` (local development). Routed through the
/// normal transform/write path so seeded rows look exactly like ingested ones.
pub fn demo_records() -> Vec<RawRecord> {
    const DEMOS: &[(&str, &str, &str)] = &[
        (
            "demo-0001",
            r#"{"players":[{"uid":"alice"},{"uid":"bob"},{"uid":"carol"},{"uid":"dave"},{"uid":"erin"}],"missions":[true,false,true,true],"winner":"resistance"}"#,
            "2024-01-05T18:00:00Z",
        ),
        (
            "demo-0002",
            r#"{"players":[{"uid":"alice"},{"uid":"frank"},{"uid":"grace"},{"uid":"bob"},{"uid":"heidi"}],"missions":[false,false,true,false],"winner":"spies"}"#,
            "2024-01-06T20:15:00Z",
        ),
        (
            "demo-0003",
            r#"{"players":[{"uid":"carol"},{"uid":"dave"},{"uid":"erin"},{"uid":"frank"},{"uid":"grace"}],"missions":[true,true,false,true],"winner":"resistance"}"#,
            "2024-01-07T21:40:00Z",
        ),
    ];

    DEMOS
        .iter()
        .map(|(key, payload, ts)| RawRecord {
            key: (*key).to_string(),
            game_json: (*payload).to_string(),
            created_at: DateTime::parse_from_rfc3339(ts)
                .expect("static fixture timestamp")
                .with_timezone(&Utc),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_record_object() {
        let v = json!({
            "firebaseKey": "K1",
            "gameJson": "{\"players\":[]}",
            "createdAt": "2023-05-01T12:00:00Z"
        });
        let rec = RawRecord::from_export_value(&v, None, DateTime::UNIX_EPOCH).unwrap();
        assert_eq!(rec.key, "K1");
        assert_eq!(rec.game_json, "{\"players\":[]}");
        assert_eq!(rec.created_at.to_rfc3339(), "2023-05-01T12:00:00+00:00");
    }

    #[test]
    fn falls_back_to_map_key_and_timestamp() {
        let v = json!({ "gameJson": "{}" });
        let rec = RawRecord::from_export_value(&v, Some("K2"), DateTime::UNIX_EPOCH).unwrap();
        assert_eq!(rec.key, "K2");
        assert_eq!(rec.created_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn epoch_millis_timestamps_accepted() {
        let v = json!({ "firebaseKey": "K3", "gameJson": "{}", "createdAt": 1700000000000i64 });
        let rec = RawRecord::from_export_value(&v, None, DateTime::UNIX_EPOCH).unwrap();
        assert_eq!(rec.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn inline_payload_objects_are_reserialized() {
        let v = json!({ "firebaseKey": "K4", "gameJson": {"players": []} });
        let rec = RawRecord::from_export_value(&v, None, DateTime::UNIX_EPOCH).unwrap();
        assert_eq!(rec.game_json, "{\"players\":[]}");
    }

    #[test]
    fn missing_key_or_payload_is_rejected() {
        assert!(RawRecord::from_export_value(&json!({"gameJson": "{}"}), None, DateTime::UNIX_EPOCH).is_none());
        assert!(RawRecord::from_export_value(&json!({"firebaseKey": "K5"}), None, DateTime::UNIX_EPOCH).is_none());
    }
}
