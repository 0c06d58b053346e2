use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Properties;

/// One captured analytics event. Appended to a ledger by the client facades
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimEvent {
    pub event: String,
    /// Distinct id active on the capturing client (or given to the server client).
    pub distinct_id: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

/// Session-replay payload, same lifecycle as `SimEvent`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimSnapshot {
    pub snapshot_data: serde_json::Value,
    pub session_id: String,
    pub window_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Person ledger: events in the order they were captured.
pub type EventLog = Vec<SimEvent>;

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn event(name: &str, minute: u32) -> SimEvent {
        let mut properties = Properties::new();
        properties.insert("$current_url".into(), json!("https://hedgebox.net/"));
        properties.insert("$lib".into(), json!("web"));
        SimEvent {
            event: name.to_string(),
            distinct_id: "anon-1".into(),
            properties,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 9, minute, 0).unwrap(),
        }
    }

    #[test]
    fn sim_event_serializes_name_properties_and_rfc3339_timestamp() {
        let json = serde_json::to_string(&event("$pageview", 5)).unwrap();
        assert_eq!(
            json,
            r#"{"event":"$pageview","distinct_id":"anon-1","properties":{"$current_url":"https://hedgebox.net/","$lib":"web"},"timestamp":"2024-01-01T09:05:00Z"}"#
        );
    }

    #[test]
    fn properties_keep_insertion_order() {
        let mut properties = Properties::new();
        properties.insert("zeta".into(), json!(1));
        properties.insert("alpha".into(), json!(2));
        let keys: Vec<&String> = properties.keys().collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }
}
