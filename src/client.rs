use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::InvariantViolation;
use crate::events::{SimEvent, SimSnapshot};
use crate::groups::GroupRegistry;
use crate::person::PersonState;
use crate::randomization::RandomStream;
use crate::types::Properties;

const WEB_LIB: &str = "web";
const SERVER_LIB: &str = "posthog-python";

/// Browser-side analytics client for one person.
///
/// Borrowed for a single call site inside a session or effect; all state it
/// keeps between calls lives on the person (`ClientState`). Capture methods
/// never fail.
pub struct SimClient<'a> {
    person: &'a mut PersonState,
    random: &'a mut RandomStream,
    groups: &'a mut GroupRegistry,
}

impl<'a> SimClient<'a> {
    pub fn new(
        person: &'a mut PersonState,
        random: &'a mut RandomStream,
        groups: &'a mut GroupRegistry,
    ) -> Self {
        SimClient { person, random, groups }
    }

    pub fn capture(&mut self, event: &str, properties: Option<Properties>) {
        let props = self.base_properties(properties.unwrap_or_default());
        let record = SimEvent {
            event: event.to_string(),
            distinct_id: self.person.client.active_distinct_id.clone(),
            properties: props,
            timestamp: self.person.simulation_time(),
        };
        self.person.record_event(record);
    }

    /// Navigate to `url` (with optional query parameters) and capture `$pageview`.
    pub fn capture_pageview(&mut self, url: &str, query_params: Option<&[(&str, &str)]>) {
        let full_url = match query_params {
            Some(params) if !params.is_empty() => {
                let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("{url}?{}", query.join("&"))
            }
            _ => url.to_string(),
        };
        self.person.client.current_url = Some(full_url);
        self.capture("$pageview", None);
    }

    /// Switch to `distinct_id`, attach it to the person and merge `$set` properties.
    pub fn identify(&mut self, distinct_id: &str, set_properties: Option<Properties>) {
        let previous = self.person.client.active_distinct_id.clone();
        let set = set_properties.unwrap_or_default();
        self.person.set_primary_distinct_id(distinct_id);
        self.person.client.active_distinct_id = distinct_id.to_string();
        self.person.merge_properties(&set);

        let mut props = Properties::new();
        if previous != distinct_id {
            props.insert("$anon_distinct_id".into(), json!(previous));
        }
        if !set.is_empty() {
            props.insert("$set".into(), Value::Object(set));
        }
        self.capture("$identify", Some(props));
    }

    /// Associate the person with a group and merge `set_properties` into the group.
    pub fn group(
        &mut self,
        group_type: &str,
        group_key: &str,
        set_properties: Option<Properties>,
    ) -> Result<(), InvariantViolation> {
        let set = set_properties.unwrap_or_default();
        self.groups.set(group_type, group_key, &set)?;
        self.person.client.groups.insert(group_type.to_string(), json!(group_key));

        let mut props = Properties::new();
        props.insert("$group_type".into(), json!(group_type));
        props.insert("$group_key".into(), json!(group_key));
        props.insert("$group_set".into(), Value::Object(set));
        self.capture("$groupidentify", Some(props));
        Ok(())
    }

    /// Stop attaching `group_type` to captures. The group itself is untouched.
    pub fn ungroup(&mut self, group_type: &str) {
        self.person.client.groups.remove(group_type);
    }

    /// Super properties: attached to every later capture until unregistered.
    pub fn register(&mut self, properties: Properties) {
        self.person.client.super_properties.extend(properties);
    }

    pub fn unregister(&mut self, key: &str) {
        self.person.client.super_properties.remove(key);
    }

    /// Log out: fresh anonymous id, no super properties, no groups.
    pub fn reset(&mut self) {
        let anonymous_id = self.random.roll_uuidt(self.person.simulation_time()).to_string();
        self.person.add_distinct_id(&anonymous_id);
        let client = &mut self.person.client;
        client.active_distinct_id = anonymous_id;
        client.super_properties.clear();
        client.groups.clear();
    }

    pub fn capture_snapshot(&mut self, snapshot_data: Value) {
        let client = &self.person.client;
        let session_id = client.session_id.clone().unwrap_or_else(|| client.device_id.clone());
        let window_id = client.window_id.clone().unwrap_or_else(|| session_id.clone());
        let snapshot = SimSnapshot {
            snapshot_data,
            session_id,
            window_id,
            timestamp: self.person.simulation_time(),
        };
        self.person.record_snapshot(snapshot);
    }

    /// Client context first, caller's properties last so they win.
    fn base_properties(&self, caller: Properties) -> Properties {
        let person = &*self.person;
        let client = &person.client;
        let mut props = Properties::new();
        props.insert("$lib".into(), json!(WEB_LIB));
        props.insert("$device_id".into(), json!(client.device_id));
        props.insert("$device_type".into(), json!(client.device.device_type));
        props.insert("$os".into(), json!(client.device.os));
        props.insert("$browser".into(), json!(client.device.browser));
        props.insert("$screen_width".into(), json!(client.device.screen_width));
        props.insert("$screen_height".into(), json!(client.device.screen_height));
        props.insert("$geoip_country_code".into(), json!(person.address.country_code));
        props.insert("$geoip_city_name".into(), json!(person.address.city));
        if let Some(session_id) = &client.session_id {
            props.insert("$session_id".into(), json!(session_id));
        }
        if let Some(window_id) = &client.window_id {
            props.insert("$window_id".into(), json!(window_id));
        }
        if let Some(url) = &client.current_url {
            let (host, pathname) = split_url(url);
            props.insert("$current_url".into(), json!(url));
            props.insert("$host".into(), json!(host));
            props.insert("$pathname".into(), json!(pathname));
        }
        for (k, v) in &client.super_properties {
            props.insert(k.clone(), v.clone());
        }
        if !client.groups.is_empty() {
            props.insert("$groups".into(), Value::Object(client.groups.clone()));
        }
        if !client.feature_flags.is_empty() {
            let mut active = Vec::new();
            for (flag, variant) in &client.feature_flags {
                props.insert(format!("$feature/{flag}"), variant.clone());
                if *variant != Value::Bool(false) {
                    active.push(json!(flag));
                }
            }
            props.insert("$active_feature_flags".into(), Value::Array(active));
        }
        props.extend(caller);
        props
    }
}

/// `https://host/path?query` → (`host`, `/path`).
fn split_url(url: &str) -> (&str, &str) {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    }
}

/// Backend-side client. One per cluster; its ledger is merged into the matrix
/// in cluster order once simulation completes.
#[derive(Debug, Clone, Default)]
pub struct SimServerClient {
    events: Vec<SimEvent>,
}

impl SimServerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(
        &mut self,
        event: &str,
        properties: Option<Properties>,
        distinct_id: &str,
        timestamp: DateTime<Utc>,
    ) {
        let mut props = Properties::new();
        props.insert("$lib".into(), json!(SERVER_LIB));
        props.extend(properties.unwrap_or_default());
        self.events.push(SimEvent {
            event: event.to_string(),
            distinct_id: distinct_id.to_string(),
            properties: props,
            timestamp,
        });
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::groups::MAX_GROUP_TYPES;
    use crate::person::tests::person_at;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn fixture() -> (PersonState, RandomStream, GroupRegistry) {
        (person_at(t0()), RandomStream::from_seed("client-tests"), GroupRegistry::new())
    }

    #[test]
    fn capture_without_session_uses_defaults() {
        let (mut person, mut random, mut groups) = fixture();
        SimClient::new(&mut person, &mut random, &mut groups).capture("opened_app", None);
        let ev = &person.all_events()[0];
        assert_eq!(ev.event, "opened_app");
        assert_eq!(ev.properties["$lib"], "web");
        assert!(ev.properties.get("$session_id").is_none());
        assert_eq!(ev.distinct_id, person.distinct_id());
        assert_eq!(ev.timestamp, t0());
    }

    #[test]
    fn capture_inside_session_carries_ids_and_flags() {
        let (mut person, mut random, mut groups) = fixture();
        let mut flags = Properties::new();
        flags.insert("signup-page-4.0".into(), json!("test"));
        flags.insert("file-previews".into(), json!(false));
        person.start_session(&mut random, flags);

        SimClient::new(&mut person, &mut random, &mut groups).capture("x", None);
        let props = &person.all_events()[0].properties;
        assert!(props.get("$session_id").is_some());
        assert!(props.get("$window_id").is_some());
        assert_eq!(props["$feature/signup-page-4.0"], "test");
        assert_eq!(props["$feature/file-previews"], false);
        assert_eq!(props["$active_feature_flags"], json!(["signup-page-4.0"]));
    }

    #[test]
    fn caller_properties_override_client_context() {
        let (mut person, mut random, mut groups) = fixture();
        let mut client = SimClient::new(&mut person, &mut random, &mut groups);
        let mut supers = Properties::new();
        supers.insert("plan".into(), json!("free"));
        client.register(supers);
        let mut mine = Properties::new();
        mine.insert("plan".into(), json!("pro"));
        mine.insert("$lib".into(), json!("custom"));
        client.capture("upgraded_plan", Some(mine));
        let props = &person.all_events()[0].properties;
        assert_eq!(props["plan"], "pro");
        assert_eq!(props["$lib"], "custom");
    }

    #[test]
    fn pageview_sets_url_host_and_path() {
        let (mut person, mut random, mut groups) = fixture();
        SimClient::new(&mut person, &mut random, &mut groups)
            .capture_pageview("https://hedgebox.net/files/", Some(&[("sort", "name")]));
        let props = &person.all_events()[0].properties;
        assert_eq!(person.all_events()[0].event, "$pageview");
        assert_eq!(props["$current_url"], "https://hedgebox.net/files/?sort=name");
        assert_eq!(props["$host"], "hedgebox.net");
        assert_eq!(props["$pathname"], "/files/");
        assert_eq!(person.current_url(), Some("https://hedgebox.net/files/?sort=name"));
    }

    #[test]
    fn identify_switches_distinct_id_and_sets_properties() {
        let (mut person, mut random, mut groups) = fixture();
        let anon = person.distinct_id().to_string();
        let mut set = Properties::new();
        set.insert("email".into(), json!("ada@hedgebox.net"));
        SimClient::new(&mut person, &mut random, &mut groups).identify("user-1", Some(set));

        assert_eq!(person.distinct_id(), "user-1");
        assert_eq!(person.active_distinct_id(), "user-1");
        assert_eq!(person.distinct_ids(), [anon.clone(), "user-1".to_string()]);
        assert_eq!(person.properties()["email"], "ada@hedgebox.net");
        let ev = &person.all_events()[0];
        assert_eq!(ev.event, "$identify");
        assert_eq!(ev.distinct_id, "user-1");
        assert_eq!(ev.properties["$anon_distinct_id"], json!(anon));
    }

    #[test]
    fn reset_rotates_anonymous_id_but_keeps_primary() {
        let (mut person, mut random, mut groups) = fixture();
        let mut client = SimClient::new(&mut person, &mut random, &mut groups);
        client.identify("user-1", None);
        client.group("company", "acme.io", None).unwrap();
        client.reset();
        client.capture("after_reset", None);
        let ev = person.all_events().last().unwrap();
        assert_ne!(ev.distinct_id, "user-1");
        assert_eq!(person.active_distinct_id(), ev.distinct_id);
        assert!(ev.properties.get("$groups").is_none());
        assert_eq!(person.distinct_id(), "user-1");
        assert_eq!(person.distinct_ids().len(), 3);
    }

    #[test]
    fn group_writes_registry_and_tags_later_captures() {
        let (mut person, mut random, mut groups) = fixture();
        let mut set = Properties::new();
        set.insert("name".into(), json!("Acme"));
        let mut client = SimClient::new(&mut person, &mut random, &mut groups);
        client.group("company", "acme.io", Some(set)).unwrap();
        client.capture("x", None);
        assert_eq!(groups.properties("company", "acme.io").unwrap()["name"], "Acme");
        assert_eq!(person.all_events()[0].event, "$groupidentify");
        assert_eq!(person.all_events()[1].properties["$groups"]["company"], "acme.io");
    }

    #[test]
    fn ungroup_stops_tagging_but_keeps_registry() {
        let (mut person, mut random, mut groups) = fixture();
        let mut client = SimClient::new(&mut person, &mut random, &mut groups);
        client.group("company", "acme.io", None).unwrap();
        client.group("account", "a-1", None).unwrap();
        client.ungroup("account");
        client.capture("after", None);
        let ev = person.all_events().last().unwrap();
        assert_eq!(ev.properties["$groups"]["company"], "acme.io");
        assert!(ev.properties["$groups"].get("account").is_none());
        assert!(groups.properties("account", "a-1").is_some());
    }

    #[test]
    fn group_type_limit_is_an_invariant_violation() {
        let (mut person, mut random, mut groups) = fixture();
        let mut client = SimClient::new(&mut person, &mut random, &mut groups);
        for i in 0..MAX_GROUP_TYPES {
            client.group(&format!("t{i}"), "k", None).unwrap();
        }
        assert!(matches!(
            client.group("t-extra", "k", None),
            Err(InvariantViolation::TooManyGroupTypes { .. })
        ));
    }

    #[test]
    fn snapshot_without_session_falls_back_to_device_id() {
        let (mut person, mut random, mut groups) = fixture();
        SimClient::new(&mut person, &mut random, &mut groups).capture_snapshot(json!({"type": 2}));
        let snap = &person.all_snapshots()[0];
        assert_eq!(snap.session_id, person.client.device_id);
        assert_eq!(snap.window_id, snap.session_id);
    }

    #[test]
    fn server_client_records_explicit_distinct_id() {
        let mut server = SimServerClient::new();
        let mut props = Properties::new();
        props.insert("amount_usd".into(), json!(10));
        server.capture("paid_bill", Some(props), "user-9", t0());
        assert_eq!(server.len(), 1);
        let ev = &server.events()[0];
        assert_eq!(ev.distinct_id, "user-9");
        assert_eq!(ev.properties["$lib"], SERVER_LIB);
        assert_eq!(ev.properties["amount_usd"], 10);
    }
}
