use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::events::{EventLog, SimEvent, SimSnapshot};
use crate::randomization::{Address, Device, RandomStream};
use crate::types::{ClusterIndex, GridPos, Properties, WakeBy, seconds};

pub const NEED_MIN: f64 = 0.0;
pub const NEED_MAX: f64 = 1.0;
pub const SATISFACTION_MIN: f64 = -1.0;
pub const SATISFACTION_MAX: f64 = 1.0;

/// Sticky per-person client state the `SimClient` facade reads and writes.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub device_id: String,
    pub device: Device,
    pub active_distinct_id: String,
    pub session_id: Option<String>,
    pub window_id: Option<String>,
    pub current_url: Option<String>,
    pub super_properties: Properties,
    /// group type → group key, attached to captures as `$groups`.
    pub groups: Properties,
    pub feature_flags: Properties,
}

/// Ledger lengths and person properties at the moment the cluster clock crossed "now".
#[derive(Debug, Clone, PartialEq)]
struct NowSnapshot {
    events: usize,
    snapshots: usize,
    properties: Properties,
}

/// Everything about a simulated person that the engine owns, independent of
/// the product behaviour attached to it.
#[derive(Debug)]
pub struct PersonState {
    pub id: Uuid,
    /// Owning cluster (back-reference by index).
    pub cluster: ClusterIndex,
    pub pos: GridPos,
    pub kernel: bool,
    pub name: String,
    pub email: String,
    /// Fixed propensity in [0, 1], drawn once at creation.
    pub affinity: f64,
    pub address: Address,
    need: f64,
    satisfaction: f64,
    simulation_time: DateTime<Utc>,
    wake_by: WakeBy,
    pub(crate) client: ClientState,
    events: EventLog,
    snapshots: Vec<SimSnapshot>,
    distinct_ids: Vec<String>,
    /// Index into `distinct_ids` of the id the person is known by.
    primary_distinct_id: usize,
    properties: Properties,
    now_snapshot: Option<NowSnapshot>,
    session_count: u32,
}

impl PersonState {
    /// Draw a person's constant traits from the cluster stream.
    pub fn generate(
        cluster: ClusterIndex,
        pos: GridPos,
        kernel: bool,
        born_at: DateTime<Utc>,
        random: &mut RandomStream,
    ) -> Self {
        let id = random.roll_uuidt(born_at);
        let name = random.full_name();
        let email = random.email(&name, None);
        let affinity = random.beta(1.8, 1.2);
        let address = random.address();
        let device = random.device();
        let device_id = random.roll_uuidt(born_at).to_string();
        let need = random.uniform_range(0.0, 0.4);
        let satisfaction = random.uniform_range(-0.1, 0.3);
        PersonState {
            id,
            cluster,
            pos,
            kernel,
            name,
            email,
            affinity,
            address,
            need,
            satisfaction,
            simulation_time: born_at,
            wake_by: WakeBy::Never,
            client: ClientState {
                active_distinct_id: device_id.clone(),
                device_id: device_id.clone(),
                device,
                session_id: None,
                window_id: None,
                current_url: None,
                super_properties: Properties::new(),
                groups: Properties::new(),
                feature_flags: Properties::new(),
            },
            events: Vec::new(),
            snapshots: Vec::new(),
            distinct_ids: vec![device_id],
            primary_distinct_id: 0,
            properties: Properties::new(),
            now_snapshot: None,
            session_count: 0,
        }
    }

    // ── Bounded internal state ────────────────────────────────────────────────

    pub fn need(&self) -> f64 {
        self.need
    }

    /// Clamped to [NEED_MIN, NEED_MAX] on every write.
    pub fn set_need(&mut self, value: f64) {
        self.need = clamp(value, NEED_MIN, NEED_MAX, self.need);
    }

    pub fn adjust_need(&mut self, delta: f64) {
        self.set_need(self.need + delta);
    }

    pub fn satisfaction(&self) -> f64 {
        self.satisfaction
    }

    /// Clamped to [SATISFACTION_MIN, SATISFACTION_MAX] on every write.
    pub fn set_satisfaction(&mut self, value: f64) {
        self.satisfaction = clamp(value, SATISFACTION_MIN, SATISFACTION_MAX, self.satisfaction);
    }

    pub fn adjust_satisfaction(&mut self, delta: f64) {
        self.set_satisfaction(self.satisfaction + delta);
    }

    // ── Clock ─────────────────────────────────────────────────────────────────

    pub fn simulation_time(&self) -> DateTime<Utc> {
        self.simulation_time
    }

    /// Move the local clock forward. The only way time passes inside a session.
    pub fn advance_timer(&mut self, secs: f64) {
        self.simulation_time += seconds(secs);
    }

    /// Catch the local clock up with the cluster clock. Never moves it backward.
    pub(crate) fn sync_clock(&mut self, t: DateTime<Utc>) {
        if t > self.simulation_time {
            self.simulation_time = t;
        }
    }

    pub fn wake_by(&self) -> WakeBy {
        self.wake_by
    }

    pub(crate) fn set_wake_by(&mut self, wake_by: WakeBy) {
        self.wake_by = wake_by;
    }

    /// Pull the next session earlier (or revive a dormant person); never pushes it later.
    pub fn wake_no_later_than(&mut self, t: DateTime<Utc>) {
        if WakeBy::At(t) < self.wake_by {
            self.wake_by = WakeBy::At(t);
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub(crate) fn start_session(&mut self, random: &mut RandomStream, feature_flags: Properties) {
        let at = self.simulation_time;
        self.client.session_id = Some(random.roll_uuidt(at).to_string());
        self.client.window_id = Some(random.roll_uuidt(at).to_string());
        self.client.current_url = None;
        self.client.feature_flags = feature_flags;
        self.session_count += 1;
    }

    pub(crate) fn end_session(&mut self) {
        self.client.session_id = None;
        self.client.window_id = None;
        self.client.current_url = None;
    }

    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    pub fn in_session(&self) -> bool {
        self.client.session_id.is_some()
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    /// The id the person is known by: the last identified id, or the device id
    /// for people who never identified.
    pub fn distinct_id(&self) -> &str {
        &self.distinct_ids[self.primary_distinct_id]
    }

    pub fn distinct_ids(&self) -> &[String] {
        &self.distinct_ids
    }

    pub fn active_distinct_id(&self) -> &str {
        &self.client.active_distinct_id
    }

    pub(crate) fn add_distinct_id(&mut self, distinct_id: &str) -> usize {
        match self.distinct_ids.iter().position(|d| d == distinct_id) {
            Some(i) => i,
            None => {
                self.distinct_ids.push(distinct_id.to_string());
                self.distinct_ids.len() - 1
            }
        }
    }

    pub(crate) fn set_primary_distinct_id(&mut self, distinct_id: &str) {
        self.primary_distinct_id = self.add_distinct_id(distinct_id);
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub(crate) fn merge_properties(&mut self, set: &Properties) {
        for (k, v) in set {
            self.properties.insert(k.clone(), v.clone());
        }
    }

    pub fn device(&self) -> &Device {
        &self.client.device
    }

    pub fn current_url(&self) -> Option<&str> {
        self.client.current_url.as_deref()
    }

    /// Variant of `flag` in the current session, if the flag is active.
    pub fn feature_flag(&self, flag: &str) -> Option<&serde_json::Value> {
        self.client.feature_flags.get(flag)
    }

    // ── Ledger ────────────────────────────────────────────────────────────────

    pub(crate) fn record_event(&mut self, event: SimEvent) {
        self.events.push(event);
    }

    pub(crate) fn record_snapshot(&mut self, snapshot: SimSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn all_events(&self) -> &[SimEvent] {
        &self.events
    }

    /// Events captured before the cluster clock crossed "now".
    /// Before the snapshot is taken every event counts as past.
    pub fn past_events(&self) -> &[SimEvent] {
        let cut = self.now_snapshot.as_ref().map_or(self.events.len(), |s| s.events);
        &self.events[..cut]
    }

    pub fn future_events(&self) -> &[SimEvent] {
        let cut = self.now_snapshot.as_ref().map_or(self.events.len(), |s| s.events);
        &self.events[cut..]
    }

    pub fn all_snapshots(&self) -> &[SimSnapshot] {
        &self.snapshots
    }

    pub fn past_snapshots(&self) -> &[SimSnapshot] {
        let cut = self.now_snapshot.as_ref().map_or(self.snapshots.len(), |s| s.snapshots);
        &self.snapshots[..cut]
    }

    /// Person properties as they were at "now"; current properties if not yet reached.
    pub fn properties_at_now(&self) -> &Properties {
        self.now_snapshot.as_ref().map_or(&self.properties, |s| &s.properties)
    }

    pub fn has_now_snapshot(&self) -> bool {
        self.now_snapshot.is_some()
    }

    /// Partition the ledger at its current length. Only the first call counts.
    pub fn take_now_snapshot(&mut self) {
        if self.now_snapshot.is_none() {
            self.now_snapshot = Some(NowSnapshot {
                events: self.events.len(),
                snapshots: self.snapshots.len(),
                properties: self.properties.clone(),
            });
        }
    }

    pub fn first_seen_at(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.timestamp)
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }
}

/// NaN writes keep the previous value.
fn clamp(value: f64, min: f64, max: f64, previous: f64) -> f64 {
    if value.is_nan() { previous } else { value.clamp(min, max) }
}

/// A person in a cluster grid: engine-owned state plus the product behaviour.
#[derive(Debug)]
pub struct SimPerson<B> {
    pub state: PersonState,
    pub behavior: B,
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    pub(crate) fn person_at(t: DateTime<Utc>) -> PersonState {
        let mut random = RandomStream::from_seed("person-tests");
        PersonState::generate(ClusterIndex(0), GridPos::new(0, 0), false, t, &mut random)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn generated_person_starts_within_bounds() {
        let p = person_at(t0());
        assert!((NEED_MIN..=NEED_MAX).contains(&p.need()));
        assert!((SATISFACTION_MIN..=SATISFACTION_MAX).contains(&p.satisfaction()));
        assert!((0.0..=1.0).contains(&p.affinity));
        assert_eq!(p.distinct_id(), p.client.device_id);
        assert_eq!(p.wake_by(), WakeBy::Never);
    }

    #[test]
    fn setters_clamp_out_of_range_values() {
        let mut p = person_at(t0());
        p.set_need(4.2);
        assert_eq!(p.need(), NEED_MAX);
        p.set_need(-0.5);
        assert_eq!(p.need(), NEED_MIN);
        p.set_satisfaction(-7.0);
        assert_eq!(p.satisfaction(), SATISFACTION_MIN);
        p.set_satisfaction(1.0001);
        assert_eq!(p.satisfaction(), SATISFACTION_MAX);
    }

    #[test]
    fn nan_write_keeps_previous_value() {
        let mut p = person_at(t0());
        p.set_need(0.25);
        p.set_need(f64::NAN);
        assert_eq!(p.need(), 0.25);
    }

    proptest! {
        #[test]
        fn need_and_satisfaction_stay_bounded(deltas in prop::collection::vec((-3.0f64..3.0, -3.0f64..3.0), 1..64)) {
            let mut p = person_at(t0());
            for (dn, ds) in deltas {
                p.adjust_need(dn);
                prop_assert!((NEED_MIN..=NEED_MAX).contains(&p.need()));
                p.adjust_satisfaction(ds);
                prop_assert!((SATISFACTION_MIN..=SATISFACTION_MAX).contains(&p.satisfaction()));
            }
        }
    }

    #[test]
    fn advance_timer_only_moves_forward() {
        let mut p = person_at(t0());
        p.advance_timer(90.5);
        assert_eq!(p.simulation_time(), t0() + chrono::Duration::milliseconds(90_500));
        p.advance_timer(-30.0);
        assert_eq!(p.simulation_time(), t0() + chrono::Duration::milliseconds(90_500));
    }

    #[test]
    fn sync_clock_never_rewinds() {
        let mut p = person_at(t0());
        p.advance_timer(3_600.0);
        p.sync_clock(t0());
        assert_eq!(p.simulation_time(), t0() + chrono::Duration::hours(1));
        p.sync_clock(t0() + chrono::Duration::hours(2));
        assert_eq!(p.simulation_time(), t0() + chrono::Duration::hours(2));
    }

    #[test]
    fn wake_no_later_than_revives_dormant_but_never_postpones() {
        let mut p = person_at(t0());
        p.set_wake_by(WakeBy::Never);
        p.wake_no_later_than(t0() + chrono::Duration::days(2));
        assert_eq!(p.wake_by(), WakeBy::At(t0() + chrono::Duration::days(2)));
        p.wake_no_later_than(t0() + chrono::Duration::days(5));
        assert_eq!(p.wake_by(), WakeBy::At(t0() + chrono::Duration::days(2)));
    }

    #[test]
    fn now_snapshot_partitions_ledger_once() {
        let mut p = person_at(t0());
        let ev = |name: &str| SimEvent {
            event: name.to_string(),
            distinct_id: "d".into(),
            properties: Properties::new(),
            timestamp: t0(),
        };
        p.record_event(ev("a"));
        p.record_event(ev("b"));
        assert_eq!(p.past_events().len(), 2, "all events are past before the snapshot");
        p.take_now_snapshot();
        p.record_event(ev("c"));
        p.take_now_snapshot(); // second call must not move the boundary
        assert_eq!(p.past_events().len(), 2);
        assert_eq!(p.future_events().len(), 1);
        assert_eq!(p.future_events()[0].event, "c");
        assert_eq!(p.all_events().len(), 3);
    }

    #[test]
    fn properties_at_now_freeze_at_snapshot() {
        let mut p = person_at(t0());
        let mut set = Properties::new();
        set.insert("plan".into(), serde_json::json!("free"));
        p.merge_properties(&set);
        p.take_now_snapshot();
        set.insert("plan".into(), serde_json::json!("pro"));
        p.merge_properties(&set);
        assert_eq!(p.properties_at_now()["plan"], "free");
        assert_eq!(p.properties()["plan"], "pro");
    }

    #[test]
    fn session_ids_are_set_and_cleared() {
        let mut p = person_at(t0());
        let mut random = RandomStream::from_seed("sessions");
        assert!(!p.in_session());
        p.start_session(&mut random, Properties::new());
        assert!(p.in_session());
        assert_eq!(p.session_count(), 1);
        p.end_session();
        assert!(!p.in_session());
    }
}
