use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::behavior::{ClusterInfo, PersonBehavior, SessionContext, SpawnContext};
use crate::client::SimServerClient;
use crate::config::TimeWindow;
use crate::effects::{Effect, EffectQueue, Target};
use crate::error::InvariantViolation;
use crate::events::SimEvent;
use crate::groups::GroupRegistry;
use crate::person::{PersonState, SimPerson};
use crate::randomization::RandomStream;
use crate::types::{ClusterIndex, GridPos, WakeBy, seconds};

/// Counters reported by one `Cluster::simulate` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterOutcome {
    pub sessions: u64,
    pub effects_applied: u64,
    /// Effects whose target policy matched nobody.
    pub effects_without_target: u64,
    /// People whose last intent was `None`.
    pub dormant: usize,
}

/// A square grid of people sharing one random stream, one effect queue and
/// one clock. Independent of every other cluster.
#[derive(Debug)]
pub struct Cluster<B: PersonBehavior> {
    info: ClusterInfo,
    random: RandomStream,
    people: Vec<SimPerson<B>>,
    shared: B::Shared,
    effects: EffectQueue<B::Command, B::Condition>,
    groups: GroupRegistry,
    server: SimServerClient,
    clock: DateTime<Utc>,
    reached_now: bool,
    outcome: ClusterOutcome,
}

impl<B: PersonBehavior> Cluster<B> {
    pub fn new(
        index: ClusterIndex,
        seed: &str,
        window: &TimeWindow,
        max_radius: Option<usize>,
    ) -> Self {
        let mut random = RandomStream::for_cluster(seed, index);
        let radius = B::cluster_radius(&mut random, max_radius);
        let span_secs = (window.end - window.start).num_milliseconds() as f64 / 1_000.0;
        let fraction = B::initiation_fraction(&mut random).clamp(0.0, 1.0);
        let start = (window.start + seconds(span_secs * fraction)).min(window.end);
        let info = ClusterInfo { index, radius, start, now: window.now, end: window.end };

        let mut shared = B::new_shared(&info, &mut random);
        let side = info.side();
        let kernel = info.kernel();
        let mut people = Vec::with_capacity(side * side);
        for i in 0..side * side {
            let pos = GridPos::from_scan_index(i, side);
            let mut state = PersonState::generate(index, pos, pos == kernel, start, &mut random);
            let mut ctx = SpawnContext {
                info: &info,
                random: &mut random,
                shared: &mut shared,
                pos,
                kernel: pos == kernel,
            };
            let behavior = B::spawn(&mut state, &mut ctx);
            people.push(SimPerson { state, behavior });
        }

        for person in &mut people {
            let wake = person.behavior.determine_next_session_datetime(&person.state, start, &mut random);
            person.state.set_wake_by(WakeBy::At(wake.max(start)));
        }

        let mut cluster = Cluster {
            info,
            random,
            people,
            shared,
            effects: EffectQueue::new(),
            groups: GroupRegistry::new(),
            server: SimServerClient::new(),
            clock: start,
            reached_now: false,
            outcome: ClusterOutcome::default(),
        };
        if start >= cluster.info.now {
            cluster.take_now_snapshot();
        }
        cluster
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn index(&self) -> ClusterIndex {
        self.info.index
    }

    pub fn clock(&self) -> DateTime<Utc> {
        self.clock
    }

    /// People in scan order.
    pub fn people(&self) -> &[SimPerson<B>] {
        &self.people
    }

    pub fn person(&self, pos: GridPos) -> Option<&SimPerson<B>> {
        if pos.x >= self.info.side() || pos.y >= self.info.side() {
            return None;
        }
        self.people.get(pos.scan_index(self.info.side()))
    }

    pub fn shared(&self) -> &B::Shared {
        &self.shared
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn server_events(&self) -> &[SimEvent] {
        self.server.events()
    }

    pub fn pending_effects(&self) -> usize {
        self.effects.len()
    }

    pub fn outcome(&self) -> ClusterOutcome {
        self.outcome
    }

    /// Queue an effect from outside a session.
    pub fn schedule_effect(
        &mut self,
        at: DateTime<Utc>,
        source: GridPos,
        target: Target,
        condition: Option<B::Condition>,
        command: B::Command,
    ) {
        self.effects.schedule(at, source, target, condition, command);
    }

    /// Advance the cluster clock. Backward sets are ignored. The first time
    /// the clock reaches "now", every person's ledger is partitioned.
    pub fn set_clock(&mut self, t: DateTime<Utc>) {
        if t <= self.clock {
            return;
        }
        if !self.reached_now && t >= self.info.now {
            self.take_now_snapshot();
        }
        self.clock = t;
    }

    fn take_now_snapshot(&mut self) {
        self.reached_now = true;
        for person in &mut self.people {
            person.state.take_now_snapshot();
        }
    }

    /// Run the event loop until the clock reaches the end of the window.
    pub fn simulate(&mut self) -> Result<ClusterOutcome, InvariantViolation> {
        let _span = tracing::debug_span!("cluster", index = self.info.index.0).entered();
        debug!(
            people = self.people.len(),
            radius = self.info.radius,
            start = %self.info.start,
            "cluster starting"
        );

        while self.clock < self.info.end {
            let (idx, wake) = self.earliest();
            let horizon = match wake {
                WakeBy::At(t) if t < self.info.end => t,
                _ => self.info.end,
            };
            // Effects may pull someone's wake-by earlier: pick again.
            if self.apply_due_effects(horizon)? > 0 {
                continue;
            }
            if horizon >= self.info.end {
                break;
            }
            self.set_clock(horizon);
            self.attend(idx)?;
        }
        self.set_clock(self.info.end);
        if !self.reached_now {
            self.take_now_snapshot();
        }

        self.outcome.dormant = self.people.iter().filter(|p| p.state.wake_by() == WakeBy::Never).count();
        debug!(
            sessions = self.outcome.sessions,
            effects = self.outcome.effects_applied,
            dormant = self.outcome.dormant,
            "cluster finished"
        );
        Ok(self.outcome)
    }

    /// Earliest wake-by; ties go to the lowest scan index.
    fn earliest(&self) -> (usize, WakeBy) {
        self.people
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.state.wake_by()))
            .min_by_key(|&(i, wake)| (wake, i))
            .unwrap_or((0, WakeBy::Never))
    }

    /// Run one session for the person at `idx` at the current clock.
    fn attend(&mut self, idx: usize) -> Result<(), InvariantViolation> {
        let Cluster { info, random, people, shared, effects, groups, server, clock, outcome, .. } =
            self;
        let person = &mut people[idx];
        person.state.sync_clock(*clock);
        let mut ctx = SessionContext::<B> {
            info,
            random,
            shared,
            effects,
            groups,
            server,
            clock: *clock,
            source: person.state.pos,
        };

        let Some(intent) = person.behavior.determine_session_intent(&person.state, &mut ctx)? else {
            trace!(pos = ?person.state.pos, "person going dormant");
            person.state.set_wake_by(WakeBy::Never);
            return Ok(());
        };

        let flags = person.behavior.decide_feature_flags(&person.state, *clock);
        person.state.start_session(ctx.random, flags);
        trace!(pos = ?person.state.pos, ?intent, "session");
        person.behavior.simulate_session(intent, &mut person.state, &mut ctx)?;
        person.state.end_session();
        outcome.sessions += 1;

        let from = person.state.simulation_time().max(*clock);
        let next = person.behavior.determine_next_session_datetime(&person.state, from, ctx.random);
        person.state.set_wake_by(WakeBy::At(next.max(from)));
        Ok(())
    }

    /// Apply, in order, every queued effect due at or before `until`.
    /// Returns how many were applied.
    pub fn apply_due_effects(&mut self, until: DateTime<Utc>) -> Result<usize, InvariantViolation> {
        let mut applied = 0;
        while let Some(effect) = self.effects.pop_due(until) {
            self.set_clock(effect.timestamp);
            self.apply_effect(effect)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_effect(&mut self, effect: Effect<B::Command, B::Condition>) -> Result<(), InvariantViolation> {
        let side = self.info.side();
        let eligible = |people: &[SimPerson<B>], shared: &B::Shared, i: usize| match &effect.condition {
            Some(condition) => people[i].behavior.satisfies(condition, &people[i].state, shared),
            None => true,
        };

        let targets: Vec<usize> = match effect.target {
            Target::SelfTarget => {
                let i = effect.source.scan_index(side);
                if eligible(&self.people, &self.shared, i) { vec![i] } else { Vec::new() }
            }
            Target::RandomNeighbor => {
                let candidates: Vec<usize> = neighbor_indices(effect.source, side)
                    .into_iter()
                    .filter(|&i| eligible(&self.people, &self.shared, i))
                    .collect();
                self.random.choose(&candidates).map(|&i| vec![i]).unwrap_or_default()
            }
            Target::AllNeighbors => neighbor_indices(effect.source, side)
                .into_iter()
                .filter(|&i| eligible(&self.people, &self.shared, i))
                .collect(),
        };

        self.outcome.effects_applied += 1;
        if targets.is_empty() {
            self.outcome.effects_without_target += 1;
            trace!(command = ?effect.command, target = ?effect.target, "effect matched nobody");
            return Ok(());
        }

        let Cluster { info, random, people, shared, effects, groups, server, .. } = self;
        for i in targets {
            let person = &mut people[i];
            person.state.sync_clock(effect.timestamp);
            trace!(command = ?effect.command, pos = ?person.state.pos, "applying effect");
            let mut ctx = SessionContext::<B> {
                info,
                random,
                shared,
                effects,
                groups,
                server,
                clock: effect.timestamp,
                source: person.state.pos,
            };
            person.behavior.apply_command(&effect.command, &mut person.state, &mut ctx)?;
        }
        Ok(())
    }
}

/// Scan indices of the up-to-8 cells adjacent to `pos`, clipped at the grid
/// edges, in scan order.
pub fn neighbor_indices(pos: GridPos, side: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(8);
    for y in pos.y.saturating_sub(1)..=(pos.y + 1).min(side - 1) {
        for x in pos.x.saturating_sub(1)..=(pos.x + 1).min(side - 1) {
            if (x, y) != (pos.x, pos.y) {
                out.push(GridPos::new(x, y).scan_index(side));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde::Serialize;

    use super::*;
    use crate::products::pulse::PulsePerson;
    use crate::types::Properties;

    // ── Marker behaviour: people due at once who then go dormant. Shared state
    // logs the clock every time the cluster hands control to a person. ─────────

    #[derive(Debug)]
    struct Marker {
        eligible: bool,
        marks: Vec<(u32, DateTime<Utc>)>,
    }

    #[derive(Debug, Clone, Serialize)]
    enum MarkerCommand {
        Mark(u32),
        Wake,
        Fail,
    }

    #[derive(Debug, Clone, Serialize)]
    enum MarkerCondition {
        Eligible,
    }

    impl PersonBehavior for Marker {
        type Intent = ();
        type Command = MarkerCommand;
        type Condition = MarkerCondition;
        type Shared = Vec<DateTime<Utc>>;

        const NAME: &'static str = "marker";

        fn cluster_radius(_random: &mut RandomStream, max_radius: Option<usize>) -> usize {
            max_radius.unwrap_or(1)
        }

        fn new_shared(_info: &ClusterInfo, _random: &mut RandomStream) -> Self::Shared {
            Vec::new()
        }

        fn spawn(_person: &mut PersonState, ctx: &mut SpawnContext<'_, Self::Shared>) -> Self {
            // Only the left column is eligible.
            Marker { eligible: ctx.pos.x == 0, marks: Vec::new() }
        }

        fn determine_next_session_datetime(
            &mut self,
            _person: &PersonState,
            from: DateTime<Utc>,
            _random: &mut RandomStream,
        ) -> DateTime<Utc> {
            from
        }

        fn determine_session_intent(
            &mut self,
            _person: &PersonState,
            ctx: &mut SessionContext<'_, Self>,
        ) -> Result<Option<()>, InvariantViolation> {
            ctx.shared.push(ctx.clock);
            Ok(None)
        }

        fn simulate_session(
            &mut self,
            _intent: (),
            _person: &mut PersonState,
            _ctx: &mut SessionContext<'_, Self>,
        ) -> Result<(), InvariantViolation> {
            Ok(())
        }

        fn satisfies(&self, condition: &MarkerCondition, _person: &PersonState, _shared: &Self::Shared) -> bool {
            match condition {
                MarkerCondition::Eligible => self.eligible,
            }
        }

        fn apply_command(
            &mut self,
            command: &MarkerCommand,
            person: &mut PersonState,
            ctx: &mut SessionContext<'_, Self>,
        ) -> Result<(), InvariantViolation> {
            ctx.shared.push(ctx.clock);
            match command {
                MarkerCommand::Mark(n) => {
                    self.marks.push((*n, ctx.clock));
                    Ok(())
                }
                MarkerCommand::Wake => {
                    person.set_wake_by(WakeBy::At(ctx.clock + Duration::minutes(30)));
                    Ok(())
                }
                MarkerCommand::Fail => Err(InvariantViolation::IntentUnavailable {
                    intent: "Fail".into(),
                    requirement: "nothing",
                }),
            }
        }
    }

    fn window(days_past: i64, days_future: i64) -> TimeWindow {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TimeWindow {
            start: now - Duration::days(days_past),
            now,
            end: now + Duration::days(days_future),
        }
    }

    fn marker_cluster() -> Cluster<Marker> {
        Cluster::new(ClusterIndex(0), "marker", &window(2, 0), Some(1))
    }

    fn at(h: i64) -> DateTime<Utc> {
        window(2, 0).start + Duration::hours(h)
    }

    // ── Grid ──────────────────────────────────────────────────────────────────

    #[test]
    fn grid_has_kernel_at_centre_in_scan_order() {
        let c = marker_cluster();
        assert_eq!(c.people().len(), 9);
        let kernels: Vec<GridPos> = c.people().iter().filter(|p| p.state.kernel).map(|p| p.state.pos).collect();
        assert_eq!(kernels, [GridPos::new(1, 1)]);
        for (i, p) in c.people().iter().enumerate() {
            assert_eq!(p.state.pos.scan_index(3), i);
            assert_eq!(p.state.cluster, ClusterIndex(0));
        }
    }

    #[test]
    fn neighbours_are_clipped_and_in_scan_order() {
        assert_eq!(neighbor_indices(GridPos::new(1, 1), 3), [0, 1, 2, 3, 5, 6, 7, 8]);
        assert_eq!(neighbor_indices(GridPos::new(0, 0), 3), [1, 3, 4]);
        assert_eq!(neighbor_indices(GridPos::new(2, 2), 3), [4, 5, 7]);
        assert!(neighbor_indices(GridPos::new(0, 0), 1).is_empty());
    }

    // ── Clock ─────────────────────────────────────────────────────────────────

    #[test]
    fn backward_clock_set_is_a_no_op() {
        let mut c = marker_cluster();
        c.set_clock(at(5));
        c.set_clock(at(2));
        assert_eq!(c.clock(), at(5));
    }

    #[test]
    fn now_snapshot_taken_on_first_crossing() {
        let mut c: Cluster<Marker> = Cluster::new(ClusterIndex(0), "marker", &window(1, 1), Some(1));
        assert!(!c.people()[0].state.has_now_snapshot());
        c.set_clock(window(1, 1).now);
        assert!(c.people().iter().all(|p| p.state.has_now_snapshot()));
    }

    #[test]
    fn cluster_starting_after_now_snapshots_at_construction() {
        let mut w = window(0, 3);
        w.start = w.now;
        let c: Cluster<Marker> = Cluster::new(ClusterIndex(0), "marker", &w, Some(1));
        assert!(c.people().iter().all(|p| p.state.has_now_snapshot()));
    }

    // ── Effects ───────────────────────────────────────────────────────────────

    #[test]
    fn effects_apply_in_timestamp_then_insertion_order() {
        let mut c = marker_cluster();
        let src = GridPos::new(0, 0);
        c.schedule_effect(at(3), src, Target::SelfTarget, None, MarkerCommand::Mark(3));
        c.schedule_effect(at(1), src, Target::SelfTarget, None, MarkerCommand::Mark(1));
        c.schedule_effect(at(1), src, Target::SelfTarget, None, MarkerCommand::Mark(2));
        c.simulate().unwrap();
        let marks: Vec<u32> = c.people()[0].behavior.marks.iter().map(|m| m.0).collect();
        assert_eq!(marks, [1, 2, 3]);
        assert_eq!(c.people()[0].behavior.marks[0].1, at(1));
        assert_eq!(c.pending_effects(), 0);
    }

    #[test]
    fn all_neighbours_respects_condition() {
        let mut c = marker_cluster();
        c.schedule_effect(at(1), GridPos::new(1, 1), Target::AllNeighbors, Some(MarkerCondition::Eligible), MarkerCommand::Mark(7));
        c.simulate().unwrap();
        let marked: Vec<GridPos> = c
            .people()
            .iter()
            .filter(|p| !p.behavior.marks.is_empty())
            .map(|p| p.state.pos)
            .collect();
        assert_eq!(marked, [GridPos::new(0, 0), GridPos::new(0, 1), GridPos::new(0, 2)]);
    }

    #[test]
    fn random_neighbour_with_no_eligible_candidate_is_a_no_op() {
        let mut c = marker_cluster();
        // (2, 2) only borders (1, 1), (2, 1) and (1, 2): none in the left column.
        c.schedule_effect(at(1), GridPos::new(2, 2), Target::RandomNeighbor, Some(MarkerCondition::Eligible), MarkerCommand::Mark(1));
        let outcome = c.simulate().unwrap();
        assert_eq!(outcome.effects_applied, 1);
        assert_eq!(outcome.effects_without_target, 1);
        assert!(c.people().iter().all(|p| p.behavior.marks.is_empty()));
    }

    #[test]
    fn random_neighbour_picks_exactly_one_eligible() {
        let mut c = marker_cluster();
        c.schedule_effect(at(1), GridPos::new(1, 1), Target::RandomNeighbor, Some(MarkerCondition::Eligible), MarkerCommand::Mark(1));
        c.simulate().unwrap();
        let marked: Vec<&SimPerson<Marker>> = c.people().iter().filter(|p| !p.behavior.marks.is_empty()).collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].state.pos.x, 0);
    }

    #[test]
    fn effects_after_end_are_never_applied() {
        let mut c = marker_cluster();
        let end = c.info().end;
        c.schedule_effect(end + Duration::hours(1), GridPos::new(0, 0), Target::SelfTarget, None, MarkerCommand::Mark(1));
        c.simulate().unwrap();
        assert!(c.people()[0].behavior.marks.is_empty());
        assert_eq!(c.pending_effects(), 1);
        assert_eq!(c.clock(), end);
    }

    #[test]
    fn command_error_aborts_simulation() {
        let mut c = marker_cluster();
        c.schedule_effect(at(1), GridPos::new(0, 0), Target::SelfTarget, None, MarkerCommand::Fail);
        assert!(c.simulate().is_err());
    }

    // ── Loop ──────────────────────────────────────────────────────────────────

    #[test]
    fn dormant_cluster_terminates_at_end() {
        let mut c = marker_cluster();
        let outcome = c.simulate().unwrap();
        assert_eq!(c.clock(), c.info().end);
        assert_eq!(outcome.sessions, 0);
        assert_eq!(outcome.dormant, 9);
        // Everyone was due at start, decided once, then slept.
        assert_eq!(c.shared(), &vec![c.info().start; 9]);
        assert!(c.people().iter().all(|p| p.state.has_now_snapshot()));
    }

    #[test]
    fn clock_never_runs_backwards_across_a_run() {
        let mut c = marker_cluster();
        // Queued out of order: wakes interleave with marks and each woken
        // person is attended half an hour after their wake effect.
        for (h, i) in [(30, 4), (3, 0), (17, 8), (3, 2), (41, 5), (9, 6)] {
            let pos = c.people()[i].state.pos;
            c.schedule_effect(at(h), pos, Target::SelfTarget, None, MarkerCommand::Wake);
            c.schedule_effect(at(h) + Duration::minutes(10), pos, Target::SelfTarget, None, MarkerCommand::Mark(h as u32));
        }
        c.simulate().unwrap();

        let log = c.shared();
        // 9 initial decisions, 12 commands, 6 re-decisions after waking.
        assert_eq!(log.len(), 27);
        assert!(log.windows(2).all(|w| w[0] <= w[1]), "{log:?}");
        assert!(log.iter().all(|&t| t >= c.info().start && t <= c.info().end));
        assert!(log.contains(&(at(41) + Duration::minutes(30))));
        assert_eq!(c.clock(), c.info().end);
    }

    #[test]
    fn active_cluster_terminates_with_monotonic_ledgers() {
        let mut c: Cluster<PulsePerson> = Cluster::new(ClusterIndex(0), "pulse", &window(14, 7), Some(1));
        let outcome = c.simulate().unwrap();
        assert_eq!(c.clock(), c.info().end);
        assert!(outcome.sessions > 0);
        for p in c.people() {
            let events = p.state.all_events();
            assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            assert!(events.iter().all(|e| e.timestamp >= c.info().start));
            assert_eq!(p.state.past_events().len() + p.state.future_events().len(), events.len());
            assert!(p.state.future_events().iter().all(|e| e.timestamp >= c.info().now));
        }
    }

    #[test]
    fn same_seed_same_cluster() {
        let run = || {
            let mut c: Cluster<PulsePerson> = Cluster::new(ClusterIndex(3), "repeat", &window(10, 0), Some(1));
            c.simulate().unwrap();
            c.people().iter().flat_map(|p| p.state.all_events().to_vec()).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn feature_flags_default_to_empty() {
        let c = marker_cluster();
        let p = &c.people()[0];
        assert_eq!(p.behavior.decide_feature_flags(&p.state, at(0)), Properties::new());
    }
}
