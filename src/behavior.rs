use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;

use crate::client::{SimClient, SimServerClient};
use crate::effects::{EffectQueue, Target};
use crate::error::InvariantViolation;
use crate::groups::GroupRegistry;
use crate::person::PersonState;
use crate::randomization::RandomStream;
use crate::types::{ClusterIndex, GridPos, Properties, seconds};

/// Base wait window for people the product considers engaged.
pub const ENGAGED_WINDOW_SECS: f64 = 10.0 * 3_600.0;
/// Base wait window for everyone else.
pub const CASUAL_WINDOW_SECS: f64 = 48.0 * 3_600.0;
/// Floor added to every wait so consecutive sessions never coincide.
pub const MIN_WAIT_SECS: f64 = 24.0;
/// Rejection-sampling cap; the last candidate is accepted when reached.
const MAX_SESSION_DRAWS: usize = 256;

/// Immutable facts about the cluster a person lives in.
#[derive(Debug, Clone, Copy)]
pub struct ClusterInfo {
    pub index: ClusterIndex,
    pub radius: usize,
    pub start: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ClusterInfo {
    /// Cells per grid row (and column).
    pub fn side(&self) -> usize {
        2 * self.radius + 1
    }

    pub fn kernel(&self) -> GridPos {
        GridPos::new(self.radius, self.radius)
    }
}

/// What a product gets while a new person is being created.
pub struct SpawnContext<'a, S> {
    pub info: &'a ClusterInfo,
    pub random: &'a mut RandomStream,
    pub shared: &'a mut S,
    pub pos: GridPos,
    pub kernel: bool,
}

/// Cluster-side resources handed to a behaviour while it runs a session or
/// applies a command. `clock` is the cluster clock when the call started.
pub struct SessionContext<'a, B: PersonBehavior> {
    pub info: &'a ClusterInfo,
    pub random: &'a mut RandomStream,
    pub shared: &'a mut B::Shared,
    pub effects: &'a mut EffectQueue<B::Command, B::Condition>,
    pub groups: &'a mut GroupRegistry,
    pub server: &'a mut SimServerClient,
    pub clock: DateTime<Utc>,
    /// Grid position of the person being attended.
    pub source: GridPos,
}

impl<'a, B: PersonBehavior> SessionContext<'a, B> {
    /// Analytics client for `person`, valid until the next use of the context.
    pub fn client<'s>(&'s mut self, person: &'s mut PersonState) -> SimClient<'s> {
        SimClient::new(person, self.random, self.groups)
    }

    /// Defer `command` to `at`, originating from the attended person.
    pub fn schedule(
        &mut self,
        at: DateTime<Utc>,
        target: Target,
        condition: Option<B::Condition>,
        command: B::Command,
    ) {
        self.effects.schedule(at, self.source, target, condition, command);
    }
}

/// Product-specific behaviour of a simulated person.
///
/// The engine owns a `PersonState` per person and calls these hooks; it never
/// inspects `Intent`, `Command` or `Condition` beyond passing them back.
pub trait PersonBehavior: Sized + Send + fmt::Debug {
    type Intent: Copy + fmt::Debug + PartialEq + Send;
    /// Deferred mutation carried by an effect.
    type Command: Clone + fmt::Debug + Serialize + Send;
    /// Predicate an effect target must satisfy.
    type Condition: Clone + fmt::Debug + Serialize + Send;
    /// Cluster-wide product state (accounts, companies...).
    type Shared: fmt::Debug + Send;

    const NAME: &'static str;

    /// Grid radius for a new cluster, at most `max_radius` when given.
    fn cluster_radius(random: &mut RandomStream, max_radius: Option<usize>) -> usize;

    /// Fraction of the matrix window after which a cluster starts.
    fn initiation_fraction(_random: &mut RandomStream) -> f64 {
        0.0
    }

    fn new_shared(info: &ClusterInfo, random: &mut RandomStream) -> Self::Shared;

    /// Create the behaviour for a freshly generated person. May adjust the
    /// person's identity (e.g. a company email).
    fn spawn(person: &mut PersonState, ctx: &mut SpawnContext<'_, Self::Shared>) -> Self;

    /// Engaged people get the shorter base wait window.
    fn is_engaged(&self, _person: &PersonState) -> bool {
        false
    }

    /// Next time this person wants a session. Never earlier than `from`.
    fn determine_next_session_datetime(
        &mut self,
        person: &PersonState,
        from: DateTime<Utc>,
        random: &mut RandomStream,
    ) -> DateTime<Utc> {
        let window = if self.is_engaged(person) { ENGAGED_WINDOW_SECS } else { CASUAL_WINDOW_SECS };
        next_session_by_appropriateness(person, from, window, random)
    }

    /// `None` makes the person dormant until an effect wakes them.
    fn determine_session_intent(
        &mut self,
        person: &PersonState,
        ctx: &mut SessionContext<'_, Self>,
    ) -> Result<Option<Self::Intent>, InvariantViolation>;

    fn simulate_session(
        &mut self,
        intent: Self::Intent,
        person: &mut PersonState,
        ctx: &mut SessionContext<'_, Self>,
    ) -> Result<(), InvariantViolation>;

    /// Flag → variant for a session starting at `at`.
    fn decide_feature_flags(&self, _person: &PersonState, _at: DateTime<Utc>) -> Properties {
        Properties::new()
    }

    fn satisfies(&self, condition: &Self::Condition, person: &PersonState, shared: &Self::Shared)
    -> bool;

    fn apply_command(
        &mut self,
        command: &Self::Command,
        person: &mut PersonState,
        ctx: &mut SessionContext<'_, Self>,
    ) -> Result<(), InvariantViolation>;
}

/// Probability that a session starts at `t` for someone living at `person`'s offset.
pub fn session_appropriateness(person: &PersonState, t: DateTime<Utc>) -> f64 {
    let local = t.with_timezone(&person.address.utc_offset);
    let hour = local.hour();
    let weekend = local.weekday().num_days_from_monday() >= 5;
    let base = if hour < 6 {
        0.1
    } else if !weekend && (9..18).contains(&hour) {
        1.0
    } else {
        0.4
    };
    if weekend { base * 0.8 } else { base }
}

/// Default next-session policy: Beta-distributed waits scaled by `window_secs`
/// (higher need, shorter waits), accepted by time-of-day appropriateness.
pub fn next_session_by_appropriateness(
    person: &PersonState,
    from: DateTime<Utc>,
    window_secs: f64,
    random: &mut RandomStream,
) -> DateTime<Utc> {
    let mut candidate = from;
    for _ in 0..MAX_SESSION_DRAWS {
        let wait = random.beta(2.5, 1.0 + person.need()) * window_secs + MIN_WAIT_SECS;
        candidate += seconds(wait);
        if random.chance(session_appropriateness(person, candidate)) {
            break;
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::person::tests::person_at;

    fn utc_person() -> PersonState {
        let mut p = person_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        p.address.utc_offset = FixedOffset::east_opt(0).unwrap();
        p
    }

    #[test]
    fn appropriateness_by_time_of_day() {
        let p = utc_person();
        // 2024-01-03 is a Wednesday, 2024-01-06 a Saturday.
        let at = |d, h| Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap();
        assert_eq!(session_appropriateness(&p, at(3, 3)), 0.1);
        assert_eq!(session_appropriateness(&p, at(3, 10)), 1.0);
        assert_eq!(session_appropriateness(&p, at(3, 20)), 0.4);
        assert!((session_appropriateness(&p, at(6, 10)) - 0.32).abs() < 1e-12);
    }

    #[test]
    fn appropriateness_uses_local_offset() {
        let mut p = utc_person();
        p.address.utc_offset = FixedOffset::east_opt(9 * 3_600).unwrap();
        // 01:00 UTC is 10:00 in UTC+9 on a Wednesday.
        let t = Utc.with_ymd_and_hms(2024, 1, 3, 1, 0, 0).unwrap();
        assert_eq!(session_appropriateness(&p, t), 1.0);
    }

    #[test]
    fn next_session_is_strictly_after_from() {
        let p = utc_person();
        let mut random = RandomStream::from_seed("next-session");
        let from = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        for _ in 0..200 {
            let next = next_session_by_appropriateness(&p, from, CASUAL_WINDOW_SECS, &mut random);
            assert!(next >= from + seconds(MIN_WAIT_SECS));
        }
    }

    #[test]
    fn higher_need_means_shorter_average_wait() {
        let mut needy = utc_person();
        needy.set_need(1.0);
        let mut idle = utc_person();
        idle.set_need(0.0);
        let from = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let mean_wait = |p: &PersonState| {
            let mut random = RandomStream::from_seed("mean-wait");
            let total: i64 = (0..400)
                .map(|_| {
                    let next = next_session_by_appropriateness(p, from, ENGAGED_WINDOW_SECS, &mut random);
                    (next - from).num_seconds()
                })
                .sum();
            total / 400
        };
        assert!(mean_wait(&needy) < mean_wait(&idle));
    }
}
