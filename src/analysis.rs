use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::behavior::PersonBehavior;
use crate::events::SimEvent;
use crate::matrix::Matrix;
use crate::person::PersonState;
use crate::types::{ClusterIndex, GridPos};

/// A ledger invariant violation found after a run.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerViolation {
    /// An event is timestamped before the one recorded ahead of it.
    OutOfOrder { cluster: ClusterIndex, pos: GridPos, index: usize, previous: DateTime<Utc>, timestamp: DateTime<Utc> },
    /// An event predates the start of the simulated window.
    BeforeStart { cluster: ClusterIndex, pos: GridPos, event: String, timestamp: DateTime<Utc>, start: DateTime<Utc> },
    /// An event on the future side of the partition is timestamped before now.
    FutureBeforeNow { cluster: ClusterIndex, pos: GridPos, event: String, timestamp: DateTime<Utc>, now: DateTime<Utc> },
    /// The ledger was never split into past and future.
    NowSnapshotMissing { cluster: ClusterIndex, pos: GridPos },
    /// A person's event carries a distinct id the person never had.
    ForeignDistinctId { cluster: ClusterIndex, pos: GridPos, event: String, distinct_id: String },
    /// A server event is attributed to a distinct id nobody in the matrix owns.
    UnknownServerDistinctId { event: String, distinct_id: String, timestamp: DateTime<Utc> },
}

impl std::fmt::Display for LedgerViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfOrder { cluster, pos, index, previous, timestamp } => {
                write!(f, "OutOfOrder cluster={} pos=({},{}) index={index}: {timestamp} < {previous}", cluster.0, pos.x, pos.y)
            }
            Self::BeforeStart { cluster, pos, event, timestamp, start } => {
                write!(f, "BeforeStart cluster={} pos=({},{}) event={event}: {timestamp} < start {start}", cluster.0, pos.x, pos.y)
            }
            Self::FutureBeforeNow { cluster, pos, event, timestamp, now } => {
                write!(f, "FutureBeforeNow cluster={} pos=({},{}) event={event}: {timestamp} < now {now}", cluster.0, pos.x, pos.y)
            }
            Self::NowSnapshotMissing { cluster, pos } => {
                write!(f, "NowSnapshotMissing cluster={} pos=({},{})", cluster.0, pos.x, pos.y)
            }
            Self::ForeignDistinctId { cluster, pos, event, distinct_id } => {
                write!(f, "ForeignDistinctId cluster={} pos=({},{}) event={event} distinct_id={distinct_id}", cluster.0, pos.x, pos.y)
            }
            Self::UnknownServerDistinctId { event, distinct_id, timestamp } => {
                write!(f, "UnknownServerDistinctId event={event} distinct_id={distinct_id} at {timestamp}")
            }
        }
    }
}

/// Check one person's ledger against the window it was simulated in.
pub fn verify_person(person: &PersonState, start: DateTime<Utc>, now: DateTime<Utc>) -> Vec<LedgerViolation> {
    let mut violations = Vec::new();
    let (cluster, pos) = (person.cluster, person.pos);

    if !person.has_now_snapshot() {
        violations.push(LedgerViolation::NowSnapshotMissing { cluster, pos });
    }

    let events = person.all_events();
    for (index, pair) in events.windows(2).enumerate() {
        if pair[1].timestamp < pair[0].timestamp {
            violations.push(LedgerViolation::OutOfOrder {
                cluster,
                pos,
                index: index + 1,
                previous: pair[0].timestamp,
                timestamp: pair[1].timestamp,
            });
        }
    }

    for e in events {
        if e.timestamp < start {
            violations.push(LedgerViolation::BeforeStart {
                cluster,
                pos,
                event: e.event.clone(),
                timestamp: e.timestamp,
                start,
            });
        }
        if !person.distinct_ids().iter().any(|d| *d == e.distinct_id) {
            violations.push(LedgerViolation::ForeignDistinctId {
                cluster,
                pos,
                event: e.event.clone(),
                distinct_id: e.distinct_id.clone(),
            });
        }
    }

    if person.has_now_snapshot() {
        for e in person.future_events() {
            if e.timestamp < now {
                violations.push(LedgerViolation::FutureBeforeNow {
                    cluster,
                    pos,
                    event: e.event.clone(),
                    timestamp: e.timestamp,
                    now,
                });
            }
        }
    }

    violations
}

/// Server events must point at someone; `known` holds every distinct id in the run.
pub fn verify_server_events(events: &[SimEvent], known: &BTreeSet<&str>) -> Vec<LedgerViolation> {
    events
        .iter()
        .filter(|e| !known.contains(e.distinct_id.as_str()))
        .map(|e| LedgerViolation::UnknownServerDistinctId {
            event: e.event.clone(),
            distinct_id: e.distinct_id.clone(),
            timestamp: e.timestamp,
        })
        .collect()
}

/// Check every ledger in a simulated matrix. Returns one item per violation found.
pub fn verify_ledgers<B: PersonBehavior>(matrix: &Matrix<B>) -> Vec<LedgerViolation> {
    let window = matrix.window();
    let mut violations: Vec<LedgerViolation> = matrix
        .people()
        .flat_map(|p| verify_person(&p.state, window.start, window.now))
        .collect();

    let known: BTreeSet<&str> =
        matrix.people().flat_map(|p| p.state.distinct_ids().iter().map(String::as_str)).collect();
    violations.extend(verify_server_events(matrix.server_events(), &known));
    violations
}

/// Headline numbers for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub people: usize,
    /// People with at least one captured event.
    pub active_people: usize,
    pub sessions: u64,
    pub past_events: usize,
    pub future_events: usize,
    pub server_events: usize,
    pub groups: usize,
    /// Person and server events by name.
    pub events_by_name: BTreeMap<String, usize>,
    /// Person and server events by UTC calendar day.
    pub events_by_day: BTreeMap<NaiveDate, usize>,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn total_events(&self) -> usize {
        self.past_events + self.future_events + self.server_events
    }

    fn count(&mut self, e: &SimEvent) {
        *self.events_by_name.entry(e.event.clone()).or_insert(0) += 1;
        *self.events_by_day.entry(e.timestamp.date_naive()).or_insert(0) += 1;
        self.first_event = Some(self.first_event.map_or(e.timestamp, |t| t.min(e.timestamp)));
        self.last_event = Some(self.last_event.map_or(e.timestamp, |t| t.max(e.timestamp)));
    }
}

pub fn summarize<B: PersonBehavior>(matrix: &Matrix<B>) -> RunSummary {
    let mut summary = RunSummary { groups: matrix.group_registry().len(), ..RunSummary::default() };

    for person in matrix.people() {
        let state = &person.state;
        summary.people += 1;
        summary.sessions += u64::from(state.session_count());
        if !state.all_events().is_empty() {
            summary.active_people += 1;
        }
        summary.past_events += state.past_events().len();
        summary.future_events += state.future_events().len();
        for e in state.all_events() {
            summary.count(e);
        }
    }

    summary.server_events = matrix.server_events().len();
    for e in matrix.server_events() {
        summary.count(e);
    }
    summary
}
