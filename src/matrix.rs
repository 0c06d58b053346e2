use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::behavior::PersonBehavior;
use crate::cluster::{Cluster, ClusterOutcome};
use crate::config::{MatrixConfig, TimeWindow};
use crate::error::{ConfigError, MatrixError};
use crate::events::SimEvent;
use crate::groups::{GroupRegistry, SimGroup};
use crate::person::SimPerson;
use crate::randomization::RandomStream;
use crate::types::ClusterIndex;

/// Totals across all clusters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatrixOutcome {
    pub clusters: usize,
    pub people: usize,
    pub sessions: u64,
    pub effects_applied: u64,
    pub effects_without_target: u64,
    pub dormant: usize,
    pub events: usize,
    pub server_events: usize,
}

/// One row of the merged timeline handed to persistence.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimelineEvent<'a> {
    #[serde(flatten)]
    pub event: &'a SimEvent,
    pub is_future: bool,
}

/// The whole simulated world: independent clusters over one time window.
#[derive(Debug)]
pub struct Matrix<B: PersonBehavior> {
    seed: String,
    window: TimeWindow,
    clusters: Vec<Cluster<B>>,
    groups: GroupRegistry,
    server_events: Vec<SimEvent>,
    outcome: Option<MatrixOutcome>,
}

impl<B: PersonBehavior> Matrix<B> {
    /// Validate `config` and build every cluster. Nothing is simulated yet.
    pub fn new(config: &MatrixConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let seed = match &config.seed {
            Some(seed) => seed.clone(),
            None => {
                let seed = RandomStream::generate_seed();
                info!(seed = %seed, "no seed given, generated one");
                seed
            }
        };
        let window = config.window();
        let max_radius = config.max_radius();
        let clusters: Vec<Cluster<B>> = (0..config.n_clusters)
            .into_par_iter()
            .map(|i| Cluster::new(ClusterIndex(i), &seed, &window, max_radius))
            .collect();

        Ok(Matrix {
            seed,
            window,
            clusters,
            groups: GroupRegistry::new(),
            server_events: Vec::new(),
            outcome: None,
        })
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn clusters(&self) -> &[Cluster<B>] {
        &self.clusters
    }

    pub fn is_simulated(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<MatrixOutcome> {
        self.outcome
    }

    /// Run every cluster to the end of the window, in parallel. The first
    /// invariant violation aborts the run. Can only be called once.
    pub fn simulate(&mut self) -> Result<MatrixOutcome, MatrixError> {
        if self.is_simulated() {
            return Err(MatrixError::AlreadySimulated);
        }
        info!(
            seed = %self.seed,
            product = B::NAME,
            clusters = self.clusters.len(),
            start = %self.window.start,
            now = %self.window.now,
            end = %self.window.end,
            "simulating matrix"
        );

        let seed = self.seed.as_str();
        let results: Vec<ClusterOutcome> = self
            .clusters
            .par_iter_mut()
            .map(|cluster| {
                let index = cluster.index();
                cluster.simulate().map_err(|e| MatrixError::invariant(seed, index, e))
            })
            .collect::<Result<_, _>>()?;

        // Merge in cluster order so the result is independent of thread scheduling.
        for cluster in &self.clusters {
            self.groups
                .merge(cluster.groups())
                .map_err(|e| MatrixError::invariant(&self.seed, cluster.index(), e))?;
            self.server_events.extend_from_slice(cluster.server_events());
        }

        let mut outcome = MatrixOutcome {
            clusters: self.clusters.len(),
            server_events: self.server_events.len(),
            ..MatrixOutcome::default()
        };
        for r in &results {
            outcome.sessions += r.sessions;
            outcome.effects_applied += r.effects_applied;
            outcome.effects_without_target += r.effects_without_target;
            outcome.dormant += r.dormant;
        }
        for person in self.people() {
            outcome.people += 1;
            outcome.events += person.state.all_events().len();
        }
        self.outcome = Some(outcome);

        info!(
            people = outcome.people,
            events = outcome.events,
            sessions = outcome.sessions,
            groups = self.groups.len(),
            "simulation complete"
        );
        Ok(outcome)
    }

    /// All people, in cluster order then scan order.
    pub fn people(&self) -> impl Iterator<Item = &SimPerson<B>> {
        self.clusters.iter().flat_map(|c| c.people())
    }

    pub fn groups(&self) -> Vec<SimGroup> {
        self.groups.to_groups()
    }

    pub fn group_registry(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn server_events(&self) -> &[SimEvent] {
        &self.server_events
    }

    /// Person and server events on one timeline, stably sorted by timestamp.
    pub fn merged_events(&self) -> Vec<TimelineEvent<'_>> {
        let mut timeline: Vec<TimelineEvent<'_>> = Vec::new();
        for person in self.people() {
            let state = &person.state;
            timeline.extend(state.past_events().iter().map(|event| TimelineEvent { event, is_future: false }));
            timeline.extend(state.future_events().iter().map(|event| TimelineEvent { event, is_future: true }));
        }
        let now = self.window.now;
        timeline.extend(
            self.server_events.iter().map(|event| TimelineEvent { event, is_future: event.timestamp >= now }),
        );
        timeline.sort_by_key(|t| t.event.timestamp);
        timeline
    }
}
