use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::behavior::PersonBehavior;
use crate::error::PersistError;
use crate::events::SimSnapshot;
use crate::groups::SimGroup;
use crate::matrix::{Matrix, TimelineEvent};
use crate::person::PersonState;
use crate::types::Properties;

pub const EVENTS_FILE: &str = "events.ndjson";
pub const PEOPLE_FILE: &str = "people.ndjson";
pub const GROUPS_FILE: &str = "groups.ndjson";
pub const SNAPSHOTS_FILE: &str = "snapshots.ndjson";

/// Row counts written by one `persist` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub events: usize,
    pub people: usize,
    pub groups: usize,
    pub snapshots: usize,
}

/// Hands a simulated matrix to storage. Deduplication and idempotency are the
/// storage's business.
pub trait MatrixSink {
    fn persist<B: PersonBehavior>(&mut self, matrix: &Matrix<B>) -> Result<PersistSummary, PersistError>;
}

#[derive(Serialize)]
struct EventRow<'a> {
    team_id: u64,
    #[serde(flatten)]
    timeline: TimelineEvent<'a>,
}

#[derive(Serialize)]
struct PersonRow<'a> {
    team_id: u64,
    id: Uuid,
    distinct_id: &'a str,
    distinct_ids: &'a [String],
    name: &'a str,
    email: &'a str,
    /// Properties as of "now"; later changes belong to the future.
    properties: &'a Properties,
    first_seen_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
    is_active: bool,
}

impl<'a> PersonRow<'a> {
    fn new(team_id: u64, state: &'a PersonState) -> Self {
        PersonRow {
            team_id,
            id: state.id,
            distinct_id: state.distinct_id(),
            distinct_ids: state.distinct_ids(),
            name: &state.name,
            email: &state.email,
            properties: state.properties_at_now(),
            first_seen_at: state.first_seen_at(),
            last_seen_at: state.last_seen_at(),
            is_active: !state.all_events().is_empty(),
        }
    }
}

#[derive(Serialize)]
struct GroupRow<'a> {
    team_id: u64,
    #[serde(flatten)]
    group: &'a SimGroup,
}

#[derive(Serialize)]
struct SnapshotRow<'a> {
    team_id: u64,
    distinct_id: &'a str,
    #[serde(flatten)]
    snapshot: &'a SimSnapshot,
}

/// Writes newline-delimited JSON files into one directory, one object per line.
#[derive(Debug, Clone)]
pub struct NdjsonSink {
    dir: PathBuf,
    team_id: u64,
}

impl NdjsonSink {
    pub fn new(dir: impl Into<PathBuf>, team_id: u64) -> Self {
        NdjsonSink { dir: dir.into(), team_id }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MatrixSink for NdjsonSink {
    fn persist<B: PersonBehavior>(&mut self, matrix: &Matrix<B>) -> Result<PersistSummary, PersistError> {
        if !matrix.is_simulated() {
            return Err(PersistError::NotSimulated);
        }
        fs::create_dir_all(&self.dir).map_err(|source| PersistError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;
        let team_id = self.team_id;

        let timeline = matrix.merged_events();
        let events = write_ndjson(
            &self.dir.join(EVENTS_FILE),
            "event",
            timeline.into_iter().map(|timeline| EventRow { team_id, timeline }),
        )?;

        let people = write_ndjson(
            &self.dir.join(PEOPLE_FILE),
            "person",
            matrix.people().map(|p| PersonRow::new(team_id, &p.state)),
        )?;

        let groups = matrix.groups();
        let groups = write_ndjson(
            &self.dir.join(GROUPS_FILE),
            "group",
            groups.iter().map(|group| GroupRow { team_id, group }),
        )?;

        // Past replay data only.
        let snapshots = write_ndjson(
            &self.dir.join(SNAPSHOTS_FILE),
            "snapshot",
            matrix.people().flat_map(|p| {
                let distinct_id = p.state.distinct_id();
                p.state.past_snapshots().iter().map(move |snapshot| SnapshotRow { team_id, distinct_id, snapshot })
            }),
        )?;

        let summary = PersistSummary { events, people, groups, snapshots };
        info!(
            dir = %self.dir.display(),
            team_id,
            events = summary.events,
            people = summary.people,
            groups = summary.groups,
            snapshots = summary.snapshots,
            "persisted matrix"
        );
        Ok(summary)
    }
}

fn write_ndjson<T: Serialize>(
    path: &Path,
    what: &'static str,
    rows: impl Iterator<Item = T>,
) -> Result<usize, PersistError> {
    let io_err = |source| PersistError::Io { path: path.display().to_string(), source };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for row in rows {
        serde_json::to_writer(&mut writer, &row).map_err(|source| PersistError::Json { what, source })?;
        writeln!(writer).map_err(io_err)?;
        written += 1;
    }
    writer.flush().map_err(io_err)?;
    debug!(path = %path.display(), rows = written, "wrote ndjson");
    Ok(written)
}
