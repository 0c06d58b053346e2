use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::floor_to_midnight;

/// Which product model drives the people in every cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    /// File-hosting SaaS with signups, plans, teams and sharing.
    Hedgebox,
    /// One pageview per session.
    Pulse,
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductKind::Hedgebox => write!(f, "hedgebox"),
            ProductKind::Pulse => write!(f, "pulse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// `None` → a fresh seed is generated and logged.
    pub seed: Option<String>,
    pub now: DateTime<Utc>,
    pub days_past: i64,
    pub days_future: i64,
    pub n_clusters: usize,
    pub product: ProductKind,
    /// Caps the grid radius the product picks for each cluster.
    pub max_radius: Option<i64>,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self::canonical()
    }
}

impl MatrixConfig {
    /// Four months of history and one month of future for 50 Hedgebox clusters.
    pub fn canonical() -> Self {
        MatrixConfig {
            seed: None,
            now: Utc::now(),
            days_past: 120,
            days_future: 30,
            n_clusters: 50,
            product: ProductKind::Hedgebox,
            max_radius: None,
        }
    }

    pub fn from_toml_str(text: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
    }

    /// Load a TOML file. Missing keys fall back to `canonical()`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        Self::from_toml_str(&text, &display)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_clusters == 0 {
            return Err(ConfigError::NoClusters);
        }
        if self.days_past < 0 {
            return Err(ConfigError::NegativeDays { field: "days_past", value: self.days_past });
        }
        if self.days_future < 0 {
            return Err(ConfigError::NegativeDays { field: "days_future", value: self.days_future });
        }
        if let Some(r) = self.max_radius
            && r < 0
        {
            return Err(ConfigError::NegativeRadius(r));
        }
        let window = self.window();
        if window.start >= window.end {
            return Err(ConfigError::EmptyWindow);
        }
        Ok(())
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.now, self.days_past, self.days_future)
    }

    pub fn max_radius(&self) -> Option<usize> {
        self.max_radius.and_then(|r| usize::try_from(r).ok())
    }
}

/// Simulated time bounds. `start` and `end` fall on UTC midnights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(now: DateTime<Utc>, days_past: i64, days_future: i64) -> Self {
        TimeWindow {
            start: floor_to_midnight(now - Duration::days(days_past)),
            now,
            end: floor_to_midnight(now + Duration::days(days_future)),
        }
    }
}
