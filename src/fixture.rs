use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::{self, FrozenTime};
use crate::config::AppConfig;
use crate::domain::plan::EmsPlanOutput;
use crate::ems::summary::{plan_hash, summarize_plan};
use crate::error::{EmsError, EmsResult};
use crate::planner::service::plan_once;
use crate::resolver::provider::{EntityState, HistoryPoint, ProviderError, StateProvider};
use crate::resolver::{mark_config_sources, ValueResolver};

pub const DEFAULT_BUCKET_MINUTES: u32 = 60;

/// File layout of one fixture scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixturePaths {
    pub fixture_dir: PathBuf,
    pub scenario_dir: PathBuf,
    pub fixture_path: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub plot_path: PathBuf,
    pub hash_path: PathBuf,
}

pub fn resolve_fixture_paths(
    base_dir: &Path,
    fixture: &str,
    scenario: Option<&str>,
) -> FixturePaths {
    let fixture_dir = base_dir.join(fixture);
    let scenario_dir = match scenario {
        Some(scenario) => fixture_dir.join(scenario),
        None => fixture_dir.clone(),
    };
    FixturePaths {
        fixture_path: scenario_dir.join("ems_fixture.json"),
        config_path: fixture_dir.join("ems_config.yaml"),
        plan_path: scenario_dir.join("ems_plan.json"),
        plot_path: scenario_dir.join("ems_plan.jpeg"),
        hash_path: scenario_dir.join("ems_plan.hash"),
        fixture_dir,
        scenario_dir,
    }
}

/// Point-in-time snapshot of every resolved provider entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSnapshot {
    pub captured_at: DateTime<FixedOffset>,
    pub states: HashMap<String, EntityState>,
    #[serde(default)]
    pub histories: HashMap<String, Vec<HistoryPoint>>,
}

impl FixtureSnapshot {
    pub fn load(path: &Path) -> EmsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| EmsError::Config(format!("invalid fixture {}: {err}", path.display())))
    }

    pub fn write(&self, path: &Path) -> EmsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|err| EmsError::Config(format!("fixture serialization failed: {err}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Provider backed by a captured snapshot; replay never touches the
/// network.
pub struct FixtureProvider {
    snapshot: FixtureSnapshot,
}

impl FixtureProvider {
    pub fn new(snapshot: FixtureSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl StateProvider for FixtureProvider {
    async fn fetch_states(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityState>, ProviderError> {
        let mut states = HashMap::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            let state = self
                .snapshot
                .states
                .get(entity_id)
                .ok_or_else(|| ProviderError::NotFound(entity_id.clone()))?;
            states.insert(entity_id.clone(), state.clone());
        }
        Ok(states)
    }

    async fn fetch_history(
        &self,
        entity_id: &str,
        _start: DateTime<FixedOffset>,
        _end: DateTime<FixedOffset>,
    ) -> Result<Vec<HistoryPoint>, ProviderError> {
        Ok(self.snapshot.histories.get(entity_id).cloned().unwrap_or_default())
    }
}

/// Capture the current provider state for every source the configuration
/// marks, producing a replayable snapshot.
pub async fn capture_snapshot(
    config: &AppConfig,
    provider: Arc<dyn StateProvider>,
) -> EmsResult<FixtureSnapshot> {
    let captured_at = clock::now();
    let mut resolver = ValueResolver::new(provider, captured_at);
    mark_config_sources(config, &mut resolver);
    resolver.hydrate().await?;
    Ok(FixtureSnapshot {
        captured_at,
        states: resolver.states().clone(),
        histories: resolver.histories().clone(),
    })
}

#[derive(Debug)]
pub struct ReplayOutcome {
    pub plan: EmsPlanOutput,
    pub summary: serde_json::Value,
    pub hash: String,
    /// `Some(false)` when a stored hash exists and differs.
    pub matches_baseline: Option<bool>,
}

/// Deterministically replay a captured fixture: freeze `now` at the
/// captured instant, hydrate from the snapshot, solve, and summarize.
pub fn replay(config: &AppConfig, paths: &FixturePaths, write: bool) -> EmsResult<ReplayOutcome> {
    let snapshot = FixtureSnapshot::load(&paths.fixture_path)?;
    let now = snapshot.captured_at;
    let _frozen = FrozenTime::freeze(now);

    let mut resolver =
        ValueResolver::new(Arc::new(FixtureProvider::new(snapshot.clone())), now);
    mark_config_sources(config, &mut resolver);
    resolver.hydrate_from_snapshot(snapshot.states, snapshot.histories);

    let mut plan = plan_once(config, &resolver, now)?;
    plan.timings = crate::domain::plan::EmsPlanTimings::zeroed();

    let summary = summarize_plan(&plan, DEFAULT_BUCKET_MINUTES)?;
    let hash = plan_hash(&summary);

    let matches_baseline = match std::fs::read_to_string(&paths.hash_path) {
        Ok(stored) => Some(stored.trim() == hash),
        Err(_) => None,
    };

    if write {
        std::fs::create_dir_all(&paths.scenario_dir)?;
        std::fs::write(&paths.plan_path, serde_json::to_string_pretty(&summary).unwrap_or_default())?;
        std::fs::write(&paths.hash_path, format!("{hash}\n"))?;
        info!(hash = %hash, path = %paths.plan_path.display(), "fixture baseline updated");
    }

    Ok(ReplayOutcome { plan, summary, hash, matches_baseline })
}
