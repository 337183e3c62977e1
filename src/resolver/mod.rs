pub mod provider;
pub mod sources;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::domain::loads::LoadConfig;
use crate::error::{EmsError, EmsResult};
use provider::{EntityState, HistoryPoint, ProviderError, StateProvider};

const HYDRATE_ATTEMPTS: u32 = 3;
const HYDRATE_BACKOFF_MS: u64 = 250;

/// Two-phase mediator between typed configuration and the data provider.
///
/// Sources are marked first; `hydrate` then fetches every marked entity and
/// history in one pass. Entities that were never marked are never fetched,
/// and the hydrated cache lives only for one planning pass.
pub struct ValueResolver {
    provider: Arc<dyn StateProvider>,
    now: DateTime<FixedOffset>,
    marked_entities: BTreeSet<String>,
    marked_histories: BTreeMap<String, u32>,
    states: HashMap<String, EntityState>,
    histories: HashMap<String, Vec<HistoryPoint>>,
}

impl ValueResolver {
    pub fn new(provider: Arc<dyn StateProvider>, now: DateTime<FixedOffset>) -> Self {
        Self {
            provider,
            now,
            marked_entities: BTreeSet::new(),
            marked_histories: BTreeMap::new(),
            states: HashMap::new(),
            histories: HashMap::new(),
        }
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.now
    }

    /// Register an entity for the bulk fetch. Idempotent.
    pub fn mark_entity(&mut self, entity_id: &str) {
        self.marked_entities.insert(entity_id.to_string());
    }

    /// Register an entity history; conflicting retention requirements
    /// resolve to the maximum.
    pub fn mark_history(&mut self, entity_id: &str, history_days: u32) {
        self.marked_entities.insert(entity_id.to_string());
        let days = self.marked_histories.entry(entity_id.to_string()).or_insert(0);
        *days = (*days).max(history_days);
    }

    pub fn marked_entities(&self) -> impl Iterator<Item = &str> {
        self.marked_entities.iter().map(String::as_str)
    }

    /// Fetch all marked entities and histories. Transient provider errors
    /// are retried with bounded backoff before surfacing.
    pub async fn hydrate(&mut self) -> EmsResult<()> {
        let entity_ids: Vec<String> = self.marked_entities.iter().cloned().collect();
        debug!(entities = entity_ids.len(), histories = self.marked_histories.len(), "hydrating resolver");

        self.states = retry_transient(|| self.provider.fetch_states(&entity_ids)).await?;

        for (entity_id, days) in &self.marked_histories {
            let start = self.now - chrono::Duration::days(i64::from(*days));
            let history =
                retry_transient(|| self.provider.fetch_history(entity_id, start, self.now)).await?;
            self.histories.insert(entity_id.clone(), history);
        }
        Ok(())
    }

    /// Seed the resolver directly from a captured snapshot (fixture replay
    /// path; no provider round-trip).
    pub fn hydrate_from_snapshot(
        &mut self,
        states: HashMap<String, EntityState>,
        histories: HashMap<String, Vec<HistoryPoint>>,
    ) {
        self.states = states;
        self.histories = histories;
    }

    pub fn state(&self, entity_id: &str) -> EmsResult<&EntityState> {
        self.states
            .get(entity_id)
            .ok_or_else(|| EmsError::Resolve(format!("entity not found: {entity_id}")))
    }

    pub fn history(&self, entity_id: &str) -> EmsResult<&[HistoryPoint]> {
        self.histories
            .get(entity_id)
            .map(Vec::as_slice)
            .ok_or_else(|| EmsError::Resolve(format!("history not found: {entity_id}")))
    }

    pub fn states(&self) -> &HashMap<String, EntityState> {
        &self.states
    }

    pub fn histories(&self) -> &HashMap<String, Vec<HistoryPoint>> {
        &self.histories
    }
}

async fn retry_transient<T, F, Fut>(mut fetch: F) -> EmsResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match fetch().await {
            Ok(value) => return Ok(value),
            Err(ProviderError::Transient(msg)) => {
                attempt += 1;
                if attempt >= HYDRATE_ATTEMPTS {
                    return Err(EmsError::Provider(msg));
                }
                let backoff = Duration::from_millis(HYDRATE_BACKOFF_MS << (attempt - 1));
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %msg, "transient provider error, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(ProviderError::NotFound(entity)) => {
                return Err(EmsError::Resolve(format!("entity not found: {entity}")))
            }
            Err(ProviderError::Other(msg)) => return Err(EmsError::Provider(msg)),
        }
    }
}

/// Walk the configuration tree and mark every typed source.
pub fn mark_config_sources(config: &AppConfig, resolver: &mut ValueResolver) {
    let plant = &config.plant;
    plant.grid.realtime_price_import.mark(resolver);
    plant.grid.realtime_price_export.mark(resolver);
    plant.grid.price_import_forecast.mark(resolver);
    plant.grid.price_export_forecast.mark(resolver);
    plant.load.realtime_power.mark(resolver);
    plant.load.forecast.mark(resolver);
    for inverter in &plant.inverters {
        if let Some(realtime) = &inverter.pv.realtime_power {
            realtime.mark(resolver);
        }
        inverter.pv.forecast.mark(resolver);
        if let Some(battery) = &inverter.battery {
            battery.state_of_charge.mark(resolver);
        }
    }
    for load in &config.loads {
        let LoadConfig::ControlledEv(ev) = load;
        ev.connected.mark(resolver);
        if let Some(can_connect) = &ev.can_connect {
            can_connect.mark(resolver);
        }
        ev.realtime_power.mark(resolver);
        ev.state_of_charge.mark(resolver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        failures: AtomicU32,
    }

    #[async_trait]
    impl StateProvider for FlakyProvider {
        async fn fetch_states(
            &self,
            entity_ids: &[String],
        ) -> Result<HashMap<String, EntityState>, ProviderError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Err(ProviderError::Transient("connection reset".to_string()));
            }
            Ok(entity_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        EntityState {
                            entity_id: id.clone(),
                            state: "1.0".to_string(),
                            attributes: serde_json::json!({}),
                            last_updated: None,
                        },
                    )
                })
                .collect())
        }

        async fn fetch_history(
            &self,
            _entity_id: &str,
            _start: DateTime<FixedOffset>,
            _end: DateTime<FixedOffset>,
        ) -> Result<Vec<HistoryPoint>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn now() -> DateTime<FixedOffset> {
        chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap().fixed_offset()
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_retries_transient_failures() {
        let provider = Arc::new(FlakyProvider { failures: AtomicU32::new(2) });
        let mut resolver = ValueResolver::new(provider, now());
        resolver.mark_entity("sensor.load");
        resolver.hydrate().await.unwrap();
        assert!(resolver.state("sensor.load").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_surfaces_exhausted_retries() {
        let provider = Arc::new(FlakyProvider { failures: AtomicU32::new(10) });
        let mut resolver = ValueResolver::new(provider, now());
        resolver.mark_entity("sensor.load");
        let err = resolver.hydrate().await.unwrap_err();
        assert!(matches!(err, EmsError::Provider(_)));
    }

    #[test]
    fn history_days_conflicts_resolve_to_max() {
        let provider = Arc::new(FlakyProvider { failures: AtomicU32::new(0) });
        let mut resolver = ValueResolver::new(provider, now());
        resolver.mark_history("sensor.load", 3);
        resolver.mark_history("sensor.load", 7);
        resolver.mark_history("sensor.load", 5);
        assert_eq!(resolver.marked_histories.get("sensor.load"), Some(&7));
    }

    #[test]
    fn unmarked_entity_is_not_resolvable() {
        let provider = Arc::new(FlakyProvider { failures: AtomicU32::new(0) });
        let resolver = ValueResolver::new(provider, now());
        assert!(matches!(resolver.state("sensor.load"), Err(EmsError::Resolve(_))));
    }
}
