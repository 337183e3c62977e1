//! Deterministic fixture replay: a captured snapshot must solve to the
//! same summary hash on every run, with `now` frozen at the captured
//! instant.

use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset};
use serde_json::json;

use home_ems::config::AppConfig;
use home_ems::domain::plan::PlanStatus;
use home_ems::fixture::{replay, resolve_fixture_paths, FixtureSnapshot};
use home_ems::resolver::provider::{EntityState, HistoryPoint};

const CONFIG_YAML: &str = r#"
provider:
  base_url: http://homeassistant.local:8123
  token: test-token-not-used-in-replay
ems:
  timestep_minutes: 30
  min_horizon_minutes: 120
plant:
  grid:
    max_import_kw: 10.0
    max_export_kw: 8.0
    realtime_price_import:
      entity: sensor.price_import
    realtime_price_export:
      entity: sensor.price_export
    price_import_forecast:
      entity: sensor.price_import_forecast
    price_export_forecast:
      entity: sensor.price_export_forecast
  load:
    realtime_power:
      entity: sensor.house_load
    forecast:
      entity: sensor.house_load
      history_days: 2
      unit: W
      interval_duration: 30
  inverters:
    - id: garage
      name: Garage Inverter
      peak_power_kw: 10.0
      pv:
        forecast:
          entities: [sensor.solcast_today]
      battery:
        capacity_kwh: 10.0
        storage_efficiency_pct: 90.0
        min_soc_pct: 10.0
        max_soc_pct: 95.0
        state_of_charge:
          entity: sensor.battery_soc
loads:
  - load_type: controlled_ev
    id: ev_garage
    name: Garage EV
    min_power_kw: 0.0
    max_power_kw: 7.0
    energy_kwh: 60.0
    connected:
      entity: binary_sensor.ev_connected
    realtime_power:
      entity: sensor.ev_power
    state_of_charge:
      entity: sensor.ev_soc
"#;

fn captured_at() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2025-06-01T08:00:00+00:00").unwrap()
}

fn entity(id: &str, state: &str, attributes: serde_json::Value) -> (String, EntityState) {
    (
        id.to_string(),
        EntityState {
            entity_id: id.to_string(),
            state: state.to_string(),
            attributes,
            last_updated: Some(captured_at()),
        },
    )
}

fn price_forecast(base: f64) -> serde_json::Value {
    let start = captured_at();
    let items: Vec<_> = (0..8)
        .map(|i| {
            json!({
                "start_time": (start + Duration::minutes(30 * i)).to_rfc3339(),
                "end_time": (start + Duration::minutes(30 * (i + 1))).to_rfc3339(),
                "per_kwh": base + 0.01 * i as f64,
            })
        })
        .collect();
    json!({ "forecasts": items })
}

fn pv_forecast() -> serde_json::Value {
    let start = captured_at();
    let items: Vec<_> = (0..8)
        .map(|i| {
            json!({
                "period_start": (start + Duration::minutes(30 * i)).to_rfc3339(),
                "pv_estimate": 3.0,
            })
        })
        .collect();
    json!({ "detailedForecast": items })
}

fn snapshot() -> FixtureSnapshot {
    let states: HashMap<String, EntityState> = [
        entity("sensor.price_import", "0.30", json!({})),
        entity("sensor.price_export", "0.05", json!({})),
        entity("sensor.price_import_forecast", "0.30", price_forecast(0.25)),
        entity("sensor.price_export_forecast", "0.05", price_forecast(0.04)),
        entity("sensor.house_load", "1000", json!({"unit_of_measurement": "W"})),
        entity("sensor.solcast_today", "3.0", pv_forecast()),
        entity("sensor.battery_soc", "50", json!({})),
        entity("binary_sensor.ev_connected", "on", json!({})),
        entity("sensor.ev_power", "0", json!({"unit_of_measurement": "kW"})),
        entity("sensor.ev_soc", "40", json!({})),
    ]
    .into_iter()
    .collect();

    let history = vec![
        HistoryPoint {
            state: "1000".to_string(),
            last_updated: captured_at() - Duration::hours(2),
        },
        HistoryPoint {
            state: "2000".to_string(),
            last_updated: captured_at() - Duration::minutes(30),
        },
    ];

    FixtureSnapshot {
        captured_at: captured_at(),
        states,
        histories: HashMap::from([("sensor.house_load".to_string(), history)]),
    }
}

#[test]
fn replay_is_deterministic_and_tracks_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let paths = resolve_fixture_paths(dir.path(), "summer_morning", None);
    std::fs::create_dir_all(&paths.scenario_dir).unwrap();
    snapshot().write(&paths.fixture_path).unwrap();

    let config = AppConfig::from_yaml_str(CONFIG_YAML).unwrap();

    let first = replay(&config, &paths, true).unwrap();
    assert_eq!(first.plan.status, PlanStatus::Optimal);
    assert_eq!(first.hash.len(), 16);
    assert!(first.matches_baseline.is_none(), "no baseline before first write");
    // Replay is frozen at the captured instant.
    assert_eq!(first.plan.generated_at, captured_at());
    assert_eq!(first.plan.timesteps[0].start, captured_at());
    // Realtime prices override the first slot.
    assert!((first.plan.timesteps[0].economics.price_import - 0.30).abs() < 1e-9);
    assert!((first.plan.timesteps[1].economics.price_import - 0.26).abs() < 1e-9);

    let second = replay(&config, &paths, false).unwrap();
    assert_eq!(second.hash, first.hash);
    assert_eq!(second.matches_baseline, Some(true));
    assert_eq!(second.summary, first.summary);

    // Timings never leak into the baseline.
    assert_eq!(second.plan.timings.total_seconds, 0.0);
}

#[test]
fn replay_fails_cleanly_when_forecast_is_too_short() {
    let dir = tempfile::tempdir().unwrap();
    let paths = resolve_fixture_paths(dir.path(), "short_forecast", None);
    std::fs::create_dir_all(&paths.scenario_dir).unwrap();

    let mut snapshot = snapshot();
    // Truncate the PV forecast to a single 30-minute bucket.
    let pv = snapshot.states.get_mut("sensor.solcast_today").unwrap();
    pv.attributes = json!({
        "detailedForecast": [
            { "period_start": captured_at().to_rfc3339(), "pv_estimate": 3.0 }
        ]
    });
    snapshot.write(&paths.fixture_path).unwrap();

    let config = AppConfig::from_yaml_str(CONFIG_YAML).unwrap();
    let err = replay(&config, &paths, false).unwrap_err();
    assert!(err.to_string().contains("min_horizon_minutes"), "got: {err}");
}
