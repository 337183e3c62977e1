use chrono::Duration;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::plan::{round3_value, EmsPlanOutput};
use crate::error::{EmsError, EmsResult};

/// Round every float in a JSON tree to three decimals.
fn round_floats(value: Value) -> Value {
    match value {
        Value::Number(number) => {
            if let Some(f) = number.as_f64() {
                if number.is_f64() {
                    return json!(round3_value(f));
                }
            }
            Value::Number(number)
        }
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, round_floats(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(round_floats).collect()),
        other => other,
    }
}

fn update_min(current: Option<f64>, value: f64) -> Option<f64> {
    Some(match current {
        Some(current) if current <= value => current,
        _ => value,
    })
}

fn update_max(current: Option<f64>, value: f64) -> Option<f64> {
    Some(match current {
        Some(current) if current >= value => current,
        _ => value,
    })
}

fn update_min_max(
    min: Option<f64>,
    max: Option<f64>,
    value: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    match value {
        Some(value) => (update_min(min, value), update_max(max, value)),
        None => (min, max),
    }
}

#[derive(Default)]
struct InverterStats {
    pv_kwh: f64,
    ac_net_kwh: f64,
    battery_charge_kwh: f64,
    battery_discharge_kwh: f64,
    soc_pct_min: Option<f64>,
    soc_pct_max: Option<f64>,
    soc_pct_end: Option<f64>,
    soc_kwh_min: Option<f64>,
    soc_kwh_max: Option<f64>,
    soc_kwh_end: Option<f64>,
    curtailment_minutes: f64,
}

#[derive(Default)]
struct EvStats {
    charge_kwh: f64,
    soc_kwh_min: Option<f64>,
    soc_kwh_max: Option<f64>,
    soc_kwh_end: Option<f64>,
    soc_pct_min: Option<f64>,
    soc_pct_max: Option<f64>,
    soc_pct_end: Option<f64>,
    connected_minutes: f64,
}

/// Zero the timings of a serialized plan, for byte-stable comparisons.
pub fn normalize_plan_payload(mut payload: Value) -> Value {
    if let Some(timings) = payload.get_mut("timings").and_then(Value::as_object_mut) {
        for (_, value) in timings.iter_mut() {
            *value = json!(0.0);
        }
    }
    payload
}

/// Aggregate a plan into a compact summary document: metadata, totals,
/// price extrema, per-inverter and per-EV statistics, and fixed-size
/// bucket aggregation (steps split proportionally by overlap).
pub fn summarize_plan(plan: &EmsPlanOutput, bucket_minutes: u32) -> EmsResult<Value> {
    if bucket_minutes == 0 {
        return Err(EmsError::Config("bucket_minutes must be positive".to_string()));
    }

    let timesteps = &plan.timesteps;
    if timesteps.is_empty() {
        let summary = json!({
            "meta": {
                "generated_at": plan.generated_at.to_rfc3339(),
                "status": plan.status,
                "objective_value": plan.objective_value,
                "horizon_start": null,
                "horizon_end": null,
                "timesteps": 0,
                "duration_minutes": 0.0,
                "timestep_minutes": {"min": null, "max": null, "avg": null, "unique": []},
                "bucket_minutes": bucket_minutes,
            },
            "totals": {},
            "prices": {},
            "inverters": {},
            "evs": {},
            "buckets": [],
        });
        return Ok(round_floats(summary));
    }

    let horizon_start = timesteps[0].start;
    let horizon_end = timesteps[timesteps.len() - 1].end;
    let total_seconds: f64 = timesteps.iter().map(|step| step.duration_s).sum();
    let total_minutes = total_seconds / 60.0;
    let step_minutes: Vec<f64> = timesteps.iter().map(|step| step.duration_s / 60.0).collect();

    let mut grid_import_kwh = 0.0;
    let mut grid_export_kwh = 0.0;
    let mut grid_net_kwh = 0.0;
    let mut grid_import_violation_kwh = 0.0;
    let mut grid_import_kw_max: Option<f64> = None;
    let mut grid_export_kw_max: Option<f64> = None;
    let mut grid_net_kw_max: Option<f64> = None;
    let mut grid_net_kw_min: Option<f64> = None;

    let mut load_base_kwh = 0.0;
    let mut load_total_kwh = 0.0;
    let mut ev_charge_kwh = 0.0;
    let mut pv_kwh = 0.0;
    let mut battery_charge_kwh = 0.0;
    let mut battery_discharge_kwh = 0.0;

    let mut segment_cost_total = 0.0;
    let mut price_import_min: Option<f64> = None;
    let mut price_import_max: Option<f64> = None;
    let mut price_export_min: Option<f64> = None;
    let mut price_export_max: Option<f64> = None;
    let mut price_import_weighted = 0.0;
    let mut price_export_weighted = 0.0;

    let mut inverter_stats: std::collections::BTreeMap<String, InverterStats> = Default::default();
    let mut ev_stats: std::collections::BTreeMap<String, EvStats> = Default::default();

    for step in timesteps {
        let duration_hours = step.duration_s / 3600.0;
        let duration_minutes = step.duration_s / 60.0;

        grid_import_kwh += step.grid.import_kw * duration_hours;
        grid_export_kwh += step.grid.export_kw * duration_hours;
        grid_net_kwh += step.grid.net_kw * duration_hours;
        if let Some(violation) = step.grid.import_violation_kw {
            grid_import_violation_kwh += violation * duration_hours;
        }
        grid_import_kw_max = update_max(grid_import_kw_max, step.grid.import_kw);
        grid_export_kw_max = update_max(grid_export_kw_max, step.grid.export_kw);
        grid_net_kw_max = update_max(grid_net_kw_max, step.grid.net_kw);
        grid_net_kw_min = update_min(grid_net_kw_min, step.grid.net_kw);

        load_base_kwh += step.loads.base_kw * duration_hours;
        load_total_kwh += step.loads.total_kw * duration_hours;

        segment_cost_total += step.economics.segment_cost;
        (price_import_min, price_import_max) =
            update_min_max(price_import_min, price_import_max, Some(step.economics.price_import));
        (price_export_min, price_export_max) =
            update_min_max(price_export_min, price_export_max, Some(step.economics.price_export));
        price_import_weighted += step.economics.price_import * duration_hours;
        price_export_weighted += step.economics.price_export * duration_hours;

        let mut step_pv_kw = 0.0;
        let mut step_battery_charge_kw = 0.0;
        let mut step_battery_discharge_kw = 0.0;
        for (inverter_id, inverter) in &step.inverters {
            let stats = inverter_stats.entry(inverter_id.clone()).or_default();
            let pv_kw = inverter.pv_kw.unwrap_or(0.0);
            let charge_kw = inverter.battery_charge_kw.unwrap_or(0.0);
            let discharge_kw = inverter.battery_discharge_kw.unwrap_or(0.0);
            stats.pv_kwh += pv_kw * duration_hours;
            stats.ac_net_kwh += inverter.ac_net_kw * duration_hours;
            stats.battery_charge_kwh += charge_kw * duration_hours;
            stats.battery_discharge_kwh += discharge_kw * duration_hours;
            (stats.soc_pct_min, stats.soc_pct_max) =
                update_min_max(stats.soc_pct_min, stats.soc_pct_max, inverter.battery_soc_pct);
            (stats.soc_kwh_min, stats.soc_kwh_max) =
                update_min_max(stats.soc_kwh_min, stats.soc_kwh_max, inverter.battery_soc_kwh);
            if inverter.battery_soc_pct.is_some() {
                stats.soc_pct_end = inverter.battery_soc_pct;
            }
            if inverter.battery_soc_kwh.is_some() {
                stats.soc_kwh_end = inverter.battery_soc_kwh;
            }
            if inverter.curtailment == Some(true) {
                stats.curtailment_minutes += duration_minutes;
            }
            step_pv_kw += pv_kw;
            step_battery_charge_kw += charge_kw;
            step_battery_discharge_kw += discharge_kw;
        }

        let mut step_ev_charge_kw = 0.0;
        for (ev_id, ev) in &step.loads.evs {
            let stats = ev_stats.entry(ev_id.clone()).or_default();
            stats.charge_kwh += ev.charge_kw * duration_hours;
            (stats.soc_kwh_min, stats.soc_kwh_max) =
                update_min_max(stats.soc_kwh_min, stats.soc_kwh_max, Some(ev.soc_kwh));
            (stats.soc_pct_min, stats.soc_pct_max) =
                update_min_max(stats.soc_pct_min, stats.soc_pct_max, ev.soc_pct);
            stats.soc_kwh_end = Some(ev.soc_kwh);
            if ev.soc_pct.is_some() {
                stats.soc_pct_end = ev.soc_pct;
            }
            if ev.connected {
                stats.connected_minutes += duration_minutes;
            }
            step_ev_charge_kw += ev.charge_kw;
        }

        pv_kwh += step_pv_kw * duration_hours;
        battery_charge_kwh += step_battery_charge_kw * duration_hours;
        battery_discharge_kwh += step_battery_discharge_kw * duration_hours;
        ev_charge_kwh += step_ev_charge_kw * duration_hours;
    }

    // Fixed-size buckets over the horizon; the last may be shorter.
    let bucket_seconds = f64::from(bucket_minutes) * 60.0;
    let horizon_seconds = (horizon_end - horizon_start).num_seconds() as f64;
    let bucket_count = ((horizon_seconds / bucket_seconds).ceil() as usize).max(1);
    let mut buckets: Vec<Map<String, Value>> = (0..bucket_count)
        .map(|index| {
            let bucket_start =
                horizon_start + Duration::seconds((index as f64 * bucket_seconds) as i64);
            let bucket_end =
                (bucket_start + Duration::seconds(bucket_seconds as i64)).min(horizon_end);
            let mut map = Map::new();
            map.insert("start".to_string(), json!(bucket_start.to_rfc3339()));
            map.insert("end".to_string(), json!(bucket_end.to_rfc3339()));
            for key in [
                "grid_import_kwh",
                "grid_export_kwh",
                "grid_net_kwh",
                "load_kwh",
                "pv_kwh",
                "battery_charge_kwh",
                "battery_discharge_kwh",
                "ev_charge_kwh",
                "curtailment_minutes",
            ] {
                map.insert(key.to_string(), json!(0.0));
            }
            map
        })
        .collect();

    for step in timesteps {
        let step_pv_kw: f64 = step.inverters.values().map(|inv| inv.pv_kw.unwrap_or(0.0)).sum();
        let step_charge_kw: f64 =
            step.inverters.values().map(|inv| inv.battery_charge_kw.unwrap_or(0.0)).sum();
        let step_discharge_kw: f64 =
            step.inverters.values().map(|inv| inv.battery_discharge_kw.unwrap_or(0.0)).sum();
        let step_ev_kw: f64 = step.loads.evs.values().map(|ev| ev.charge_kw).sum();
        let curtailment_active =
            step.inverters.values().any(|inv| inv.curtailment == Some(true));

        // Split each step across the buckets it overlaps.
        let mut cursor = step.start;
        while cursor < step.end {
            let bucket_index = (((cursor - horizon_start).num_seconds() as f64) / bucket_seconds)
                .floor() as usize;
            let bucket_index = bucket_index.min(buckets.len() - 1);
            let bucket_end = horizon_start
                + Duration::seconds(((bucket_index as f64 + 1.0) * bucket_seconds) as i64);
            let overlap_end = step.end.min(bucket_end);
            let overlap_seconds = (overlap_end - cursor).num_seconds() as f64;
            if overlap_seconds <= 0.0 {
                break;
            }
            let duration_hours = overlap_seconds / 3600.0;
            let duration_minutes = overlap_seconds / 60.0;
            let bucket = &mut buckets[bucket_index];
            let mut add = |key: &str, delta: f64| {
                let entry = bucket.get_mut(key).expect("bucket key");
                *entry = json!(entry.as_f64().unwrap_or(0.0) + delta);
            };
            add("grid_import_kwh", step.grid.import_kw * duration_hours);
            add("grid_export_kwh", step.grid.export_kw * duration_hours);
            add("grid_net_kwh", step.grid.net_kw * duration_hours);
            add("load_kwh", step.loads.total_kw * duration_hours);
            add("pv_kwh", step_pv_kw * duration_hours);
            add("battery_charge_kwh", step_charge_kw * duration_hours);
            add("battery_discharge_kwh", step_discharge_kw * duration_hours);
            add("ev_charge_kwh", step_ev_kw * duration_hours);
            if curtailment_active {
                add("curtailment_minutes", duration_minutes);
            }
            cursor = overlap_end;
        }
    }

    let total_cost = timesteps[timesteps.len() - 1].economics.cumulative_cost;
    let total_hours = total_seconds / 3600.0;
    let price_import_avg = price_import_weighted / total_hours;
    let price_export_avg = price_export_weighted / total_hours;

    let mut unique_minutes: Vec<f64> = step_minutes.clone();
    unique_minutes.sort_by(|a, b| a.total_cmp(b));
    unique_minutes.dedup();

    let inverters: Map<String, Value> = inverter_stats
        .into_iter()
        .map(|(id, stats)| {
            (
                id,
                json!({
                    "pv_kwh": stats.pv_kwh,
                    "ac_net_kwh": stats.ac_net_kwh,
                    "battery_charge_kwh": stats.battery_charge_kwh,
                    "battery_discharge_kwh": stats.battery_discharge_kwh,
                    "soc_pct_min": stats.soc_pct_min,
                    "soc_pct_max": stats.soc_pct_max,
                    "soc_pct_end": stats.soc_pct_end,
                    "soc_kwh_min": stats.soc_kwh_min,
                    "soc_kwh_max": stats.soc_kwh_max,
                    "soc_kwh_end": stats.soc_kwh_end,
                    "curtailment_minutes": stats.curtailment_minutes,
                }),
            )
        })
        .collect();

    let evs: Map<String, Value> = ev_stats
        .into_iter()
        .map(|(id, stats)| {
            (
                id,
                json!({
                    "charge_kwh": stats.charge_kwh,
                    "soc_kwh_min": stats.soc_kwh_min,
                    "soc_kwh_max": stats.soc_kwh_max,
                    "soc_kwh_end": stats.soc_kwh_end,
                    "soc_pct_min": stats.soc_pct_min,
                    "soc_pct_max": stats.soc_pct_max,
                    "soc_pct_end": stats.soc_pct_end,
                    "connected_minutes": stats.connected_minutes,
                }),
            )
        })
        .collect();

    let summary = json!({
        "meta": {
            "generated_at": plan.generated_at.to_rfc3339(),
            "status": plan.status,
            "objective_value": plan.objective_value,
            "horizon_start": horizon_start.to_rfc3339(),
            "horizon_end": horizon_end.to_rfc3339(),
            "timesteps": timesteps.len(),
            "duration_minutes": total_minutes,
            "timestep_minutes": {
                "min": step_minutes.iter().cloned().fold(f64::INFINITY, f64::min),
                "max": step_minutes.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                "avg": total_minutes / timesteps.len() as f64,
                "unique": unique_minutes,
            },
            "bucket_minutes": bucket_minutes,
        },
        "totals": {
            "grid_import_kwh": grid_import_kwh,
            "grid_export_kwh": grid_export_kwh,
            "grid_net_kwh": grid_net_kwh,
            "grid_import_violation_kwh": grid_import_violation_kwh,
            "grid_import_kw_max": grid_import_kw_max,
            "grid_export_kw_max": grid_export_kw_max,
            "grid_net_kw_max": grid_net_kw_max,
            "grid_net_kw_min": grid_net_kw_min,
            "load_base_kwh": load_base_kwh,
            "load_total_kwh": load_total_kwh,
            "ev_charge_kwh": ev_charge_kwh,
            "pv_kwh": pv_kwh,
            "battery_charge_kwh": battery_charge_kwh,
            "battery_discharge_kwh": battery_discharge_kwh,
            "segment_cost_total": segment_cost_total,
            "total_cost": total_cost,
        },
        "prices": {
            "import_min": price_import_min,
            "import_max": price_import_max,
            "import_avg": price_import_avg,
            "export_min": price_export_min,
            "export_max": price_export_max,
            "export_avg": price_export_avg,
        },
        "inverters": inverters,
        "evs": evs,
        "buckets": buckets,
    });

    Ok(round_floats(summary))
}

/// SHA-256 of the canonical summary (sorted keys, `meta.generated_at`
/// excluded), truncated to 16 hex characters.
pub fn plan_hash(summary: &Value) -> String {
    let mut normalized = summary.clone();
    if let Some(meta) = normalized.get_mut("meta").and_then(Value::as_object_mut) {
        meta.remove("generated_at");
    }
    let serialized = serde_json::to_string(&normalized).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::{
        EconomicsTimestepPlan, EmsPlanTimings, EvTimestepPlan, GridTimestepPlan,
        InverterTimestepPlan, LoadsTimestepPlan, PlanStatus, TimestepPlan,
    };
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn sample_plan() -> EmsPlanOutput {
        let start = chrono::Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap().fixed_offset();
        let mut timesteps = Vec::new();
        let mut cumulative = 0.0;
        for t in 0..4usize {
            let slot_start = start + Duration::minutes(30 * t as i64);
            let slot_end = slot_start + Duration::minutes(30);
            let import_kw = if t < 2 { 1.0 } else { 0.0 };
            let export_kw = if t >= 2 { 2.0 } else { 0.0 };
            let segment_cost = (import_kw * 0.3 - export_kw * 0.1) * 0.5;
            cumulative += segment_cost;

            let mut inverters = BTreeMap::new();
            inverters.insert(
                "garage".to_string(),
                InverterTimestepPlan {
                    name: "Garage".to_string(),
                    pv_kw: Some(1.5),
                    pv_curtail_kw: Some(0.0),
                    ac_net_kw: 1.5,
                    battery_charge_kw: Some(0.5),
                    battery_discharge_kw: Some(0.0),
                    battery_soc_kwh: Some(5.0 + t as f64),
                    battery_soc_pct: Some(50.0 + t as f64 * 10.0),
                    curtailment: Some(t == 3),
                },
            );
            let mut evs = BTreeMap::new();
            evs.insert(
                "ev_garage".to_string(),
                EvTimestepPlan {
                    name: "EV".to_string(),
                    charge_kw: 1.0,
                    soc_kwh: 30.0 + t as f64,
                    soc_pct: Some(50.0),
                    connected: true,
                },
            );
            timesteps.push(TimestepPlan {
                index: t,
                start: slot_start,
                end: slot_end,
                duration_s: 1800.0,
                grid: GridTimestepPlan {
                    import_kw,
                    export_kw,
                    net_kw: import_kw - export_kw,
                    import_allowed: Some(true),
                    import_violation_kw: Some(0.0),
                },
                inverters,
                loads: LoadsTimestepPlan { base_kw: 0.5, evs, total_kw: 1.5 },
                economics: EconomicsTimestepPlan {
                    price_import: 0.3,
                    price_export: 0.1,
                    price_import_effective: 0.3,
                    price_export_effective: 0.1,
                    segment_cost,
                    cumulative_cost: cumulative,
                },
            });
        }
        EmsPlanOutput {
            generated_at: start,
            status: PlanStatus::Optimal,
            objective_value: Some(-1.23456),
            timings: EmsPlanTimings {
                build_seconds: 0.01,
                solve_seconds: 0.2,
                total_seconds: 0.3,
            },
            timesteps,
        }
    }

    #[test]
    fn totals_aggregate_energy() {
        let summary = summarize_plan(&sample_plan(), 60).unwrap();
        let totals = &summary["totals"];
        assert_eq!(totals["grid_import_kwh"], 1.0);
        assert_eq!(totals["grid_export_kwh"], 2.0);
        assert_eq!(totals["ev_charge_kwh"], 2.0);
        assert_eq!(totals["pv_kwh"], 3.0);
        assert_eq!(totals["battery_charge_kwh"], 1.0);
        assert_eq!(summary["meta"]["timesteps"], 4);
        assert_eq!(summary["meta"]["duration_minutes"], 120.0);
    }

    #[test]
    fn buckets_split_steps_by_overlap() {
        let summary = summarize_plan(&sample_plan(), 60).unwrap();
        let buckets = summary["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        // First hour imports 1 kW for both slots; second hour exports 2 kW.
        assert_eq!(buckets[0]["grid_import_kwh"], 1.0);
        assert_eq!(buckets[1]["grid_export_kwh"], 2.0);
        // Curtailment only in the final 30-minute slot.
        assert_eq!(buckets[1]["curtailment_minutes"], 30.0);
    }

    #[test]
    fn inverter_and_ev_stats_track_bounds_and_endpoint() {
        let summary = summarize_plan(&sample_plan(), 60).unwrap();
        let inverter = &summary["inverters"]["garage"];
        assert_eq!(inverter["soc_pct_min"], 50.0);
        assert_eq!(inverter["soc_pct_max"], 80.0);
        assert_eq!(inverter["soc_pct_end"], 80.0);
        assert_eq!(inverter["curtailment_minutes"], 30.0);
        let ev = &summary["evs"]["ev_garage"];
        assert_eq!(ev["connected_minutes"], 120.0);
        assert_eq!(ev["soc_kwh_end"], 33.0);
    }

    #[test]
    fn hash_is_stable_and_ignores_generated_at() {
        let plan = sample_plan();
        let summary = summarize_plan(&plan, 60).unwrap();
        let first = plan_hash(&summary);
        assert_eq!(first.len(), 16);
        assert_eq!(first, plan_hash(&summary));

        let mut shifted = plan.clone();
        shifted.generated_at = plan.generated_at + Duration::hours(1);
        // generated_at differs, but the hash does not see it.
        let mut shifted_summary = summarize_plan(&shifted, 60).unwrap();
        assert_ne!(summary, shifted_summary);
        assert_eq!(first, plan_hash(&shifted_summary));
        // Any other change does move the hash.
        shifted_summary["totals"]["pv_kwh"] = json!(99.0);
        assert_ne!(first, plan_hash(&shifted_summary));
    }

    #[test]
    fn empty_plan_summarizes_without_totals() {
        let plan = EmsPlanOutput {
            generated_at: chrono::Utc
                .with_ymd_and_hms(2025, 6, 1, 8, 0, 0)
                .unwrap()
                .fixed_offset(),
            status: PlanStatus::NotSolved,
            objective_value: None,
            timings: EmsPlanTimings::zeroed(),
            timesteps: Vec::new(),
        };
        let summary = summarize_plan(&plan, 60).unwrap();
        assert_eq!(summary["meta"]["timesteps"], 0);
        assert_eq!(summary["buckets"], json!([]));
    }

    #[test]
    fn normalize_zeroes_timings() {
        let payload = serde_json::to_value(sample_plan()).unwrap();
        let normalized = normalize_plan_payload(payload);
        assert_eq!(normalized["timings"]["solve_seconds"], 0.0);
        assert_eq!(normalized["timings"]["total_seconds"], 0.0);
    }
}
