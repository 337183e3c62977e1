use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize, Serializer};

/// Solver status carried by every published plan. A non-Optimal status is a
/// result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum PlanStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Undefined,
    #[serde(rename = "Not Solved")]
    #[strum(serialize = "Not Solved")]
    NotSolved,
    Unknown,
}

pub(crate) fn round3_value(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round3<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round3_value(*value))
}

fn round3_opt<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_some(&round3_value(*v)),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridTimestepPlan {
    #[serde(serialize_with = "round3")]
    pub import_kw: f64,
    #[serde(serialize_with = "round3")]
    pub export_kw: f64,
    #[serde(serialize_with = "round3")]
    pub net_kw: f64,
    #[serde(default)]
    pub import_allowed: Option<bool>,
    #[serde(default, serialize_with = "round3_opt")]
    pub import_violation_kw: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterTimestepPlan {
    pub name: String,
    #[serde(default, serialize_with = "round3_opt")]
    pub pv_kw: Option<f64>,
    #[serde(default, serialize_with = "round3_opt")]
    pub pv_curtail_kw: Option<f64>,
    #[serde(serialize_with = "round3")]
    pub ac_net_kw: f64,
    #[serde(default, serialize_with = "round3_opt")]
    pub battery_charge_kw: Option<f64>,
    #[serde(default, serialize_with = "round3_opt")]
    pub battery_discharge_kw: Option<f64>,
    #[serde(default, serialize_with = "round3_opt")]
    pub battery_soc_kwh: Option<f64>,
    #[serde(default, serialize_with = "round3_opt")]
    pub battery_soc_pct: Option<f64>,
    #[serde(default)]
    pub curtailment: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvTimestepPlan {
    pub name: String,
    #[serde(serialize_with = "round3")]
    pub charge_kw: f64,
    #[serde(serialize_with = "round3")]
    pub soc_kwh: f64,
    #[serde(default, serialize_with = "round3_opt")]
    pub soc_pct: Option<f64>,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadsTimestepPlan {
    #[serde(serialize_with = "round3")]
    pub base_kw: f64,
    pub evs: BTreeMap<String, EvTimestepPlan>,
    #[serde(serialize_with = "round3")]
    pub total_kw: f64,
}

/// Prices stay unrounded so cost audits can reproduce segment costs
/// exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicsTimestepPlan {
    pub price_import: f64,
    pub price_export: f64,
    pub price_import_effective: f64,
    pub price_export_effective: f64,
    #[serde(serialize_with = "round3")]
    pub segment_cost: f64,
    #[serde(serialize_with = "round3")]
    pub cumulative_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestepPlan {
    pub index: usize,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub duration_s: f64,
    pub grid: GridTimestepPlan,
    pub inverters: BTreeMap<String, InverterTimestepPlan>,
    pub loads: LoadsTimestepPlan,
    pub economics: EconomicsTimestepPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmsPlanTimings {
    pub build_seconds: f64,
    pub solve_seconds: f64,
    pub total_seconds: f64,
}

impl EmsPlanTimings {
    pub fn zeroed() -> Self {
        Self { build_seconds: 0.0, solve_seconds: 0.0, total_seconds: 0.0 }
    }
}

/// Immutable output of one planning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmsPlanOutput {
    pub generated_at: DateTime<FixedOffset>,
    pub status: PlanStatus,
    #[serde(default, serialize_with = "round3_opt")]
    pub objective_value: Option<f64>,
    pub timings: EmsPlanTimings,
    pub timesteps: Vec<TimestepPlan>,
}
