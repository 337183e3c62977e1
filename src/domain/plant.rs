use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::resolver::sources::{
    CurrencySource, HistoricalLoadForecastSource, PercentageSource, PowerSource, PriceForecastSource,
    PvForecastSource,
};

/// `HH:MM` wall-clock window, optionally scoped to months. May wrap
/// midnight; `start == end` matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TimeWindow {
    #[validate(custom(function = "validate_hhmm"))]
    pub start: String,
    #[validate(custom(function = "validate_hhmm"))]
    pub end: String,
    #[serde(default)]
    #[validate(custom(function = "validate_months"))]
    pub months: Option<Vec<String>>,
}

pub(crate) fn validate_hhmm(value: &str) -> Result<(), ValidationError> {
    let bytes = value.as_bytes();
    let well_formed = bytes.len() == 5
        && bytes[2] == b':'
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[3].is_ascii_digit()
        && bytes[4].is_ascii_digit();
    if !well_formed {
        return Err(ValidationError::new("time windows must use HH:MM"));
    }
    let hour: u32 = value[0..2].parse().map_err(|_| ValidationError::new("bad hour"))?;
    let minute: u32 = value[3..5].parse().map_err(|_| ValidationError::new("bad minute"))?;
    if hour > 23 || minute > 59 {
        return Err(ValidationError::new("time window out of range"));
    }
    Ok(())
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn validate_months(months: &[String]) -> Result<(), ValidationError> {
    for month in months {
        if !MONTHS.contains(&month.as_str()) {
            return Err(ValidationError::new(
                "months must use 3-letter lowercase abbreviations",
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_id(value: &str) -> Result<(), ValidationError> {
    let mut chars = value.chars();
    let leading_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if leading_ok && rest_ok {
        Ok(())
    } else {
        Err(ValidationError::new(
            "id must be lowercase letters, numbers, and underscores",
        ))
    }
}

/// Time-ramped price risk bias with optional clamps on raw prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GridPriceRiskSettings {
    #[validate(range(min = 0.0, max = 100.0))]
    pub bias_pct: f64,
    #[serde(default)]
    pub ramp_start_after_minutes: u32,
    #[serde(default)]
    pub ramp_duration_minutes: u32,
    #[serde(default)]
    pub import_price_floor: Option<f64>,
    #[serde(default)]
    pub export_price_ceiling: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    #[validate(range(min = 0.0))]
    pub max_import_kw: f64,
    #[validate(range(min = 0.0))]
    pub max_export_kw: f64,
    pub realtime_price_import: CurrencySource,
    pub realtime_price_export: CurrencySource,
    #[validate(nested)]
    pub price_import_forecast: PriceForecastSource,
    #[validate(nested)]
    pub price_export_forecast: PriceForecastSource,
    #[serde(default)]
    #[validate(nested)]
    pub import_forbidden_periods: Vec<TimeWindow>,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub price_bias_pct: f64,
    #[serde(default)]
    #[validate(nested)]
    pub price_risk: Option<GridPriceRiskSettings>,
}

/// Uncontrolled base demand: realtime reading plus a historical-average
/// forecast.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BaseLoadConfig {
    pub realtime_power: PowerSource,
    #[validate(nested)]
    pub forecast: HistoricalLoadForecastSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PvSettings {
    #[serde(default)]
    pub realtime_power: Option<PowerSource>,
    #[validate(nested)]
    pub forecast: PvForecastSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_battery_soc_bounds"))]
pub struct BatterySettings {
    #[validate(range(min = 0.0))]
    pub capacity_kwh: f64,
    /// Round-trip storage efficiency; a single-sided sqrt is applied on
    /// each of charge and discharge.
    #[validate(range(min = 1.0, max = 100.0))]
    pub storage_efficiency_pct: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub wear_cost_per_kwh: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_pct: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_pct: f64,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub reserve_soc_pct: f64,
    #[serde(default)]
    pub max_charge_kw: Option<f64>,
    #[serde(default)]
    pub max_discharge_kw: Option<f64>,
    pub state_of_charge: PercentageSource,
}

fn validate_battery_soc_bounds(battery: &BatterySettings) -> Result<(), ValidationError> {
    if battery.min_soc_pct > battery.max_soc_pct {
        return Err(ValidationError::new("min_soc_pct must be <= max_soc_pct"));
    }
    if battery.reserve_soc_pct > battery.max_soc_pct {
        return Err(ValidationError::new("reserve_soc_pct must be <= max_soc_pct"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CurtailmentMode {
    LoadAware,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct InverterConfig {
    #[validate(custom(function = "validate_id"))]
    pub id: String,
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(range(min = 0.0))]
    pub peak_power_kw: f64,
    #[serde(default)]
    pub curtailment: Option<CurtailmentMode>,
    #[validate(nested)]
    pub pv: PvSettings,
    #[serde(default)]
    #[validate(nested)]
    pub battery: Option<BatterySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_unique_inverter_ids"))]
pub struct PlantConfig {
    #[validate(nested)]
    pub grid: GridConfig,
    #[validate(nested)]
    pub load: BaseLoadConfig,
    #[validate(nested)]
    pub inverters: Vec<InverterConfig>,
}

fn validate_unique_inverter_ids(plant: &PlantConfig) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for inverter in &plant.inverters {
        if !seen.insert(inverter.id.as_str()) {
            return Err(ValidationError::new("inverter ids must be unique"));
        }
    }
    Ok(())
}
