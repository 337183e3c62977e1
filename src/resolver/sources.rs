use chrono::{DateTime, Duration, FixedOffset, Timelike};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::domain::forecast::{PowerForecastInterval, PriceForecastInterval};
use crate::error::{EmsError, EmsResult};
use crate::resolver::provider::EntityState;
use crate::resolver::ValueResolver;

fn required_float(entity_id: &str, state: &str) -> EmsResult<f64> {
    state.trim().parse::<f64>().map_err(|_| {
        EmsError::Resolve(format!("non-numeric state '{state}' for entity {entity_id}"))
    })
}

fn normalize_power_kw(value: f64, unit: Option<&str>) -> f64 {
    match unit.map(|u| u.trim().to_ascii_lowercase()).as_deref() {
        Some("w") => value / 1000.0,
        Some("mw") => value * 1000.0,
        _ => value,
    }
}

fn unit_attribute(state: &EntityState) -> Option<&str> {
    state.attributes.get("unit_of_measurement").and_then(|v| v.as_str())
}

fn parse_timestamp(value: Option<&serde_json::Value>) -> Option<DateTime<FixedOffset>> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text).ok()
}

/// Realtime power reading normalized to kW using the entity's unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerSource {
    pub entity: String,
}

impl PowerSource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        resolver.mark_entity(&self.entity);
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<f64> {
        let state = resolver.state(&self.entity)?;
        let raw = required_float(&self.entity, &state.state)?;
        Ok(normalize_power_kw(raw, unit_attribute(state)))
    }
}

/// Percentage reading (0-100).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PercentageSource {
    pub entity: String,
}

impl PercentageSource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        resolver.mark_entity(&self.entity);
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<f64> {
        let state = resolver.state(&self.entity)?;
        required_float(&self.entity, &state.state)
    }
}

/// Currency-per-kWh reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurrencySource {
    pub entity: String,
}

impl CurrencySource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        resolver.mark_entity(&self.entity);
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<f64> {
        let state = resolver.state(&self.entity)?;
        required_float(&self.entity, &state.state)
    }
}

/// Boolean reading with textual-state recognition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinarySource {
    pub entity: String,
}

impl BinarySource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        resolver.mark_entity(&self.entity);
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<bool> {
        let state = resolver.state(&self.entity)?;
        match state.state.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Ok(true),
            "off" | "false" | "0" | "no" => Ok(false),
            other => Err(EmsError::Resolve(format!(
                "unrecognized boolean state '{other}' for entity {}",
                self.entity
            ))),
        }
    }
}

/// Price value selection for Amber-style forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceForecastMode {
    Spot,
    Advanced,
    BlendMin,
    BlendMax,
    BlendMean,
}

/// Amber-style price forecast: reads the `forecasts` attribute, selecting
/// the per-kWh value per mode, with an optional synthetic tail extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_extension_pairing"))]
pub struct PriceForecastSource {
    pub entity: String,
    #[serde(default)]
    pub mode: Option<PriceForecastMode>,
    #[serde(default)]
    #[validate(range(min = 1, max = 168))]
    pub extension_hours: Option<u32>,
    #[serde(default)]
    pub extension_median: Option<f64>,
}

fn validate_extension_pairing(source: &PriceForecastSource) -> Result<(), ValidationError> {
    match (source.extension_hours, source.extension_median) {
        (None, None) | (Some(_), Some(_)) => Ok(()),
        _ => Err(ValidationError::new(
            "extension_hours and extension_median must be set together",
        )),
    }
}

impl PriceForecastSource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        resolver.mark_entity(&self.entity);
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<Vec<PriceForecastInterval>> {
        let state = resolver.state(&self.entity)?;
        let forecasts = state
            .attributes
            .get("forecasts")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                EmsError::Resolve(format!("missing forecasts attribute on entity {}", self.entity))
            })?;

        let mut intervals = Vec::with_capacity(forecasts.len());
        for item in forecasts {
            let Some(item) = item.as_object() else { continue };
            let start = parse_timestamp(item.get("start_time").or_else(|| item.get("nem_date")));
            let Some(start) = start else { continue };
            let end = parse_timestamp(item.get("end_time")).or_else(|| {
                item.get("duration")
                    .and_then(|v| v.as_f64())
                    .map(|minutes| start + Duration::milliseconds((minutes * 60_000.0) as i64))
            });
            let Some(end) = end else { continue };
            let Some(value) = self.price_value(item)? else { continue };
            intervals.push(PriceForecastInterval { start, end, value });
        }

        Ok(extend_price_forecast(intervals, self.extension_hours, self.extension_median))
    }

    fn price_value(&self, item: &serde_json::Map<String, serde_json::Value>) -> EmsResult<Option<f64>> {
        let spot = item.get("per_kwh").and_then(|v| v.as_f64());
        let advanced = item.get("advanced_price_predicted").and_then(|v| v.as_f64());
        let value = match self.mode {
            None => spot,
            Some(PriceForecastMode::Spot) => Some(spot.ok_or_else(|| {
                EmsError::Resolve(format!(
                    "spot price is required for entity {} in spot mode",
                    self.entity
                ))
            })?),
            Some(PriceForecastMode::Advanced) => advanced.or(spot),
            Some(blend) => match (spot, advanced) {
                (None, other) => other,
                (other, None) => other,
                (Some(spot), Some(advanced)) => Some(match blend {
                    PriceForecastMode::BlendMin => spot.min(advanced),
                    PriceForecastMode::BlendMax => spot.max(advanced),
                    _ => (spot + advanced) / 2.0,
                }),
            },
        };
        Ok(value)
    }
}

// Diurnal multiplier curve used to synthesize prices past the provider's
// forecast, one entry per hour of day, normalized by its median.
const PRICE_EXTENSION_CURVE: [f64; 24] = [
    0.7, 0.65, 0.6, 0.6, 0.65, 0.8, 1.0, 1.2, 1.3, 1.1, 1.0, 0.95, 0.9, 0.85, 0.9, 1.1, 1.3,
    1.55, 1.45, 1.25, 1.05, 0.95, 0.85, 0.75,
];

static PRICE_EXTENSION_CURVE_MEDIAN: Lazy<f64> = Lazy::new(|| {
    let mut sorted = PRICE_EXTENSION_CURVE;
    sorted.sort_by(|a, b| a.total_cmp(b));
    (sorted[11] + sorted[12]) / 2.0
});

fn extension_multiplier(at: DateTime<FixedOffset>) -> f64 {
    PRICE_EXTENSION_CURVE[at.hour() as usize % 24] / *PRICE_EXTENSION_CURVE_MEDIAN
}

fn extend_price_forecast(
    intervals: Vec<PriceForecastInterval>,
    extension_hours: Option<u32>,
    extension_median: Option<f64>,
) -> Vec<PriceForecastInterval> {
    let (Some(hours), Some(median)) = (extension_hours, extension_median) else {
        return intervals;
    };
    let Some(last) = intervals.iter().max_by_key(|interval| interval.end) else {
        return intervals;
    };

    let last_end = last.end;
    let extension_end = last_end + Duration::hours(i64::from(hours));
    let step_minutes = {
        let minutes = (last.end - last.start).num_minutes();
        if minutes > 0 {
            minutes
        } else {
            30
        }
    };

    let mut extended = intervals.clone();
    let mut cursor = last_end;
    while cursor < extension_end {
        let slot_end = (cursor + Duration::minutes(step_minutes)).min(extension_end);
        extended.push(PriceForecastInterval {
            start: cursor,
            end: slot_end,
            value: median * extension_multiplier(cursor),
        });
        cursor = slot_end;
    }
    extended
}

/// Solcast-style PV forecast: concatenates each entity's `detailedForecast`
/// treating every 30-minute bucket's `pv_estimate` as kW.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PvForecastSource {
    #[validate(length(min = 1))]
    pub entities: Vec<String>,
}

impl PvForecastSource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        for entity in &self.entities {
            resolver.mark_entity(entity);
        }
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<Vec<PowerForecastInterval>> {
        let mut intervals = Vec::new();
        for entity in &self.entities {
            let state = resolver.state(entity)?;
            let detailed = state
                .attributes
                .get("detailedForecast")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    EmsError::Resolve(format!("missing detailedForecast attribute on entity {entity}"))
                })?;
            for item in detailed {
                let start = parse_timestamp(item.get("period_start")).ok_or_else(|| {
                    EmsError::Resolve(format!("bad period_start in forecast for entity {entity}"))
                })?;
                let value = item.get("pv_estimate").and_then(|v| v.as_f64()).ok_or_else(|| {
                    EmsError::Resolve(format!("missing pv_estimate in forecast for entity {entity}"))
                })?;
                intervals.push(PowerForecastInterval {
                    start,
                    end: start + Duration::minutes(30),
                    value,
                });
            }
        }
        Ok(intervals)
    }
}

/// Load forecast from historical state: bins the last `history_days` into
/// time-of-day buckets of `interval_duration` minutes, repeats the daily
/// profile over `forecast_horizon_hours`, and optionally smooths the head
/// toward the current realtime reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_historical_source"))]
pub struct HistoricalLoadForecastSource {
    pub entity: String,
    #[validate(range(min = 1))]
    pub history_days: u32,
    /// Unit of the historical states: one of W, kW, MW.
    pub unit: String,
    #[serde(default = "default_interval_duration")]
    #[validate(range(min = 1, max = 60))]
    pub interval_duration: u32,
    #[serde(default = "default_forecast_horizon_hours")]
    #[validate(range(min = 1))]
    pub forecast_horizon_hours: u32,
    #[serde(default)]
    pub realtime_window_minutes: Option<u32>,
}

fn default_interval_duration() -> u32 {
    5
}

fn default_forecast_horizon_hours() -> u32 {
    24
}

fn validate_historical_source(source: &HistoricalLoadForecastSource) -> Result<(), ValidationError> {
    if 60 % source.interval_duration != 0 {
        return Err(ValidationError::new("interval_duration must evenly divide 60 minutes"));
    }
    if !matches!(source.unit.trim().to_ascii_lowercase().as_str(), "w" | "kw" | "mw") {
        return Err(ValidationError::new("unit must be one of: W, kW, MW"));
    }
    if source.realtime_window_minutes == Some(0) {
        return Err(ValidationError::new("realtime_window_minutes must be positive"));
    }
    Ok(())
}

impl HistoricalLoadForecastSource {
    pub fn mark(&self, resolver: &mut ValueResolver) {
        resolver.mark_history(&self.entity, self.history_days);
    }

    pub fn resolve(&self, resolver: &ValueResolver) -> EmsResult<Vec<PowerForecastInterval>> {
        let history = resolver.history(&self.entity)?;
        let mut entries: Vec<(DateTime<FixedOffset>, f64)> = history
            .iter()
            .filter_map(|point| {
                let value = point.state.trim().parse::<f64>().ok()?;
                Some((point.last_updated, normalize_power_kw(value, Some(&self.unit))))
            })
            .collect();

        if entries.is_empty() {
            return Ok(Vec::new());
        }
        entries.sort_by_key(|(timestamp, _)| *timestamp);

        let interval = Duration::minutes(i64::from(self.interval_duration));
        let mut now = resolver.now();
        let last_sample = entries.last().expect("non-empty").0;
        if now <= last_sample {
            now = last_sample + interval;
        }

        let interval_minutes = self.interval_duration;
        let buckets_per_day = (24 * 60 / interval_minutes) as usize;
        let mut bucket_sums = vec![0.0f64; buckets_per_day];
        let mut bucket_seconds = vec![0.0f64; buckets_per_day];

        // Each sample holds until the next one; split that span across the
        // time-of-day buckets it crosses.
        for (idx, (start, value)) in entries.iter().enumerate() {
            let end = entries.get(idx + 1).map(|(ts, _)| *ts).unwrap_or(now);
            if end <= *start {
                continue;
            }
            let mut current = *start;
            while current < end {
                let floored_minute = (current.minute() / interval_minutes) * interval_minutes;
                let interval_start = current
                    .with_minute(floored_minute)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(current);
                let interval_end = interval_start + interval;
                let overlap_end = interval_end.min(end);
                let seconds = (overlap_end - current).num_milliseconds() as f64 / 1000.0;
                let bucket = ((interval_start.hour() * 60 + interval_start.minute())
                    / interval_minutes) as usize;
                bucket_sums[bucket] += value * seconds;
                bucket_seconds[bucket] += seconds;
                current = overlap_end;
            }
        }

        let averages: Vec<f64> = (0..buckets_per_day)
            .map(|i| if bucket_seconds[i] > 0.0 { bucket_sums[i] / bucket_seconds[i] } else { 0.0 })
            .collect();

        let start_time = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let num_intervals = (self.forecast_horizon_hours * 60 / interval_minutes) as usize;
        let mut intervals = Vec::with_capacity(num_intervals);
        for offset in 0..num_intervals {
            let interval_start = start_time + interval * offset as i32;
            let bucket = ((interval_start.hour() * 60 + interval_start.minute())
                / interval_minutes) as usize;
            intervals.push(PowerForecastInterval {
                start: interval_start,
                end: interval_start + interval,
                value: averages[bucket],
            });
        }

        self.apply_realtime_smoothing(&mut intervals, now, resolver)?;
        Ok(intervals)
    }

    /// Blend the current realtime reading into the head of the profile,
    /// linearly over the configured window. Only raises values.
    fn apply_realtime_smoothing(
        &self,
        intervals: &mut [PowerForecastInterval],
        now: DateTime<FixedOffset>,
        resolver: &ValueResolver,
    ) -> EmsResult<()> {
        let Some(window_minutes) = self.realtime_window_minutes else {
            return Ok(());
        };
        if intervals.is_empty() {
            return Ok(());
        }
        let state = resolver.state(&self.entity)?;
        let Ok(raw) = state.state.trim().parse::<f64>() else {
            return Ok(());
        };
        let unit = unit_attribute(state).unwrap_or(&self.unit);
        let realtime_kw = normalize_power_kw(raw, Some(unit));

        let window = Duration::minutes(i64::from(window_minutes));
        let window_end = now + window;
        let window_seconds = window.num_seconds() as f64;
        for interval in intervals.iter_mut() {
            if interval.end <= now {
                continue;
            }
            if interval.start >= window_end {
                break;
            }
            let progress = ((interval.start - now).num_seconds() as f64 / window_seconds)
                .clamp(0.0, 1.0);
            let interpolated = realtime_kw + (interval.value - realtime_kw) * progress;
            if interpolated > interval.value {
                interval.value = interpolated;
            }
        }
        Ok(())
    }
}
