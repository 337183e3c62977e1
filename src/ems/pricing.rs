use crate::domain::plant::GridPriceRiskSettings;
use crate::ems::horizon::Horizon;
use crate::error::{EmsError, EmsResult};

/// Effective (biased) price series aligned to the horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub import_effective: Vec<f64>,
    pub export_effective: Vec<f64>,
}

/// Applies floor/ceiling clamps, the time-ramped risk bias and the grid
/// bias to raw per-slot prices.
///
/// Slot 0 always uses the raw (realtime) price unmodified by the clamps,
/// which exist to guard against optimistic future windows.
#[derive(Debug, Clone)]
pub struct PriceSeriesBuilder {
    grid_bias_pct: f64,
    risk: Option<GridPriceRiskSettings>,
}

impl PriceSeriesBuilder {
    pub fn new(grid_price_bias_pct: f64, grid_price_risk: Option<GridPriceRiskSettings>) -> Self {
        Self { grid_bias_pct: grid_price_bias_pct, risk: grid_price_risk }
    }

    pub fn build_series(
        &self,
        horizon: &Horizon,
        price_import: &[f64],
        price_export: &[f64],
    ) -> EmsResult<PriceSeries> {
        if price_import.len() != horizon.len() {
            return Err(EmsError::Config(
                "price_import length does not match horizon".to_string(),
            ));
        }
        if price_export.len() != horizon.len() {
            return Err(EmsError::Config(
                "price_export length does not match horizon".to_string(),
            ));
        }

        let mut import_effective = Vec::with_capacity(horizon.len());
        let mut export_effective = Vec::with_capacity(horizon.len());

        for (t, slot) in horizon.slots.iter().enumerate() {
            let mut raw_import = price_import[t];
            let mut raw_export = price_export[t];

            if t > 0 {
                if let Some(risk) = &self.risk {
                    if let Some(floor) = risk.import_price_floor {
                        raw_import = raw_import.max(floor);
                    }
                    if let Some(ceiling) = risk.export_price_ceiling {
                        raw_export = raw_export.min(ceiling);
                    }
                }
            }

            let minutes_from_now =
                ((slot.midpoint() - horizon.now).num_seconds() as f64 / 60.0).max(0.0);
            let risk_factor = self.risk_factor(minutes_from_now);
            let risk_bias_pct =
                self.risk.as_ref().map(|risk| risk.bias_pct * risk_factor).unwrap_or(0.0);

            let risk_import = apply_import_bias(raw_import, risk_bias_pct);
            let risk_export = apply_export_bias(raw_export, risk_bias_pct);

            import_effective.push(apply_import_bias(risk_import, self.grid_bias_pct));
            export_effective.push(apply_export_bias(risk_export, self.grid_bias_pct));
        }

        Ok(PriceSeries { import_effective, export_effective })
    }

    fn risk_factor(&self, minutes_from_now: f64) -> f64 {
        let Some(risk) = &self.risk else {
            return 0.0;
        };
        if risk.bias_pct <= 0.0 {
            return 0.0;
        }
        let start = f64::from(risk.ramp_start_after_minutes);
        let duration = f64::from(risk.ramp_duration_minutes);
        if duration <= 0.0 {
            return if minutes_from_now >= start { 1.0 } else { 0.0 };
        }
        if minutes_from_now <= start {
            return 0.0;
        }
        let full_at = start + duration;
        if minutes_from_now >= full_at {
            return 1.0;
        }
        (minutes_from_now - start) / duration
    }
}

/// Sign-aware import premium: positive prices rise, negative prices shrink
/// toward zero. Never changes the sign of the price.
fn apply_import_bias(price: f64, bias_pct: f64) -> f64 {
    if bias_pct == 0.0 {
        return price;
    }
    let bias = bias_pct / 100.0;
    if price >= 0.0 {
        price * (1.0 + bias)
    } else {
        price * (1.0 - bias)
    }
}

/// Sign-aware export discount: positive prices shrink, negative prices grow
/// in magnitude so paid exports are avoided harder.
fn apply_export_bias(price: f64, bias_pct: f64) -> f64 {
    if bias_pct == 0.0 {
        return price;
    }
    let bias = bias_pct / 100.0;
    if price >= 0.0 {
        price * (1.0 - bias)
    } else {
        price * (1.0 + bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ems::horizon::{build_horizon, HorizonSpec};
    use chrono::{DateTime, FixedOffset, TimeZone};
    use proptest::prelude::*;

    fn now_at_midnight() -> DateTime<FixedOffset> {
        chrono::Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .unwrap()
            .fixed_offset()
    }

    fn horizon(timestep_minutes: u32, num_intervals: u32) -> crate::ems::horizon::Horizon {
        build_horizon(
            now_at_midnight(),
            &HorizonSpec {
                timestep_minutes,
                high_res_timestep_minutes: None,
                high_res_horizon_minutes: None,
                total_minutes: timestep_minutes * num_intervals,
            },
        )
        .unwrap()
    }

    fn risk(
        bias_pct: f64,
        ramp_start: u32,
        ramp_duration: u32,
        floor: Option<f64>,
        ceiling: Option<f64>,
    ) -> GridPriceRiskSettings {
        GridPriceRiskSettings {
            bias_pct,
            ramp_start_after_minutes: ramp_start,
            ramp_duration_minutes: ramp_duration,
            import_price_floor: floor,
            export_price_ceiling: ceiling,
        }
    }

    fn approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn risk_ramp_interpolates_between_start_and_end() {
        let horizon = horizon(30, 5);
        let builder = PriceSeriesBuilder::new(0.0, Some(risk(100.0, 30, 90, None, None)));
        let series = builder
            .build_series(&horizon, &[1.0; 5], &[1.0; 5])
            .unwrap();

        approx(series.import_effective[0], 1.0);
        approx(series.import_effective[1], 1.1666667);
        approx(series.import_effective[2], 1.5);
        approx(series.import_effective[3], 1.8333333);
        approx(series.import_effective[4], 2.0);
    }

    #[test]
    fn floor_and_ceiling_apply_before_bias() {
        let horizon = horizon(60, 2);
        let builder =
            PriceSeriesBuilder::new(0.0, Some(risk(50.0, 0, 0, Some(0.3), Some(0.6))));
        let series = builder.build_series(&horizon, &[0.1, 0.1], &[1.0, 1.0]).unwrap();

        approx(series.import_effective[1], 0.45);
        approx(series.export_effective[1], 0.3);
    }

    #[test]
    fn floor_and_ceiling_apply_without_bias() {
        let horizon = horizon(60, 2);
        let builder =
            PriceSeriesBuilder::new(0.0, Some(risk(0.0, 0, 0, Some(0.2), Some(0.5))));
        let series = builder.build_series(&horizon, &[0.1, 0.1], &[0.8, 0.8]).unwrap();

        approx(series.import_effective[1], 0.2);
        approx(series.export_effective[1], 0.5);
    }

    #[test]
    fn clamps_are_skipped_for_slot_zero() {
        let horizon = horizon(60, 2);
        let builder =
            PriceSeriesBuilder::new(0.0, Some(risk(50.0, 0, 0, Some(0.3), Some(0.6))));
        let series = builder.build_series(&horizon, &[0.1, 0.1], &[1.0, 1.0]).unwrap();

        approx(series.import_effective[0], 0.15);
        approx(series.export_effective[0], 0.5);
    }

    #[test]
    fn negative_prices_bias_sign_aware() {
        let horizon = horizon(60, 1);
        let builder = PriceSeriesBuilder::new(0.0, Some(risk(50.0, 0, 0, None, None)));
        let series = builder.build_series(&horizon, &[-1.0], &[-1.0]).unwrap();

        approx(series.import_effective[0], -0.5);
        approx(series.export_effective[0], -1.5);
    }

    #[test]
    fn risk_and_grid_bias_compose() {
        let horizon = horizon(60, 1);
        let builder = PriceSeriesBuilder::new(50.0, Some(risk(50.0, 0, 0, None, None)));
        let series = builder.build_series(&horizon, &[1.0], &[1.0]).unwrap();

        approx(series.import_effective[0], 2.25);
        approx(series.export_effective[0], 0.25);
    }

    #[test]
    fn export_spike_is_clamped_then_discounted() {
        // clamp: min(19.95, 10.0); risk: *0.75; grid: *0.75 => 5.625
        let horizon = horizon(30, 21);
        let builder =
            PriceSeriesBuilder::new(25.0, Some(risk(25.0, 30, 120, None, Some(10.0))));
        let series = builder
            .build_series(&horizon, &[0.0; 21], &[19.95; 21])
            .unwrap();

        approx(series.export_effective[20], 5.625);
    }

    #[test]
    fn series_length_mismatch_is_rejected() {
        let horizon = horizon(60, 2);
        let builder = PriceSeriesBuilder::new(0.0, None);
        assert!(builder.build_series(&horizon, &[1.0], &[1.0, 1.0]).is_err());
        assert!(builder.build_series(&horizon, &[1.0, 1.0], &[1.0]).is_err());
    }

    proptest! {
        #[test]
        fn bias_preserves_sign(
            price in -100.0f64..100.0,
            bias in 0.0f64..100.0,
        ) {
            let import = apply_import_bias(price, bias);
            let export = apply_export_bias(price, bias);
            prop_assert!(import.signum() == price.signum() || import == 0.0);
            prop_assert!(export.signum() == price.signum() || export == 0.0);
        }
    }
}
