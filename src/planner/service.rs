use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tracing::{info, warn};

use crate::clock;
use crate::config::AppConfig;
use crate::domain::forecast::{PowerForecastInterval, PriceForecastInterval};
use crate::domain::loads::LoadConfig;
use crate::domain::plan::{EmsPlanOutput, EmsPlanTimings};
use crate::ems::alignment::{align_intervals, coverage_slots};
use crate::ems::horizon::{build_horizon, Horizon, HorizonSpec};
use crate::ems::pricing::PriceSeriesBuilder;
use crate::error::{EmsError, EmsResult};
use crate::optimizer::{extract_plan, not_solved_plan, MilpCompiler, ResolvedEvState, ResolvedSeries};
use crate::planner::PlanService;
use crate::resolver::provider::StateProvider;
use crate::resolver::{mark_config_sources, ValueResolver};

/// Production plan service: hydrates the resolver from the provider, sizes
/// the horizon from forecast coverage, compiles and solves.
pub struct EmsPlanService {
    config: Arc<AppConfig>,
    provider: Arc<dyn StateProvider>,
}

impl EmsPlanService {
    pub fn new(config: Arc<AppConfig>, provider: Arc<dyn StateProvider>) -> Self {
        Self { config, provider }
    }
}

#[async_trait]
impl PlanService for EmsPlanService {
    async fn generate(&self) -> (EmsPlanOutput, Option<String>) {
        let total_start = Instant::now();
        let now = clock::now();

        let mut resolver = ValueResolver::new(Arc::clone(&self.provider), now);
        mark_config_sources(&self.config, &mut resolver);
        if let Err(err) = resolver.hydrate().await {
            let err = err.into_resolve();
            warn!(error = %err, "hydration failed");
            return (
                not_solved_plan(now, elapsed_timings(total_start)),
                Some(err.to_string()),
            );
        }

        let config = Arc::clone(&self.config);
        let solved = tokio::task::spawn_blocking(move || plan_once(&config, &resolver, now)).await;

        match solved {
            Ok(Ok(mut plan)) => {
                plan.timings.total_seconds = total_start.elapsed().as_secs_f64();
                (plan, None)
            }
            Ok(Err(err)) => {
                let err = err.into_resolve();
                warn!(error = %err, "plan generation failed");
                (not_solved_plan(now, elapsed_timings(total_start)), Some(err.to_string()))
            }
            Err(join_err) => {
                warn!(error = %join_err, "plan task failed");
                (
                    not_solved_plan(now, elapsed_timings(total_start)),
                    Some(join_err.to_string()),
                )
            }
        }
    }
}

fn elapsed_timings(total_start: Instant) -> EmsPlanTimings {
    EmsPlanTimings {
        build_seconds: 0.0,
        solve_seconds: 0.0,
        total_seconds: total_start.elapsed().as_secs_f64(),
    }
}

/// Resolve, align, compile, solve and extract one plan. Synchronous so it
/// can run under `spawn_blocking` (CBC blocks) and inside the fixture
/// harness.
pub fn plan_once(
    config: &AppConfig,
    resolver: &ValueResolver,
    now: DateTime<FixedOffset>,
) -> EmsResult<EmsPlanOutput> {
    let ems = &config.ems;
    let plant = &config.plant;
    let base_interval = ems.base_interval_minutes();

    // Resolve forecast intervals up front; their joint coverage sizes the
    // horizon.
    let price_import_intervals = plant.grid.price_import_forecast.resolve(resolver)?;
    let price_export_intervals = plant.grid.price_export_forecast.resolve(resolver)?;
    let load_intervals = plant.load.forecast.resolve(resolver)?;
    let mut pv_intervals: Vec<(&str, Vec<PowerForecastInterval>, bool)> = Vec::new();
    for inverter in &plant.inverters {
        let intervals = inverter.pv.forecast.resolve(resolver)?;
        pv_intervals.push((&inverter.id, intervals, inverter.pv.realtime_power.is_some()));
    }

    let coverage_start = coverage_reference(now, ems.high_res_timestep_minutes.is_some(), base_interval);
    let price_coverage = |intervals: &[PriceForecastInterval]| {
        coverage_slots(coverage_start, base_interval, intervals, true)
    };
    let mut min_coverage = price_coverage(&price_import_intervals)
        .min(price_coverage(&price_export_intervals))
        .min(coverage_slots(coverage_start, base_interval, &load_intervals, true));
    for (_, intervals, has_realtime) in &pv_intervals {
        min_coverage =
            min_coverage.min(coverage_slots(coverage_start, base_interval, intervals, *has_realtime));
    }

    let min_intervals = ems.min_horizon_minutes.div_ceil(base_interval) as usize;
    if min_coverage < min_intervals {
        return Err(EmsError::Horizon(format!(
            "shortest forecast covers {} intervals ({} minutes), below min_horizon_minutes={}",
            min_coverage,
            min_coverage * base_interval as usize,
            ems.min_horizon_minutes
        )));
    }

    let total_minutes = (min_coverage as u32) * base_interval;
    let horizon = build_horizon(
        now,
        &HorizonSpec {
            timestep_minutes: ems.timestep_minutes,
            high_res_timestep_minutes: ems.high_res_timestep_minutes,
            high_res_horizon_minutes: ems.high_res_horizon_minutes,
            total_minutes,
        },
    )?;
    info!(
        slots = horizon.len(),
        total_minutes,
        start = %horizon.start,
        "planning horizon built"
    );

    let series = resolve_series(config, resolver, &horizon, pv_intervals, price_import_intervals, price_export_intervals, load_intervals)?;

    let build_start = Instant::now();
    let compiled = MilpCompiler::new(plant, &config.loads, &ems.terminal_soc, &horizon, &series)
        .compile()?;
    let build_seconds = build_start.elapsed().as_secs_f64();

    let solve_start = Instant::now();
    let outcome = compiled.builder.solve();
    let solve_seconds = solve_start.elapsed().as_secs_f64();
    info!(status = %outcome.status, build_seconds, solve_seconds, "solve finished");

    let timings = EmsPlanTimings {
        build_seconds,
        solve_seconds,
        total_seconds: build_seconds + solve_seconds,
    };
    Ok(extract_plan(&compiled.model, &outcome, &horizon, &series, now, timings))
}

/// Coverage is counted from where the horizon will start: `now` in
/// two-resolution mode, the floored coarse boundary otherwise.
fn coverage_reference(
    now: DateTime<FixedOffset>,
    high_res: bool,
    base_interval: u32,
) -> DateTime<FixedOffset> {
    if high_res {
        return now;
    }
    let spec = HorizonSpec {
        timestep_minutes: base_interval,
        high_res_timestep_minutes: None,
        high_res_horizon_minutes: None,
        total_minutes: base_interval,
    };
    build_horizon(now, &spec).map(|h| h.start).unwrap_or(now)
}

#[allow(clippy::too_many_arguments)]
fn resolve_series(
    config: &AppConfig,
    resolver: &ValueResolver,
    horizon: &Horizon,
    pv_intervals: Vec<(&str, Vec<PowerForecastInterval>, bool)>,
    price_import_intervals: Vec<PriceForecastInterval>,
    price_export_intervals: Vec<PriceForecastInterval>,
    load_intervals: Vec<PowerForecastInterval>,
) -> EmsResult<ResolvedSeries> {
    let plant = &config.plant;

    let realtime_price_import = plant.grid.realtime_price_import.resolve(resolver)?;
    let realtime_price_export = plant.grid.realtime_price_export.resolve(resolver)?;
    let realtime_load = plant.load.realtime_power.resolve(resolver)?;

    let price_import_raw =
        align_intervals(horizon, &price_import_intervals, Some(realtime_price_import))?;
    let price_export_raw =
        align_intervals(horizon, &price_export_intervals, Some(realtime_price_export))?;
    let load_kw = align_intervals(horizon, &load_intervals, Some(realtime_load))?;

    let pricing = PriceSeriesBuilder::new(
        plant.grid.price_bias_pct,
        plant.grid.price_risk.clone(),
    );
    let effective = pricing.build_series(horizon, &price_import_raw, &price_export_raw)?;

    let mut series = ResolvedSeries {
        load_kw,
        price_import_raw,
        price_export_raw,
        price_import_eff: effective.import_effective,
        price_export_eff: effective.export_effective,
        ..ResolvedSeries::default()
    };

    for (inverter, (inverter_id, intervals, _)) in plant.inverters.iter().zip(pv_intervals) {
        debug_assert_eq!(inverter.id, inverter_id);
        let realtime = match &inverter.pv.realtime_power {
            Some(source) => Some(source.resolve(resolver)?),
            None => None,
        };
        let pv_kw = align_intervals(horizon, &intervals, realtime)?;
        series.pv_available_kw.insert(inverter.id.clone(), pv_kw);

        if let Some(battery) = &inverter.battery {
            let soc_pct = battery.state_of_charge.resolve(resolver)?;
            series.battery_initial_soc_pct.insert(inverter.id.clone(), soc_pct);
        }
    }

    for load in &config.loads {
        let LoadConfig::ControlledEv(ev) = load;
        let connected = ev.connected.resolve(resolver)?;
        let can_connect = match &ev.can_connect {
            Some(source) => source.resolve(resolver)?,
            None => true,
        };
        series.evs.insert(
            ev.id.clone(),
            ResolvedEvState {
                connected,
                can_connect,
                realtime_power_kw: ev.realtime_power.resolve(resolver)?,
                initial_soc_pct: ev.state_of_charge.resolve(resolver)?,
            },
        );
    }

    Ok(series)
}
