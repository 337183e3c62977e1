use std::collections::BTreeMap;

use chrono::Duration;
use good_lp::{constraint, variable, Expression, Variable};
use tracing::debug;

use crate::config::{PenaltyStatistic, TerminalSocMode, TerminalSocPenalty, TerminalSocSettings};
use crate::domain::loads::{ControlledEvLoad, LoadConfig};
use crate::domain::plant::{CurtailmentMode, InverterConfig, PlantConfig};
use crate::ems::horizon::Horizon;
use crate::ems::time_windows::TimeWindowMatcher;
use crate::error::{EmsError, EmsResult};
use crate::optimizer::model::ModelBuilder;

const VIOLATION_PENALTY_PER_KWH: f64 = 1e3;
const EARLY_FLOW_BONUS: f64 = 1e-4;
const ZERO_EXPORT_TIE_BREAK: f64 = 1e-4;
const CURTAIL_ORDER_TIE_BREAK: f64 = 1e-6;
const EV_RAMP_PENALTY: f64 = 1e-4;
const EV_ANCHOR_PENALTY: f64 = 5e-2;

/// Per-EV values resolved ahead of the compile.
#[derive(Debug, Clone)]
pub struct ResolvedEvState {
    pub connected: bool,
    pub can_connect: bool,
    pub realtime_power_kw: f64,
    pub initial_soc_pct: f64,
}

/// Everything the compiler needs besides typed configuration: series
/// aligned to the horizon and resolved scalars.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSeries {
    pub load_kw: Vec<f64>,
    pub price_import_raw: Vec<f64>,
    pub price_export_raw: Vec<f64>,
    pub price_import_eff: Vec<f64>,
    pub price_export_eff: Vec<f64>,
    /// Available PV per inverter id.
    pub pv_available_kw: BTreeMap<String, Vec<f64>>,
    /// Initial battery SoC percent per inverter id.
    pub battery_initial_soc_pct: BTreeMap<String, f64>,
    pub evs: BTreeMap<String, ResolvedEvState>,
}

pub struct GridVars {
    pub import_kw: Vec<Variable>,
    pub export_kw: Vec<Variable>,
    pub import_violation_kw: Vec<Variable>,
    pub import_allowed: Vec<bool>,
}

pub struct BatteryVars {
    pub charge_kw: Vec<Variable>,
    pub discharge_kw: Vec<Variable>,
    /// SoC at slot boundaries: N+1 points for N slots.
    pub soc_kwh: Vec<Variable>,
    pub capacity_kwh: f64,
}

pub struct InverterVars {
    pub name: String,
    pub pv_kw: Vec<Variable>,
    pub ac_net_kw: Vec<Variable>,
    pub curtail: Option<Vec<Variable>>,
    pub pv_available_kw: Vec<f64>,
    pub battery: Option<BatteryVars>,
}

pub struct EvVars {
    pub name: String,
    pub charge_kw: Vec<Variable>,
    /// SoC at slot boundaries: N+1 points for N slots.
    pub soc_kwh: Vec<Variable>,
    pub capacity_kwh: f64,
    pub connected: bool,
}

/// Typed variable handles produced by one compile, read by the extractor.
pub struct CompiledModel {
    pub grid: GridVars,
    pub inverters: BTreeMap<String, InverterVars>,
    pub evs: BTreeMap<String, EvVars>,
}

/// A compiled problem ready to hand to the solver.
pub struct CompiledPlan {
    pub model: CompiledModel,
    pub builder: ModelBuilder,
}

pub struct MilpCompiler<'a> {
    plant: &'a PlantConfig,
    loads: &'a [LoadConfig],
    terminal_soc: &'a TerminalSocSettings,
    horizon: &'a Horizon,
    series: &'a ResolvedSeries,
}

impl<'a> MilpCompiler<'a> {
    pub fn new(
        plant: &'a PlantConfig,
        loads: &'a [LoadConfig],
        terminal_soc: &'a TerminalSocSettings,
        horizon: &'a Horizon,
        series: &'a ResolvedSeries,
    ) -> Self {
        Self { plant, loads, terminal_soc, horizon, series }
    }

    pub fn compile(&self) -> EmsResult<CompiledPlan> {
        let n = self.horizon.len();
        if n == 0 {
            return Err(EmsError::Config("horizon has no slots".to_string()));
        }
        self.check_series_lengths(n)?;

        let mut builder = ModelBuilder::new();
        let grid = self.build_grid(&mut builder);
        let inverters = self.build_inverters(&mut builder, &grid)?;
        let evs = self.build_evs(&mut builder)?;
        self.build_ac_balance(&mut builder, &grid, &inverters, &evs);
        self.build_objective(&mut builder, &grid, &inverters);

        debug!(slots = n, inverters = inverters.len(), evs = evs.len(), "model compiled");
        Ok(CompiledPlan { model: CompiledModel { grid, inverters, evs }, builder })
    }

    fn check_series_lengths(&self, n: usize) -> EmsResult<()> {
        let lengths = [
            ("load_kw", self.series.load_kw.len()),
            ("price_import_raw", self.series.price_import_raw.len()),
            ("price_export_raw", self.series.price_export_raw.len()),
            ("price_import_eff", self.series.price_import_eff.len()),
            ("price_export_eff", self.series.price_export_eff.len()),
        ];
        for (name, len) in lengths {
            if len != n {
                return Err(EmsError::Config(format!(
                    "{name} series length {len} does not match horizon ({n} slots)"
                )));
            }
        }
        for inverter in &self.plant.inverters {
            let len = self
                .series
                .pv_available_kw
                .get(&inverter.id)
                .map(Vec::len)
                .ok_or_else(|| {
                    EmsError::Config(format!("missing pv series for inverter {}", inverter.id))
                })?;
            if len != n {
                return Err(EmsError::Config(format!(
                    "pv series length {len} for inverter {} does not match horizon ({n} slots)",
                    inverter.id
                )));
            }
        }
        Ok(())
    }

    fn build_grid(&self, builder: &mut ModelBuilder) -> GridVars {
        let n = self.horizon.len();
        let grid = &self.plant.grid;
        let matcher = TimeWindowMatcher;

        let import_kw = builder.var_vec(variable().min(0.0).max(grid.max_import_kw), n);
        let export_kw = builder.var_vec(variable().min(0.0).max(grid.max_export_kw), n);
        let import_violation_kw = builder.var_vec(variable().min(0.0), n);
        let import_on = builder.var_vec(variable().binary(), n);

        let import_allowed: Vec<bool> = self
            .horizon
            .slots
            .iter()
            .map(|slot| !matcher.matches(&grid.import_forbidden_periods, slot.start))
            .collect();

        for t in 0..n {
            // Import/export are mutually exclusive per slot: the binary
            // selects which side of the meter may be nonzero.
            builder.constrain(constraint!(import_kw[t] <= import_on[t] * grid.max_import_kw));
            builder.constrain(constraint!(
                export_kw[t] + import_on[t] * grid.max_export_kw <= grid.max_export_kw
            ));
            // Forbidden windows zero the cap; only the heavily penalized
            // slack can satisfy residual demand.
            let allowed_cap = if import_allowed[t] { grid.max_import_kw } else { 0.0 };
            builder.constrain(constraint!(
                import_kw[t] <= import_violation_kw[t] + allowed_cap
            ));
        }

        GridVars { import_kw, export_kw, import_violation_kw, import_allowed }
    }

    fn build_inverters(
        &self,
        builder: &mut ModelBuilder,
        grid: &GridVars,
    ) -> EmsResult<BTreeMap<String, InverterVars>> {
        let n = self.horizon.len();
        let mut inverters = BTreeMap::new();

        for inverter in &self.plant.inverters {
            let pv_available = self.series.pv_available_kw[&inverter.id].clone();
            let pv_kw = builder.var_vec(variable().min(0.0).max(inverter.peak_power_kw), n);
            let ac_net_kw = builder
                .var_vec(variable().min(-inverter.peak_power_kw).max(inverter.peak_power_kw), n);

            let curtail = match inverter.curtailment {
                None => {
                    for t in 0..n {
                        builder.constrain(constraint!(pv_kw[t] == pv_available[t]));
                    }
                    None
                }
                Some(mode) => {
                    let curtail = builder.var_vec(variable().binary(), n);
                    for t in 0..n {
                        match mode {
                            CurtailmentMode::Binary => {
                                // Either full PV or fully off.
                                builder.constrain(constraint!(
                                    pv_kw[t] + curtail[t] * pv_available[t] == pv_available[t]
                                ));
                            }
                            CurtailmentMode::LoadAware => {
                                builder.constrain(constraint!(pv_kw[t] <= pv_available[t]));
                                // The curtail flag relaxes the minimum output
                                // and blocks grid export while active.
                                builder.constrain(constraint!(
                                    pv_kw[t] + curtail[t] * pv_available[t] >= pv_available[t]
                                ));
                                builder.constrain(constraint!(
                                    grid.export_kw[t] + curtail[t] * self.plant.grid.max_export_kw
                                        <= self.plant.grid.max_export_kw
                                ));
                            }
                        }
                    }
                    Some(curtail)
                }
            };

            let battery = match &inverter.battery {
                None => {
                    for t in 0..n {
                        builder.constrain(constraint!(ac_net_kw[t] == pv_kw[t]));
                    }
                    None
                }
                Some(settings) => Some(self.build_battery(
                    builder,
                    inverter,
                    settings,
                    &pv_kw,
                    &ac_net_kw,
                )?),
            };

            inverters.insert(
                inverter.id.clone(),
                InverterVars {
                    name: inverter.name.clone(),
                    pv_kw,
                    ac_net_kw,
                    curtail,
                    pv_available_kw: pv_available,
                    battery,
                },
            );
        }

        Ok(inverters)
    }

    fn build_battery(
        &self,
        builder: &mut ModelBuilder,
        inverter: &InverterConfig,
        settings: &crate::domain::plant::BatterySettings,
        pv_kw: &[Variable],
        ac_net_kw: &[Variable],
    ) -> EmsResult<BatteryVars> {
        let n = self.horizon.len();
        let charge_limit = settings.max_charge_kw.unwrap_or(inverter.peak_power_kw);
        let discharge_limit = settings
            .max_discharge_kw
            .unwrap_or(inverter.peak_power_kw)
            .min(inverter.peak_power_kw);

        let soc_floor_pct = settings.min_soc_pct.max(settings.reserve_soc_pct);
        let soc_min_kwh = settings.capacity_kwh * soc_floor_pct / 100.0;
        let soc_max_kwh = settings.capacity_kwh * settings.max_soc_pct / 100.0;
        // Round-trip efficiency split symmetrically across charge and
        // discharge.
        let eta = (settings.storage_efficiency_pct / 100.0).sqrt();

        let charge_kw = builder.var_vec(variable().min(0.0).max(charge_limit), n);
        let discharge_kw = builder.var_vec(variable().min(0.0).max(discharge_limit), n);
        let charge_mode = builder.var_vec(variable().binary(), n);
        let soc_kwh = builder.var_vec(variable().min(soc_min_kwh).max(soc_max_kwh), n + 1);

        let initial_soc_pct = self
            .series
            .battery_initial_soc_pct
            .get(&inverter.id)
            .copied()
            .ok_or_else(|| {
                EmsError::Config(format!("missing initial SoC for inverter {}", inverter.id))
            })?;
        let initial_soc_kwh = settings.capacity_kwh * initial_soc_pct / 100.0;

        builder.constrain(constraint!(soc_kwh[0] == initial_soc_kwh));
        self.constrain_terminal_soc(builder, &soc_kwh, initial_soc_kwh, soc_min_kwh);

        for t in 0..n {
            // Mode selection prevents simultaneous charge and discharge;
            // idle is feasible in either mode.
            builder.constrain(constraint!(charge_kw[t] <= charge_mode[t] * charge_limit));
            builder.constrain(constraint!(
                discharge_kw[t] + charge_mode[t] * discharge_limit <= discharge_limit
            ));
            builder.constrain(constraint!(
                ac_net_kw[t] == pv_kw[t] + discharge_kw[t] - charge_kw[t]
            ));
            let dt_h = self.horizon.dt_hours(t);
            builder.constrain(constraint!(
                soc_kwh[t + 1]
                    == soc_kwh[t] + charge_kw[t] * (eta * dt_h) - discharge_kw[t] * (dt_h / eta)
            ));
        }

        Ok(BatteryVars { charge_kw, discharge_kw, soc_kwh, capacity_kwh: settings.capacity_kwh })
    }

    fn constrain_terminal_soc(
        &self,
        builder: &mut ModelBuilder,
        soc_kwh: &[Variable],
        initial_soc_kwh: f64,
        soc_min_kwh: f64,
    ) {
        let terminal = soc_kwh[soc_kwh.len() - 1];
        match self.terminal_soc.mode {
            TerminalSocMode::Hard => {
                builder.constrain(constraint!(terminal >= initial_soc_kwh));
            }
            TerminalSocMode::Adaptive => {
                // Relax the target from the initial SoC toward the floor in
                // proportion to horizon length, with a 24h reference: a full
                // day of lookahead may plan all the way down to the floor.
                let horizon_hours: f64 =
                    (0..self.horizon.len()).map(|t| self.horizon.dt_hours(t)).sum();
                let relax = (horizon_hours / 24.0).min(1.0);
                let floor = soc_min_kwh.min(initial_soc_kwh);
                let target = initial_soc_kwh - (initial_soc_kwh - floor) * relax;

                let shortfall = builder.var(variable().min(0.0));
                builder.constrain(constraint!(terminal + shortfall >= target));
                builder.add_cost(shortfall * self.terminal_penalty_per_kwh());
            }
        }
    }

    fn terminal_penalty_per_kwh(&self) -> f64 {
        match self.terminal_soc.penalty_per_kwh {
            TerminalSocPenalty::PerKwh(value) => value,
            TerminalSocPenalty::Statistic(PenaltyStatistic::Mean) => {
                mean(&self.series.price_import_eff)
            }
            TerminalSocPenalty::Statistic(PenaltyStatistic::Median) => {
                median(&self.series.price_import_eff)
            }
        }
    }

    fn build_evs(&self, builder: &mut ModelBuilder) -> EmsResult<BTreeMap<String, EvVars>> {
        let n = self.horizon.len();
        let mut evs = BTreeMap::new();

        for load in self.loads {
            let LoadConfig::ControlledEv(ev) = load;
            let resolved = self.series.evs.get(&ev.id).ok_or_else(|| {
                EmsError::Config(format!("missing resolved state for EV {}", ev.id))
            })?;

            let capacity_kwh = ev.energy_kwh;
            let initial_soc_kwh =
                (capacity_kwh * resolved.initial_soc_pct / 100.0).clamp(0.0, capacity_kwh);

            let charge_kw = builder.var_vec(variable().min(0.0).max(ev.max_power_kw), n);
            let soc_kwh = builder.var_vec(variable().min(0.0).max(capacity_kwh), n + 1);
            builder.constrain(constraint!(soc_kwh[0] == initial_soc_kwh));

            let allow = self.ev_connect_allowance(ev, resolved);

            let charge_on = if ev.min_power_kw > 0.0 {
                Some(builder.var_vec(variable().binary(), n))
            } else {
                None
            };

            let ramp_kw = builder.var_vec(variable().min(0.0), n);
            let anchor_kw = builder.var(variable().min(0.0));
            builder.constrain(constraint!(ramp_kw[0] == 0.0));
            builder.constrain(constraint!(
                anchor_kw >= charge_kw[0] - resolved.realtime_power_kw
            ));
            builder.constrain(constraint!(
                anchor_kw + charge_kw[0] >= resolved.realtime_power_kw
            ));
            builder.add_cost(anchor_kw * (EV_ANCHOR_PENALTY * self.horizon.dt_hours(0)));

            for t in 0..n {
                builder.constrain(constraint!(charge_kw[t] <= ev.max_power_kw * allow[t]));
                if let Some(charge_on) = &charge_on {
                    builder.constrain(constraint!(charge_on[t] <= allow[t]));
                    builder.constrain(constraint!(
                        charge_kw[t] >= charge_on[t] * ev.min_power_kw
                    ));
                    builder.constrain(constraint!(
                        charge_kw[t] <= charge_on[t] * ev.max_power_kw
                    ));
                }
                if t > 0 {
                    builder.constrain(constraint!(
                        ramp_kw[t] >= charge_kw[t] - charge_kw[t - 1]
                    ));
                    builder.constrain(constraint!(
                        ramp_kw[t] >= charge_kw[t - 1] - charge_kw[t]
                    ));
                    builder.add_cost(ramp_kw[t] * EV_RAMP_PENALTY);
                }
                let dt_h = self.horizon.dt_hours(t);
                builder.constrain(constraint!(
                    soc_kwh[t + 1] == soc_kwh[t] + charge_kw[t] * dt_h
                ));
            }

            self.build_ev_incentives(builder, ev, &soc_kwh)?;

            evs.insert(
                ev.id.clone(),
                EvVars {
                    name: ev.name.clone(),
                    charge_kw,
                    soc_kwh,
                    capacity_kwh,
                    connected: resolved.connected,
                },
            );
        }

        Ok(evs)
    }

    /// Per-slot connection gate: 1.0 when charging is permitted. A
    /// disconnected EV may still be counted on once the grace period from
    /// `now` has elapsed inside an allowed connect window.
    fn ev_connect_allowance(&self, ev: &ControlledEvLoad, resolved: &ResolvedEvState) -> Vec<f64> {
        let n = self.horizon.len();
        if resolved.connected {
            return vec![1.0; n];
        }
        if !resolved.can_connect {
            return vec![0.0; n];
        }
        let matcher = TimeWindowMatcher;
        let grace_end =
            self.horizon.now + Duration::minutes(i64::from(ev.connect_grace_minutes));
        self.horizon
            .slots
            .iter()
            .map(|slot| {
                if slot.start < grace_end {
                    0.0
                } else if matcher.allows(&ev.allowed_connect_times, slot.start) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn build_ev_incentives(
        &self,
        builder: &mut ModelBuilder,
        ev: &ControlledEvLoad,
        soc_kwh: &[Variable],
    ) -> EmsResult<()> {
        if ev.soc_incentives.is_empty() {
            return Ok(());
        }

        let capacity_kwh = ev.energy_kwh;
        let mut incentives = ev.soc_incentives.clone();
        incentives.sort_by(|a, b| a.target_soc_pct.total_cmp(&b.target_soc_pct));

        let mut segments: Vec<Variable> = Vec::new();
        let mut prev_target_kwh = 0.0f64;
        for incentive in &incentives {
            let target_kwh = capacity_kwh * incentive.target_soc_pct / 100.0;
            if target_kwh < prev_target_kwh {
                return Err(EmsError::Config(format!(
                    "EV incentive targets must be non-decreasing for {}",
                    ev.id
                )));
            }
            let segment = builder.var(variable().min(0.0).max(target_kwh - prev_target_kwh));
            if incentive.incentive.abs() > 1e-12 {
                builder.add_cost(segment * -incentive.incentive);
            }
            segments.push(segment);
            prev_target_kwh = target_kwh;
        }
        // Unrewarded headroom above the last target.
        let final_size = (capacity_kwh - prev_target_kwh).max(0.0);
        if final_size > 0.0 {
            segments.push(builder.var(variable().min(0.0).max(final_size)));
        }

        let terminal = soc_kwh[soc_kwh.len() - 1];
        let segment_sum: Expression = segments.iter().map(|&segment| Expression::from(segment)).sum();
        builder.constrain(constraint!(segment_sum == terminal));
        Ok(())
    }

    /// Grid plus inverter AC output covers base load and EV charging in
    /// every slot.
    fn build_ac_balance(
        &self,
        builder: &mut ModelBuilder,
        grid: &GridVars,
        inverters: &BTreeMap<String, InverterVars>,
        evs: &BTreeMap<String, EvVars>,
    ) {
        for t in 0..self.horizon.len() {
            let inverter_total: Expression = inverters
                .values()
                .map(|inverter| Expression::from(inverter.ac_net_kw[t]))
                .sum();
            let ev_total: Expression =
                evs.values().map(|ev| Expression::from(ev.charge_kw[t])).sum();
            let load_kw = self.series.load_kw[t];
            builder.constrain(constraint!(
                grid.import_kw[t] + inverter_total - grid.export_kw[t] == ev_total + load_kw
            ));
        }
    }

    fn build_objective(
        &self,
        builder: &mut ModelBuilder,
        grid: &GridVars,
        inverters: &BTreeMap<String, InverterVars>,
    ) {
        let n = self.horizon.len();

        for t in 0..n {
            let dt_h = self.horizon.dt_hours(t);
            let price_import = self.series.price_import_eff[t];
            // At a zero export price a tiny positive coefficient keeps
            // export preferred over curtailment.
            let price_export = if self.series.price_export_eff[t].abs() <= 1e-9 {
                ZERO_EXPORT_TIE_BREAK
            } else {
                self.series.price_export_eff[t]
            };
            builder.add_cost(grid.import_kw[t] * (price_import * dt_h));
            builder.add_cost(grid.export_kw[t] * (-price_export * dt_h));
            builder.add_cost(grid.import_violation_kw[t] * (VIOLATION_PENALTY_PER_KWH * dt_h));
            // Tiny bonus for earlier flows to break ties toward acting now.
            let early = -EARLY_FLOW_BONUS / (t as f64 + 1.0) * dt_h;
            builder.add_cost(grid.import_kw[t] * early);
            builder.add_cost(grid.export_kw[t] * early);
        }

        for (idx, inverter_cfg) in self.plant.inverters.iter().enumerate() {
            let Some(inverter) = inverters.get(&inverter_cfg.id) else { continue };
            if let (Some(settings), Some(battery)) = (&inverter_cfg.battery, &inverter.battery) {
                if settings.wear_cost_per_kwh > 0.0 {
                    for t in 0..n {
                        let dt_h = self.horizon.dt_hours(t);
                        let wear = settings.wear_cost_per_kwh * dt_h;
                        builder.add_cost(battery.charge_kw[t] * wear);
                        builder.add_cost(battery.discharge_kw[t] * wear);
                    }
                }
            }
            if let Some(curtail) = &inverter.curtail {
                // Stable ordering when several inverters are equally good
                // curtailment candidates.
                let weight =
                    CURTAIL_ORDER_TIE_BREAK * (self.plant.inverters.len() - idx) as f64;
                for t in 0..n {
                    builder.add_cost(curtail[t] * (weight * self.horizon.dt_hours(t)));
                }
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
