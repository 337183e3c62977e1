//! End-to-end dispatch scenarios: compile, solve with CBC, and check the
//! extracted plan against physical and economic expectations.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

use home_ems::config::{TerminalSocMode, TerminalSocPenalty, TerminalSocSettings};
use home_ems::domain::loads::{ControlledEvLoad, LoadConfig, SocIncentive};
use home_ems::domain::plan::{EmsPlanOutput, EmsPlanTimings, PlanStatus};
use home_ems::domain::plant::{
    BaseLoadConfig, BatterySettings, CurtailmentMode, GridConfig, InverterConfig, PlantConfig,
    PvSettings, TimeWindow,
};
use home_ems::ems::horizon::{build_horizon, Horizon, HorizonSpec};
use home_ems::optimizer::{extract_plan, MilpCompiler, ResolvedEvState, ResolvedSeries};
use home_ems::resolver::sources::{
    BinarySource, CurrencySource, HistoricalLoadForecastSource, PercentageSource, PowerSource,
    PriceForecastSource, PvForecastSource,
};

const TOL: f64 = 1e-4;

fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
    Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap().fixed_offset()
}

fn horizon(now: DateTime<FixedOffset>, timestep_minutes: u32, intervals: u32) -> Horizon {
    build_horizon(
        now,
        &HorizonSpec {
            timestep_minutes,
            high_res_timestep_minutes: None,
            high_res_horizon_minutes: None,
            total_minutes: timestep_minutes * intervals,
        },
    )
    .unwrap()
}

fn grid(max_import_kw: f64, max_export_kw: f64) -> GridConfig {
    GridConfig {
        max_import_kw,
        max_export_kw,
        realtime_price_import: CurrencySource { entity: "sensor.price_import".to_string() },
        realtime_price_export: CurrencySource { entity: "sensor.price_export".to_string() },
        price_import_forecast: PriceForecastSource {
            entity: "sensor.price_import_forecast".to_string(),
            mode: None,
            extension_hours: None,
            extension_median: None,
        },
        price_export_forecast: PriceForecastSource {
            entity: "sensor.price_export_forecast".to_string(),
            mode: None,
            extension_hours: None,
            extension_median: None,
        },
        import_forbidden_periods: Vec::new(),
        price_bias_pct: 0.0,
        price_risk: None,
    }
}

fn base_load() -> BaseLoadConfig {
    BaseLoadConfig {
        realtime_power: PowerSource { entity: "sensor.house_load".to_string() },
        forecast: HistoricalLoadForecastSource {
            entity: "sensor.house_load".to_string(),
            history_days: 7,
            unit: "kW".to_string(),
            interval_duration: 5,
            forecast_horizon_hours: 24,
            realtime_window_minutes: None,
        },
    }
}

fn inverter(id: &str, peak_kw: f64, curtailment: Option<CurtailmentMode>) -> InverterConfig {
    InverterConfig {
        id: id.to_string(),
        name: format!("{id} inverter"),
        peak_power_kw: peak_kw,
        curtailment,
        pv: PvSettings {
            realtime_power: None,
            forecast: PvForecastSource { entities: vec![format!("sensor.{id}_pv")] },
        },
        battery: None,
    }
}

fn battery(capacity_kwh: f64, min_pct: f64, max_pct: f64) -> BatterySettings {
    BatterySettings {
        capacity_kwh,
        storage_efficiency_pct: 90.0,
        wear_cost_per_kwh: 0.0,
        min_soc_pct: min_pct,
        max_soc_pct: max_pct,
        reserve_soc_pct: 0.0,
        max_charge_kw: Some(5.0),
        max_discharge_kw: Some(5.0),
        state_of_charge: PercentageSource { entity: "sensor.battery_soc".to_string() },
    }
}

fn ev(id: &str, min_kw: f64, max_kw: f64, capacity_kwh: f64, incentives: Vec<SocIncentive>) -> LoadConfig {
    LoadConfig::ControlledEv(ControlledEvLoad {
        id: id.to_string(),
        name: format!("{id} EV"),
        min_power_kw: min_kw,
        max_power_kw: max_kw,
        energy_kwh: capacity_kwh,
        connected: BinarySource { entity: format!("binary_sensor.{id}_connected") },
        can_connect: None,
        allowed_connect_times: Vec::new(),
        connect_grace_minutes: 0,
        realtime_power: PowerSource { entity: format!("sensor.{id}_power") },
        state_of_charge: PercentageSource { entity: format!("sensor.{id}_soc") },
        soc_incentives: incentives,
    })
}

fn hard_terminal() -> TerminalSocSettings {
    TerminalSocSettings {
        mode: TerminalSocMode::Hard,
        penalty_per_kwh: TerminalSocPenalty::PerKwh(0.0),
    }
}

fn series(
    n: usize,
    load_kw: f64,
    price_import: &[f64],
    price_export: &[f64],
    pv: &[(&str, f64)],
) -> ResolvedSeries {
    ResolvedSeries {
        load_kw: vec![load_kw; n],
        price_import_raw: price_import.to_vec(),
        price_export_raw: price_export.to_vec(),
        price_import_eff: price_import.to_vec(),
        price_export_eff: price_export.to_vec(),
        pv_available_kw: pv
            .iter()
            .map(|(id, kw)| (id.to_string(), vec![*kw; n]))
            .collect(),
        battery_initial_soc_pct: BTreeMap::new(),
        evs: BTreeMap::new(),
    }
}

fn solve(
    plant: &PlantConfig,
    loads: &[LoadConfig],
    terminal: &TerminalSocSettings,
    horizon: &Horizon,
    series: &ResolvedSeries,
) -> EmsPlanOutput {
    let compiled = MilpCompiler::new(plant, loads, terminal, horizon, series)
        .compile()
        .expect("compile");
    let outcome = compiled.builder.solve();
    extract_plan(&compiled.model, &outcome, horizon, series, horizon.now, EmsPlanTimings::zeroed())
}

fn assert_universal_invariants(plan: &EmsPlanOutput) {
    for step in &plan.timesteps {
        assert!(step.grid.import_kw >= -TOL);
        assert!(step.grid.export_kw >= -TOL);
        // Disjoint flow.
        assert!(step.grid.import_kw * step.grid.export_kw <= TOL);

        let inverter_net: f64 = step.inverters.values().map(|inv| inv.ac_net_kw).sum();
        let ev_total: f64 = step.loads.evs.values().map(|ev| ev.charge_kw).sum();
        let balance =
            step.grid.import_kw + inverter_net - step.grid.export_kw - step.loads.base_kw - ev_total;
        assert!(balance.abs() < 1e-3, "AC balance violated: {balance}");

        if step.grid.import_allowed == Some(false) {
            let violation = step.grid.import_violation_kw.unwrap_or(0.0);
            assert!(step.grid.import_kw <= violation + TOL);
        }
    }
}

#[test]
fn export_with_positive_price() {
    let now = at(8, 0);
    let horizon = horizon(now, 5, 2);
    let plant = PlantConfig {
        grid: grid(10.0, 10.0),
        load: base_load(),
        inverters: vec![inverter("garage", 10.0, None)],
    };
    let series = series(2, 1.0, &[0.1, 0.2], &[0.05, 0.05], &[("garage", 2.0)]);

    let plan = solve(&plant, &[], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_universal_invariants(&plan);

    for step in &plan.timesteps {
        assert!((step.grid.export_kw - 1.0).abs() < TOL);
        assert!(step.grid.import_kw.abs() < TOL);
    }
    assert!(plan.objective_value.unwrap() < 0.0);
}

#[test]
fn forbidden_import_window_is_satisfied_by_slack() {
    let now = at(0, 0);
    let horizon = horizon(now, 60, 2);
    let mut plant = PlantConfig {
        grid: grid(10.0, 0.0),
        load: base_load(),
        inverters: vec![inverter("garage", 10.0, None)],
    };
    plant.grid.import_forbidden_periods = vec![TimeWindow {
        start: "00:00".to_string(),
        end: "01:00".to_string(),
        months: None,
    }];
    let mut series = series(2, 0.0, &[0.5, 0.5], &[0.0, 0.0], &[("garage", 0.0)]);
    series.load_kw = vec![5.0, 0.0];

    let plan = solve(&plant, &[], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_universal_invariants(&plan);

    let first = &plan.timesteps[0];
    assert_eq!(first.grid.import_allowed, Some(false));
    assert!((first.grid.import_kw - 5.0).abs() < TOL);
    assert!((first.grid.import_violation_kw.unwrap() - 5.0).abs() < TOL);

    let second = &plan.timesteps[1];
    assert_eq!(second.grid.import_allowed, Some(true));
    assert!(second.grid.import_kw.abs() < TOL);
    assert!(second.grid.import_violation_kw.unwrap().abs() < TOL);
}

#[test]
fn load_aware_curtailment_avoids_paid_export() {
    let now = at(12, 0);
    let horizon = horizon(now, 30, 2);
    let plant = PlantConfig {
        grid: grid(10.0, 10.0),
        load: base_load(),
        inverters: vec![inverter("garage", 10.0, Some(CurtailmentMode::LoadAware))],
    };
    let series = series(2, 0.5, &[0.2, 0.2], &[-0.1, -0.1], &[("garage", 2.0)]);

    let plan = solve(&plant, &[], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_universal_invariants(&plan);

    for step in &plan.timesteps {
        let inv = &step.inverters["garage"];
        assert!(inv.pv_curtail_kw.unwrap() > TOL, "expected curtailment");
        assert_eq!(inv.curtailment, Some(true));
        assert!(step.grid.export_kw.abs() < TOL);
        assert!(step.grid.import_kw.abs() < TOL);
    }
}

#[test]
fn binary_curtailment_prefers_import_over_paid_export() {
    let now = at(12, 0);
    let horizon = horizon(now, 30, 2);
    let plant = PlantConfig {
        grid: grid(10.0, 10.0),
        load: base_load(),
        inverters: vec![inverter("garage", 10.0, Some(CurtailmentMode::Binary))],
    };
    let series = series(2, 0.5, &[0.1, 0.1], &[-0.5, -0.5], &[("garage", 2.0)]);

    let plan = solve(&plant, &[], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_universal_invariants(&plan);

    for step in &plan.timesteps {
        let inv = &step.inverters["garage"];
        // All-or-nothing: the full 2 kW is shed and the remaining load is
        // imported.
        assert!((inv.pv_curtail_kw.unwrap() - 2.0).abs() < TOL);
        assert!((step.grid.import_kw - 0.5).abs() < TOL);
        assert!(step.grid.export_kw.abs() < TOL);
    }
}

#[test]
fn battery_shifts_energy_from_cheap_to_expensive_hours() {
    let now = at(0, 0);
    let horizon = horizon(now, 60, 4);
    let mut inverter_cfg = inverter("garage", 10.0, None);
    inverter_cfg.battery = Some(battery(10.0, 10.0, 95.0));
    let plant = PlantConfig {
        grid: grid(10.0, 10.0),
        load: base_load(),
        inverters: vec![inverter_cfg],
    };
    let mut series = series(
        4,
        2.0,
        &[0.05, 0.05, 1.0, 1.0],
        &[0.0, 0.0, 0.0, 0.0],
        &[("garage", 0.0)],
    );
    series.battery_initial_soc_pct.insert("garage".to_string(), 50.0);

    let plan = solve(&plant, &[], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_universal_invariants(&plan);

    let eta = (0.9f64).sqrt();
    let mut prev_soc = 5.0;
    for step in &plan.timesteps {
        let inv = &step.inverters["garage"];
        let charge = inv.battery_charge_kw.unwrap();
        let discharge = inv.battery_discharge_kw.unwrap();
        let soc = inv.battery_soc_kwh.unwrap();
        // No simultaneous charge/discharge.
        assert!(charge * discharge <= TOL);
        // Energy balance with symmetric single-sided efficiency.
        let expected = prev_soc + charge * eta - discharge / eta;
        assert!((soc - expected).abs() < 1e-3, "SoC step mismatch: {soc} vs {expected}");
        // Bounds.
        assert!(soc >= 1.0 - TOL && soc <= 9.5 + TOL);
        prev_soc = soc;
    }

    // Cheap hours charge, expensive hours discharge.
    let early_charge: f64 = plan.timesteps[..2]
        .iter()
        .map(|s| s.inverters["garage"].battery_charge_kw.unwrap())
        .sum();
    let late_discharge: f64 = plan.timesteps[2..]
        .iter()
        .map(|s| s.inverters["garage"].battery_discharge_kw.unwrap())
        .sum();
    assert!(early_charge > TOL);
    assert!(late_discharge > TOL);

    // Hard terminal mode: end at or above the initial SoC.
    let final_soc = plan.timesteps.last().unwrap().inverters["garage"].battery_soc_kwh.unwrap();
    assert!(final_soc >= 5.0 - 1e-3);
}

#[test]
fn ev_incentive_segments_reach_second_target() {
    let now = at(8, 0);
    let horizon = horizon(now, 60, 4);
    let plant = PlantConfig {
        grid: grid(30.0, 30.0),
        load: base_load(),
        inverters: vec![inverter("garage", 30.0, None)],
    };
    let loads = vec![ev(
        "ev_garage",
        0.0,
        15.0,
        60.0,
        vec![
            SocIncentive { target_soc_pct: 40.0, incentive: 0.1 },
            SocIncentive { target_soc_pct: 80.0, incentive: 0.05 },
        ],
    )];
    let mut series = series(
        4,
        0.0,
        &[0.01; 4],
        &[0.0; 4],
        &[("garage", 20.0)],
    );
    series.evs.insert(
        "ev_garage".to_string(),
        ResolvedEvState {
            connected: true,
            can_connect: true,
            realtime_power_kw: 0.0,
            initial_soc_pct: 0.0,
        },
    );

    let plan = solve(&plant, &loads, &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_universal_invariants(&plan);

    // EV SoC dynamics.
    let mut prev = 0.0;
    for step in &plan.timesteps {
        let ev_plan = &step.loads.evs["ev_garage"];
        assert!(ev_plan.charge_kw >= -TOL && ev_plan.charge_kw <= 15.0 + TOL);
        assert!((ev_plan.soc_kwh - prev).abs() < 1e-3, "reported SoC is start-of-slot");
        prev += ev_plan.charge_kw;
        assert!(prev <= 60.0 + TOL);
    }

    // Both incentive bands are worth more than idle PV export at zero
    // price; charging stops at the 80% target.
    assert!((prev - 48.0).abs() < 0.1, "expected terminal SoC of 48 kWh, got {prev}");
}

#[test]
fn disconnected_ev_with_grace_cannot_charge_early() {
    let now = at(8, 0);
    let horizon = horizon(now, 60, 4);
    let plant = PlantConfig {
        grid: grid(30.0, 30.0),
        load: base_load(),
        inverters: vec![inverter("garage", 30.0, None)],
    };
    let mut ev_load = ev(
        "ev_garage",
        0.0,
        10.0,
        60.0,
        vec![SocIncentive { target_soc_pct: 50.0, incentive: 1.0 }],
    );
    if let LoadConfig::ControlledEv(ev_cfg) = &mut ev_load {
        ev_cfg.connect_grace_minutes = 120;
    }
    let mut series = series(4, 0.0, &[0.01; 4], &[0.0; 4], &[("garage", 20.0)]);
    series.evs.insert(
        "ev_garage".to_string(),
        ResolvedEvState {
            connected: false,
            can_connect: true,
            realtime_power_kw: 0.0,
            initial_soc_pct: 0.0,
        },
    );

    let plan = solve(&plant, &[ev_load], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);

    // The first two hours fall inside the grace period.
    assert!(plan.timesteps[0].loads.evs["ev_garage"].charge_kw < TOL);
    assert!(plan.timesteps[1].loads.evs["ev_garage"].charge_kw < TOL);
    let late_charge: f64 = plan.timesteps[2..]
        .iter()
        .map(|s| s.loads.evs["ev_garage"].charge_kw)
        .sum();
    assert!(late_charge > 1.0);
}

#[test]
fn zero_export_price_prefers_export_over_curtailment() {
    let now = at(12, 0);
    let horizon = horizon(now, 30, 2);
    let plant = PlantConfig {
        grid: grid(10.0, 10.0),
        load: base_load(),
        inverters: vec![inverter("garage", 10.0, Some(CurtailmentMode::LoadAware))],
    };
    let series = series(2, 0.5, &[0.2, 0.2], &[0.0, 0.0], &[("garage", 2.0)]);

    let plan = solve(&plant, &[], &hard_terminal(), &horizon, &series);
    assert_eq!(plan.status, PlanStatus::Optimal);

    for step in &plan.timesteps {
        let inv = &step.inverters["garage"];
        assert!(inv.pv_curtail_kw.unwrap() < TOL, "free export beats curtailment");
        assert!((step.grid.export_kw - 1.5).abs() < TOL);
    }
}
