use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};

use crate::domain::plan::{
    EconomicsTimestepPlan, EmsPlanOutput, EmsPlanTimings, EvTimestepPlan, GridTimestepPlan,
    InverterTimestepPlan, LoadsTimestepPlan, TimestepPlan,
};
use crate::ems::horizon::Horizon;
use crate::optimizer::compiler::{CompiledModel, ResolvedSeries};
use crate::optimizer::model::SolveOutcome;

const CURTAIL_POWER_THRESHOLD_KW: f64 = 0.01;

/// Read solver valuations into a typed plan. Missing valuations resolve to
/// 0.0, so non-Optimal outcomes still produce a well-formed plan.
pub fn extract_plan(
    model: &CompiledModel,
    outcome: &SolveOutcome,
    horizon: &Horizon,
    series: &ResolvedSeries,
    generated_at: DateTime<FixedOffset>,
    timings: EmsPlanTimings,
) -> EmsPlanOutput {
    let mut cumulative_cost = 0.0f64;
    let mut timesteps = Vec::with_capacity(horizon.len());

    for (t, slot) in horizon.slots.iter().enumerate() {
        let import_kw = outcome.value(model.grid.import_kw[t]);
        let export_kw = outcome.value(model.grid.export_kw[t]);
        let import_violation_kw = outcome.value(model.grid.import_violation_kw[t]);

        let price_import = series.price_import_raw[t];
        let price_export = series.price_export_raw[t];
        let segment_cost =
            (import_kw * price_import - export_kw * price_export) * slot.duration_h();
        cumulative_cost += segment_cost;

        let mut inverters = BTreeMap::new();
        for (inverter_id, inverter) in &model.inverters {
            let pv_kw = outcome.value(inverter.pv_kw[t]);
            let pv_curtail_kw = (inverter.pv_available_kw[t] - pv_kw).max(0.0);
            let curtailment = inverter
                .curtail
                .as_ref()
                .map(|_| pv_curtail_kw > CURTAIL_POWER_THRESHOLD_KW);

            let (battery_charge_kw, battery_discharge_kw, battery_soc_kwh, battery_soc_pct) =
                match &inverter.battery {
                    Some(battery) => {
                        // SoC is reported at the end of the slot.
                        let soc_kwh = outcome.value(battery.soc_kwh[t + 1]);
                        let soc_pct = if battery.capacity_kwh > 0.0 {
                            Some(soc_kwh / battery.capacity_kwh * 100.0)
                        } else {
                            None
                        };
                        (
                            Some(outcome.value(battery.charge_kw[t])),
                            Some(outcome.value(battery.discharge_kw[t])),
                            Some(soc_kwh),
                            soc_pct,
                        )
                    }
                    None => (None, None, None, None),
                };

            inverters.insert(
                inverter_id.clone(),
                InverterTimestepPlan {
                    name: inverter.name.clone(),
                    pv_kw: Some(pv_kw),
                    pv_curtail_kw: Some(pv_curtail_kw),
                    ac_net_kw: outcome.value(inverter.ac_net_kw[t]),
                    battery_charge_kw,
                    battery_discharge_kw,
                    battery_soc_kwh,
                    battery_soc_pct,
                    curtailment,
                },
            );
        }

        let mut evs = BTreeMap::new();
        let mut ev_total_kw = 0.0f64;
        for (ev_id, ev) in &model.evs {
            let charge_kw = outcome.value(ev.charge_kw[t]);
            let soc_kwh = outcome.value(ev.soc_kwh[t]);
            let soc_pct = if ev.capacity_kwh > 0.0 {
                Some(soc_kwh / ev.capacity_kwh * 100.0)
            } else {
                None
            };
            ev_total_kw += charge_kw;
            evs.insert(
                ev_id.clone(),
                EvTimestepPlan {
                    name: ev.name.clone(),
                    charge_kw,
                    soc_kwh,
                    soc_pct,
                    connected: ev.connected,
                },
            );
        }

        let base_kw = series.load_kw[t];
        timesteps.push(TimestepPlan {
            index: t,
            start: slot.start,
            end: slot.end,
            duration_s: slot.duration_s(),
            grid: GridTimestepPlan {
                import_kw,
                export_kw,
                net_kw: import_kw - export_kw,
                import_allowed: Some(model.grid.import_allowed[t]),
                import_violation_kw: Some(import_violation_kw),
            },
            inverters,
            loads: LoadsTimestepPlan { base_kw, evs, total_kw: base_kw + ev_total_kw },
            economics: EconomicsTimestepPlan {
                price_import,
                price_export,
                price_import_effective: series.price_import_eff[t],
                price_export_effective: series.price_export_eff[t],
                segment_cost,
                cumulative_cost,
            },
        });
    }

    EmsPlanOutput {
        generated_at,
        status: outcome.status,
        objective_value: outcome.objective_value,
        timings,
        timesteps,
    }
}

/// A plan that never reached the solver (resolve failures and the like):
/// status only, no timesteps.
pub fn not_solved_plan(
    generated_at: DateTime<FixedOffset>,
    timings: EmsPlanTimings,
) -> EmsPlanOutput {
    EmsPlanOutput {
        generated_at,
        status: crate::domain::plan::PlanStatus::NotSolved,
        objective_value: None,
        timings,
        timesteps: Vec::new(),
    }
}
