use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::domain::loads::LoadConfig;
use crate::domain::plan::EmsPlanOutput;

pub const DEFAULT_EPS_KW: f64 = 0.15;

/// Operational mode projected for one inverter from the first plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentMode {
    Backup,
    #[serde(rename = "Force Charge")]
    ForceCharge,
    #[serde(rename = "Force Discharge")]
    ForceDischarge,
    #[serde(rename = "Export Priority")]
    ExportPriority,
    #[serde(rename = "Self Consumption")]
    SelfConsumption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterIntent {
    pub mode: IntentMode,
    pub export_limit_kw: f64,
    pub force_charge_kw: f64,
    pub force_discharge_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadIntent {
    pub charge_kw: f64,
    pub charge_on: bool,
}

/// Compact operational directive derived from the first slot of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanIntent {
    pub inverters: BTreeMap<String, InverterIntent>,
    pub loads: BTreeMap<String, LoadIntent>,
}

/// Project per-inverter modes and per-EV charge intents from the first
/// plan step. Deterministic in its inputs.
pub fn build_plan_intent(plan: &EmsPlanOutput, config: &AppConfig, eps: f64) -> PlanIntent {
    let Some(step) = plan.timesteps.first() else {
        return PlanIntent { inverters: BTreeMap::new(), loads: BTreeMap::new() };
    };

    let grid_import_kw = step.grid.import_kw;
    let grid_export_kw = step.grid.export_kw;
    let no_export = step.economics.price_export < 0.0;
    let export_limit_normal_kw = config.plant.grid.max_export_kw;

    let mut inverters = BTreeMap::new();
    for (inverter_id, inverter) in &step.inverters {
        let battery = config
            .plant
            .inverters
            .iter()
            .find(|cfg| &cfg.id == inverter_id)
            .and_then(|cfg| cfg.battery.as_ref());
        let max_charge_kw = battery.and_then(|b| b.max_charge_kw);
        let max_discharge_kw = battery.and_then(|b| b.max_discharge_kw);

        let ac_net_kw = inverter.ac_net_kw;
        let charge_kw = inverter.battery_charge_kw.unwrap_or(0.0);
        let discharge_kw = inverter.battery_discharge_kw.unwrap_or(0.0);

        let mode = inverter_mode(
            ac_net_kw,
            discharge_kw,
            grid_import_kw,
            grid_export_kw,
            no_export,
            eps,
        );

        let export_limit_kw = export_limit_target(
            mode,
            ac_net_kw,
            grid_export_kw,
            max_discharge_kw,
            export_limit_normal_kw,
            no_export,
            eps,
        );

        inverters.insert(
            inverter_id.clone(),
            InverterIntent {
                mode,
                export_limit_kw,
                force_charge_kw: clamp_kw(charge_kw, max_charge_kw),
                force_discharge_kw: clamp_kw(discharge_kw, max_discharge_kw),
            },
        );
    }

    let mut loads = BTreeMap::new();
    for (ev_id, ev) in &step.loads.evs {
        let min_power_kw = config
            .loads
            .iter()
            .find(|load| load.id() == ev_id)
            .and_then(LoadConfig::as_controlled_ev)
            .map(|cfg| cfg.min_power_kw)
            .unwrap_or(0.0);
        let charge_on = ev.connected && ev.charge_kw >= min_power_kw;
        loads.insert(ev_id.clone(), LoadIntent { charge_kw: ev.charge_kw, charge_on });
    }

    PlanIntent { inverters, loads }
}

fn inverter_mode(
    ac_net_kw: f64,
    discharge_kw: f64,
    grid_import_kw: f64,
    grid_export_kw: f64,
    no_export: bool,
    eps: f64,
) -> IntentMode {
    if discharge_kw <= eps && grid_import_kw > eps && ac_net_kw >= -eps {
        return IntentMode::Backup;
    }
    if no_export {
        return if ac_net_kw < -eps { IntentMode::ForceCharge } else { IntentMode::SelfConsumption };
    }
    if ac_net_kw < -eps {
        return IntentMode::ForceCharge;
    }
    if discharge_kw > eps && grid_export_kw > eps {
        return IntentMode::ForceDischarge;
    }
    if grid_export_kw > eps && discharge_kw <= eps {
        return IntentMode::ExportPriority;
    }
    IntentMode::SelfConsumption
}

fn export_limit_target(
    mode: IntentMode,
    ac_net_kw: f64,
    grid_export_kw: f64,
    max_discharge_kw: Option<f64>,
    export_limit_normal_kw: f64,
    no_export: bool,
    eps: f64,
) -> f64 {
    if no_export {
        return 0.0;
    }
    if mode != IntentMode::ForceDischarge {
        return export_limit_normal_kw;
    }
    let at_max_discharge =
        max_discharge_kw.is_some_and(|max_kw| ac_net_kw >= max_kw - eps);
    if at_max_discharge {
        return export_limit_normal_kw;
    }
    export_limit_normal_kw.min(grid_export_kw.max(0.0))
}

fn clamp_kw(value: f64, max_kw: Option<f64>) -> f64 {
    let clamped = value.max(0.0);
    match max_kw {
        Some(max_kw) => clamped.min(max_kw),
        None => clamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // Idle battery, importing, nothing flowing out of the inverter.
    #[case(0.0, 0.0, 2.0, 0.0, false, IntentMode::Backup)]
    // Negative export price, inverter pulling AC in.
    #[case(-2.0, 0.0, 0.0, 0.0, true, IntentMode::ForceCharge)]
    // Negative export price, self-consuming.
    #[case(0.5, 0.0, 0.0, 0.0, true, IntentMode::SelfConsumption)]
    // Charging from the grid at positive prices.
    #[case(-3.0, 0.0, 3.5, 0.0, false, IntentMode::ForceCharge)]
    // Discharging into grid export.
    #[case(4.0, 3.0, 0.0, 3.0, false, IntentMode::ForceDischarge)]
    // Exporting PV with the battery idle.
    #[case(2.0, 0.0, 0.0, 2.0, false, IntentMode::ExportPriority)]
    // Nothing notable.
    #[case(0.5, 0.0, 0.0, 0.0, false, IntentMode::SelfConsumption)]
    fn mode_table(
        #[case] ac_net_kw: f64,
        #[case] discharge_kw: f64,
        #[case] grid_import_kw: f64,
        #[case] grid_export_kw: f64,
        #[case] no_export: bool,
        #[case] expected: IntentMode,
    ) {
        let mode = inverter_mode(
            ac_net_kw,
            discharge_kw,
            grid_import_kw,
            grid_export_kw,
            no_export,
            DEFAULT_EPS_KW,
        );
        assert_eq!(mode, expected);
    }

    #[test]
    fn export_limit_zero_when_export_price_negative() {
        let limit = export_limit_target(
            IntentMode::SelfConsumption,
            0.0,
            0.0,
            Some(5.0),
            8.0,
            true,
            DEFAULT_EPS_KW,
        );
        assert_eq!(limit, 0.0);
    }

    #[test]
    fn force_discharge_tracks_grid_export_until_max_discharge() {
        let limit = export_limit_target(
            IntentMode::ForceDischarge,
            3.0,
            2.5,
            Some(5.0),
            8.0,
            false,
            DEFAULT_EPS_KW,
        );
        assert_eq!(limit, 2.5);

        let at_max = export_limit_target(
            IntentMode::ForceDischarge,
            5.0,
            2.5,
            Some(5.0),
            8.0,
            false,
            DEFAULT_EPS_KW,
        );
        assert_eq!(at_max, 8.0);
    }

    #[test]
    fn serialized_modes_use_spaced_names() {
        assert_eq!(
            serde_json::to_string(&IntentMode::ForceDischarge).unwrap(),
            "\"Force Discharge\""
        );
        assert_eq!(
            serde_json::to_string(&IntentMode::SelfConsumption).unwrap(),
            "\"Self Consumption\""
        );
    }
}
