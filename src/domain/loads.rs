use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::domain::plant::{validate_id, TimeWindow};
use crate::resolver::sources::{BinarySource, PercentageSource, PowerSource};

/// Piecewise reward for terminal EV state of charge: charging up to
/// `target_soc_pct` earns `incentive` per kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SocIncentive {
    #[validate(range(min = 0.0, max = 100.0))]
    pub target_soc_pct: f64,
    pub incentive: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_ev_load"))]
pub struct ControlledEvLoad {
    #[validate(custom(function = "validate_id"))]
    pub id: String,
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(range(min = 0.0))]
    pub min_power_kw: f64,
    #[validate(range(min = 0.0))]
    pub max_power_kw: f64,
    #[validate(range(min = 0.0))]
    pub energy_kwh: f64,
    pub connected: BinarySource,
    /// Combined availability signal (true when the EV can be connected).
    #[serde(default)]
    pub can_connect: Option<BinarySource>,
    /// Local-time windows when connecting the EV is permitted.
    #[serde(default)]
    #[validate(nested)]
    pub allowed_connect_times: Vec<TimeWindow>,
    /// Grace period from "now" before assuming the EV can be connected.
    #[serde(default)]
    pub connect_grace_minutes: u32,
    pub realtime_power: PowerSource,
    pub state_of_charge: PercentageSource,
    #[serde(default)]
    #[validate(nested)]
    pub soc_incentives: Vec<SocIncentive>,
}

fn validate_ev_load(load: &ControlledEvLoad) -> Result<(), ValidationError> {
    if load.min_power_kw > load.max_power_kw {
        return Err(ValidationError::new("min_power_kw must be <= max_power_kw"));
    }
    let mut prev = 0.0f64;
    for incentive in &load.soc_incentives {
        if incentive.target_soc_pct < prev {
            return Err(ValidationError::new(
                "soc_incentives targets must be non-decreasing",
            ));
        }
        prev = incentive.target_soc_pct;
    }
    Ok(())
}

/// Controlled loads the planner schedules. Tagged so future load kinds can
/// join without breaking configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "load_type", rename_all = "snake_case")]
pub enum LoadConfig {
    ControlledEv(ControlledEvLoad),
}

impl LoadConfig {
    pub fn id(&self) -> &str {
        match self {
            LoadConfig::ControlledEv(ev) => &ev.id,
        }
    }

    pub fn as_controlled_ev(&self) -> Option<&ControlledEvLoad> {
        match self {
            LoadConfig::ControlledEv(ev) => Some(ev),
        }
    }
}

impl Validate for LoadConfig {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            LoadConfig::ControlledEv(ev) => ev.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(min_power_kw: f64, max_power_kw: f64, incentives: Vec<SocIncentive>) -> ControlledEvLoad {
        ControlledEvLoad {
            id: "ev_garage".to_string(),
            name: "Garage EV".to_string(),
            min_power_kw,
            max_power_kw,
            energy_kwh: 60.0,
            connected: BinarySource { entity: "binary_sensor.ev_connected".to_string() },
            can_connect: None,
            allowed_connect_times: Vec::new(),
            connect_grace_minutes: 0,
            realtime_power: PowerSource { entity: "sensor.ev_power".to_string() },
            state_of_charge: PercentageSource { entity: "sensor.ev_soc".to_string() },
            soc_incentives: incentives,
        }
    }

    #[test]
    fn power_bounds_are_checked() {
        assert!(ev(7.0, 3.0, Vec::new()).validate().is_err());
        assert!(ev(1.4, 7.0, Vec::new()).validate().is_ok());
    }

    #[test]
    fn incentive_targets_must_be_non_decreasing() {
        let bad = ev(
            0.0,
            7.0,
            vec![
                SocIncentive { target_soc_pct: 80.0, incentive: 0.05 },
                SocIncentive { target_soc_pct: 40.0, incentive: 0.1 },
            ],
        );
        assert!(bad.validate().is_err());

        let good = ev(
            0.0,
            7.0,
            vec![
                SocIncentive { target_soc_pct: 40.0, incentive: 0.1 },
                SocIncentive { target_soc_pct: 80.0, incentive: 0.05 },
            ],
        );
        assert!(good.validate().is_ok());
    }

    #[test]
    fn load_config_is_tagged() {
        let yaml = r#"
load_type: controlled_ev
id: ev_garage
name: Garage EV
min_power_kw: 1.4
max_power_kw: 7.0
energy_kwh: 60.0
connected:
  entity: binary_sensor.ev_connected
realtime_power:
  entity: sensor.ev_power
state_of_charge:
  entity: sensor.ev_soc
"#;
        let load: LoadConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(load.id(), "ev_garage");
        assert!(load.as_controlled_ev().is_some());
    }
}
