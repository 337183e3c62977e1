use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Half-open `[start, end)` interval carrying a price in currency per kWh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceForecastInterval {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub value: f64,
}

/// Half-open `[start, end)` interval carrying power in kW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerForecastInterval {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub value: f64,
}

/// Shared view over forecast interval types, used by the aligner.
pub trait ForecastPoint {
    fn start(&self) -> DateTime<FixedOffset>;
    fn end(&self) -> DateTime<FixedOffset>;
    fn value(&self) -> f64;
}

impl ForecastPoint for PriceForecastInterval {
    fn start(&self) -> DateTime<FixedOffset> {
        self.start
    }
    fn end(&self) -> DateTime<FixedOffset> {
        self.end
    }
    fn value(&self) -> f64 {
        self.value
    }
}

impl ForecastPoint for PowerForecastInterval {
    fn start(&self) -> DateTime<FixedOffset> {
        self.start
    }
    fn end(&self) -> DateTime<FixedOffset> {
        self.end
    }
    fn value(&self) -> f64 {
        self.value
    }
}
