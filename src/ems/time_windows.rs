use chrono::{DateTime, Datelike, FixedOffset, Timelike};

use crate::domain::plant::TimeWindow;

const MONTH_ABBRS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Return the 3-letter lowercase abbreviation for a month number (1-12).
pub fn month_abbr(month: u32) -> &'static str {
    MONTH_ABBRS[(month as usize - 1) % 12]
}

pub(crate) fn parse_hhmm(value: &str) -> u32 {
    let (hour, minute) = value.split_once(':').unwrap_or(("0", "0"));
    let hour: u32 = hour.parse().unwrap_or(0);
    let minute: u32 = minute.parse().unwrap_or(0);
    hour * 60 + minute
}

fn minute_in_window(minute_of_day: u32, start: u32, end: u32) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        return start <= minute_of_day && minute_of_day < end;
    }
    // Wraps midnight.
    minute_of_day >= start || minute_of_day < end
}

/// Matches instants against `HH:MM` windows that may wrap midnight and may
/// be scoped to specific months.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeWindowMatcher;

impl TimeWindowMatcher {
    /// True when `when` falls inside any of the windows.
    pub fn matches(&self, windows: &[TimeWindow], when: DateTime<FixedOffset>) -> bool {
        if windows.is_empty() {
            return false;
        }
        let minute_of_day = when.hour() * 60 + when.minute();
        let month = month_abbr(when.month());
        for window in windows {
            if let Some(months) = &window.months {
                if !months.iter().any(|m| m == month) {
                    continue;
                }
            }
            let start = parse_hhmm(&window.start);
            let end = parse_hhmm(&window.end);
            if minute_in_window(minute_of_day, start, end) {
                return true;
            }
        }
        false
    }

    /// True when the windows permit `when`; an empty window list permits
    /// everything.
    pub fn allows(&self, windows: &[TimeWindow], when: DateTime<FixedOffset>) -> bool {
        if windows.is_empty() {
            return true;
        }
        self.matches(windows, when)
    }
}
