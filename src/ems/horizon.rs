use chrono::{DateTime, Duration, FixedOffset, Timelike};

use crate::error::{EmsError, EmsResult};

/// One half-open `[start, end)` slot within a horizon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HorizonSlot {
    pub index: usize,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl HorizonSlot {
    pub fn duration_m(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn duration_s(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64
    }

    pub fn duration_h(&self) -> f64 {
        self.duration_s() / 3600.0
    }

    pub fn midpoint(&self) -> DateTime<FixedOffset> {
        self.start + (self.end - self.start) / 2
    }
}

/// Ordered, contiguous slot sequence plus the `now` reference used by
/// time-ramped price biases.
#[derive(Debug, Clone)]
pub struct Horizon {
    pub now: DateTime<FixedOffset>,
    pub start: DateTime<FixedOffset>,
    pub slots: Vec<HorizonSlot>,
}

impl Horizon {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn end(&self) -> DateTime<FixedOffset> {
        self.slots.last().map(|slot| slot.end).unwrap_or(self.start)
    }

    pub fn dt_hours(&self, t: usize) -> f64 {
        self.slots[t].duration_h()
    }
}

/// Horizon discretization parameters.
///
/// `high_res_timestep_minutes` and `high_res_horizon_minutes` must be set
/// together; the horizon must be a multiple of the timestep.
#[derive(Debug, Clone, Copy)]
pub struct HorizonSpec {
    pub timestep_minutes: u32,
    pub high_res_timestep_minutes: Option<u32>,
    pub high_res_horizon_minutes: Option<u32>,
    pub total_minutes: u32,
}

impl HorizonSpec {
    fn validate(&self) -> EmsResult<()> {
        if self.timestep_minutes == 0 {
            return Err(EmsError::Config("timestep_minutes must be positive".to_string()));
        }
        match (self.high_res_timestep_minutes, self.high_res_horizon_minutes) {
            (None, None) => Ok(()),
            (Some(step), Some(span)) => {
                if step == 0 {
                    return Err(EmsError::Config(
                        "high_res_timestep_minutes must be positive".to_string(),
                    ));
                }
                if span % step != 0 {
                    return Err(EmsError::Config(
                        "high_res_horizon_minutes must be a multiple of high_res_timestep_minutes"
                            .to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(EmsError::Config(
                "high_res_timestep_minutes and high_res_horizon_minutes must be set together"
                    .to_string(),
            )),
        }
    }
}

/// Floor an instant to the previous `step_minutes` wall-clock boundary
/// within its hour.
fn floor_to_step(at: DateTime<FixedOffset>, step_minutes: u32) -> DateTime<FixedOffset> {
    let step = step_minutes.min(60).max(1);
    let minute = (at.minute() / step) * step;
    at.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Next `step_minutes` wall-clock boundary at or after `at`.
fn align_up_to_step(at: DateTime<FixedOffset>, step_minutes: u32) -> DateTime<FixedOffset> {
    let floored = floor_to_step(at, step_minutes);
    if floored >= at {
        floored
    } else {
        floored + Duration::minutes(i64::from(step_minutes))
    }
}

/// Build the planning horizon starting from `now`.
///
/// Without a high-res window the start floors to the coarse timestep
/// boundary and equal coarse slots are emitted (the last may be partial).
/// With a high-res window the horizon starts exactly at `now`: high-res
/// slots run until the next coarse-aligned boundary at or after
/// `now + high_res_horizon_minutes`, then coarse slots follow.
pub fn build_horizon(now: DateTime<FixedOffset>, spec: &HorizonSpec) -> EmsResult<Horizon> {
    spec.validate()?;

    let coarse = Duration::minutes(i64::from(spec.timestep_minutes));
    let total = Duration::minutes(i64::from(spec.total_minutes));

    let mut slots: Vec<HorizonSlot> = Vec::new();
    let mut push = |start: DateTime<FixedOffset>, end: DateTime<FixedOffset>| {
        let index = slots.len();
        slots.push(HorizonSlot { index, start, end });
    };

    let start = match (spec.high_res_timestep_minutes, spec.high_res_horizon_minutes) {
        (Some(step), Some(span)) => {
            let start = now;
            let end = start + total;
            let fine = Duration::minutes(i64::from(step));
            let boundary = align_up_to_step(now + Duration::minutes(i64::from(span)), spec.timestep_minutes);
            let fine_until = boundary.min(end);

            let mut cursor = start;
            while cursor < fine_until {
                let slot_end = (cursor + fine).min(fine_until);
                push(cursor, slot_end);
                cursor = slot_end;
            }
            while cursor < end {
                let slot_end = (cursor + coarse).min(end);
                push(cursor, slot_end);
                cursor = slot_end;
            }
            start
        }
        _ => {
            let start = floor_to_step(now, spec.timestep_minutes);
            let end = start + total;
            let mut cursor = start;
            while cursor < end {
                let slot_end = (cursor + coarse).min(end);
                push(cursor, slot_end);
                cursor = slot_end;
            }
            start
        }
    };

    Ok(Horizon { now, start, slots })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<FixedOffset> {
        chrono::Utc
            .with_ymd_and_hms(2025, 12, 27, h, m, 0)
            .unwrap()
            .fixed_offset()
    }

    fn spec(
        timestep: u32,
        high_res: Option<(u32, u32)>,
        total: u32,
    ) -> HorizonSpec {
        HorizonSpec {
            timestep_minutes: timestep,
            high_res_timestep_minutes: high_res.map(|(step, _)| step),
            high_res_horizon_minutes: high_res.map(|(_, span)| span),
            total_minutes: total,
        }
    }

    fn durations(horizon: &Horizon) -> Vec<i64> {
        horizon.slots.iter().map(HorizonSlot::duration_m).collect()
    }

    #[test]
    fn two_resolution_schedule() {
        let now = utc(0, 0);
        let horizon = build_horizon(now, &spec(30, Some((5, 10)), 70)).unwrap();
        assert_eq!(durations(&horizon), vec![5, 5, 5, 5, 5, 5, 30, 10]);
        assert_eq!(horizon.start, now);
        assert_eq!(horizon.end(), now + Duration::minutes(70));
    }

    #[test]
    fn partial_final_slot() {
        let now = utc(0, 0);
        let horizon = build_horizon(now, &spec(30, Some((5, 10)), 65)).unwrap();
        assert_eq!(durations(&horizon), vec![5, 5, 5, 5, 5, 5, 30, 5]);
        assert_eq!(horizon.end(), now + Duration::minutes(65));
    }

    #[test]
    fn coarse_slots_start_on_aligned_boundaries() {
        let now = utc(3, 55);
        let horizon = build_horizon(now, &spec(30, Some((5, 20)), 80)).unwrap();
        let coarse: Vec<_> = horizon
            .slots
            .iter()
            .filter(|slot| slot.duration_m() == 30)
            .collect();
        assert!(!coarse.is_empty());
        for slot in coarse {
            assert!(slot.start.minute() == 0 || slot.start.minute() == 30);
        }
    }

    #[test]
    fn high_res_window_snaps_forward_to_boundary() {
        let now = utc(3, 55);
        let horizon = build_horizon(now, &spec(30, Some((5, 35)), 120)).unwrap();
        let transition = horizon
            .slots
            .iter()
            .find(|slot| slot.duration_m() == 30)
            .expect("coarse slot expected");
        assert!(transition.start.minute() == 0 || transition.start.minute() == 30);
        assert!(transition.start >= now);
    }

    #[test]
    fn high_res_window_can_cover_entire_horizon() {
        let now = utc(0, 0);
        let horizon = build_horizon(now, &spec(30, Some((5, 60)), 60)).unwrap();
        assert!(horizon.slots.iter().all(|slot| slot.duration_m() == 5));
        assert_eq!(horizon.end(), now + Duration::minutes(60));
    }

    #[test]
    fn single_resolution_floors_start() {
        let now = utc(0, 2);
        let horizon = build_horizon(now, &spec(15, None, 60)).unwrap();
        assert_eq!(durations(&horizon), vec![15, 15, 15, 15]);
        assert_eq!(horizon.start.minute(), 0);
        assert_eq!(horizon.now, now);
    }

    #[test]
    fn slots_are_contiguous_and_indexed() {
        let now = utc(3, 55);
        let horizon = build_horizon(now, &spec(30, Some((5, 35)), 120)).unwrap();
        for (idx, pair) in horizon.slots.windows(2).enumerate() {
            assert_eq!(pair[0].index, idx);
            assert_eq!(pair[0].end, pair[1].start);
        }
        let total: i64 = horizon.slots.iter().map(HorizonSlot::duration_m).sum();
        assert_eq!(total, 120);
    }

    #[test]
    fn unpaired_high_res_settings_are_rejected() {
        let now = utc(0, 0);
        let spec = HorizonSpec {
            timestep_minutes: 30,
            high_res_timestep_minutes: Some(5),
            high_res_horizon_minutes: None,
            total_minutes: 60,
        };
        assert!(matches!(build_horizon(now, &spec), Err(EmsError::Config(_))));
    }

    #[test]
    fn misaligned_high_res_horizon_is_rejected() {
        let now = utc(0, 0);
        let horizon = build_horizon(now, &spec(30, Some((5, 12)), 60));
        assert!(matches!(horizon, Err(EmsError::Config(_))));
    }
}
