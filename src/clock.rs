use std::cell::Cell;

use chrono::{DateTime, FixedOffset, Local};

thread_local! {
    static FROZEN_NOW: Cell<Option<DateTime<FixedOffset>>> = const { Cell::new(None) };
}

/// Current wall-clock time, honoring an active freeze on this thread.
pub fn now() -> DateTime<FixedOffset> {
    FROZEN_NOW
        .with(Cell::get)
        .unwrap_or_else(|| Local::now().fixed_offset())
}

/// Scoped wall-clock freeze used by fixture replay.
///
/// While the guard is alive, [`now`] on this thread returns the frozen
/// instant. Dropping the guard restores the previous state, including a
/// previously active freeze.
#[derive(Debug)]
pub struct FrozenTime {
    previous: Option<DateTime<FixedOffset>>,
}

impl FrozenTime {
    pub fn freeze(at: DateTime<FixedOffset>) -> Self {
        let previous = FROZEN_NOW.with(|cell| cell.replace(Some(at)));
        Self { previous }
    }
}

impl Drop for FrozenTime {
    fn drop(&mut self) {
        let previous = self.previous;
        FROZEN_NOW.with(|cell| cell.set(previous));
    }
}
