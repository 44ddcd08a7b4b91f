//! Dual-resolution timestamps of the query table.
//!
//! Near deadlines use the microsecond counter; anything at or beyond the
//! clock's high-precision horizon uses the coarse 1/128 s counter. Raw
//! values of different kinds are never compared directly.
use crate::platform::Clock;

const COARSE_TICKS_PER_SECOND: u64 = 128;
/// Largest coarse delta whose microsecond value fits in 32 bits.
const MAX_COARSE_DELTA: u32 = 549_755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    HighPrecision(u32),
    Coarse(u32),
}

fn wrapping_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

impl Timestamp {
    /// The instant `ms` milliseconds from now.
    pub fn after_ms<C: Clock + ?Sized>(clock: &C, ms: u32) -> Self {
        if ms < clock.max_hp_delay_us() / 1000 {
            Timestamp::HighPrecision(clock.now_hp().wrapping_add(ms * 1000))
        } else {
            let ticks = (ms as u64 * COARSE_TICKS_PER_SECOND).div_ceil(1000);
            Timestamp::Coarse(clock.now_coarse().wrapping_add(ticks as u32))
        }
    }

    /// Microseconds until this instant, 0 once it has passed.
    pub fn delay_from_now_us<C: Clock + ?Sized>(&self, clock: &C) -> u32 {
        match *self {
            Timestamp::HighPrecision(at) => {
                let now = clock.now_hp();
                if wrapping_before(at, now) {
                    0
                } else {
                    at.wrapping_sub(now)
                }
            }
            Timestamp::Coarse(at) => {
                let now = clock.now_coarse();
                if wrapping_before(at, now) {
                    return 0;
                }
                let delta = at.wrapping_sub(now);
                if delta > MAX_COARSE_DELTA {
                    u32::MAX
                } else {
                    delta * 1000 / 128 * 1000
                }
            }
        }
    }

    /// Strict ordering; mixed kinds compare their delays from now.
    pub fn is_before<C: Clock + ?Sized>(&self, other: &Timestamp, clock: &C) -> bool {
        match (*self, *other) {
            (Timestamp::HighPrecision(a), Timestamp::HighPrecision(b))
            | (Timestamp::Coarse(a), Timestamp::Coarse(b)) => wrapping_before(a, b),
            _ => self.delay_from_now_us(clock) < other.delay_from_now_us(clock),
        }
    }
}
