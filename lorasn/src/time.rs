//! Time and low-power seams used by the cooperative control loops.
use embedded_hal::blocking::delay::DelayMs;
use std::time::Instant;

/// Longest single low-power wait when no timer is armed, in milliseconds.
pub const IDLE_POLL_MS: u32 = 10;

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;

    fn elapsed_since(&self, instant_ms: u64) -> u64 {
        self.now_ms().saturating_sub(instant_ms)
    }
}

/// Clock backed by [Instant], counting from its creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// "Enter low power and wait for the next event" capability.
///
/// Implementations may return early (an interrupt fired) but should not sleep longer than
/// `max_ms`, which is the distance to the next armed timer.
pub trait LowPower {
    fn wait_for_event(&mut self, max_ms: u32);
}

/// [LowPower] implementation for any blocking `embedded-hal` delay provider.
pub struct DelaySleeper<D> {
    delay: D,
}

impl<D: DelayMs<u32>> DelaySleeper<D> {
    pub fn new(delay: D) -> Self {
        Self { delay }
    }

    pub fn into_inner(self) -> D {
        self.delay
    }
}

impl<D: DelayMs<u32>> LowPower for DelaySleeper<D> {
    fn wait_for_event(&mut self, max_ms: u32) {
        self.delay.delay_ms(max_ms.min(IDLE_POLL_MS));
    }
}

/// Sleeps the calling thread, for hosts without a HAL delay provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl LowPower for ThreadSleeper {
    fn wait_for_event(&mut self, max_ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(max_ms.min(IDLE_POLL_MS) as u64));
    }
}
