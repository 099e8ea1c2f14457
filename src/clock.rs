//! Concrete `Clock`/`RandomSource` implementations backing the binaries.
//! Kept tiny and dependency-obvious on purpose: tests should reach for a
//! fake instead of these.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::ports::{Clock, RandomSource};

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_millis() as u64
    }
}

#[derive(Debug, Default)]
pub struct ThreadRngRandom;

impl RandomSource for ThreadRngRandom {
    fn gen_range_ms(&self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}
