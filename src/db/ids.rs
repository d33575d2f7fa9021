//! Client-side document id generation.
//!
//! Ids are a fixed-width base-36 millisecond stamp followed by a short random
//! suffix. The stamp never repeats within one generator, so ids from the same
//! generator sort in creation order. The suffix keeps ids from different
//! devices apart when their clocks agree.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Width of the timestamp part (36^9 ms is several thousand years)
const STAMP_WIDTH: usize = 9;

/// Random characters appended after the stamp
const SUFFIX_LEN: usize = 4;

/// Monotonic id source owned by a store
#[derive(Debug, Default)]
pub struct IdGenerator {
    last_stamp: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> String {
        self.generate_at(Utc::now())
    }

    pub fn generate_at(&self, now: DateTime<Utc>) -> String {
        let millis = now.timestamp_millis().max(0);
        let stamp = match self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(millis.max(last + 1))
            }) {
            Ok(last) | Err(last) => millis.max(last + 1),
        };

        let mut id = to_base36(stamp, STAMP_WIDTH);
        let mut rng = rand::rng();
        for _ in 0..SUFFIX_LEN {
            id.push(BASE36[rng.random_range(0..36)] as char);
        }
        id
    }
}

fn to_base36(mut value: i64, width: usize) -> String {
    let mut digits = Vec::with_capacity(width);
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}
