//! Price adjustment rules
//!
//! Everything here is a pure function of its arguments. The current time is
//! always passed in, never read, so the rules can be exercised without a clock.

const SECS_PER_DAY: u64 = 86_400;
const SECS_PER_MINUTE: u64 = 60;

/// Current wall-clock time in unix seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Rental price policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingPolicy {
    /// Prices at or below the floor are never discounted
    floor: u64,
    stale_after_secs: u64,
    quick_rental_secs: u64,
}

impl PricingPolicy {
    pub fn new(floor: u64, stale_after_days: u64, quick_rental_minutes: u64) -> Self {
        Self {
            floor,
            stale_after_secs: stale_after_days.saturating_mul(SECS_PER_DAY),
            quick_rental_secs: quick_rental_minutes.saturating_mul(SECS_PER_MINUTE),
        }
    }

    pub fn is_expired(&self, end_time: u64, now: u64) -> bool {
        now > end_time
    }

    /// A listing is stale once it has been up longer than the configured age
    pub fn is_stale_listing(&self, listed_at: u64, now: u64) -> bool {
        now.saturating_sub(listed_at) > self.stale_after_secs
    }

    /// Whether a loan was taken within the quick-rental window after listing.
    ///
    /// Undefined (false) when the listing time is unknown, the loan never
    /// started, or it started before the recorded listing time.
    pub fn was_rented_quickly(&self, listed_at: Option<u64>, starting_time: u64) -> bool {
        match listed_at {
            Some(listed_at) if starting_time > 0 && starting_time >= listed_at => {
                starting_time - listed_at < self.quick_rental_secs
            }
            _ => false,
        }
    }

    /// `ceil(price * 1.1)`
    pub fn increase(&self, price: u64) -> u64 {
        price.saturating_mul(11).saturating_add(9) / 10
    }

    pub fn can_decrease(&self, price: u64) -> bool {
        price > self.floor
    }

    /// `floor(price * 0.9)`, never below the floor and only above it
    pub fn decrease(&self, price: u64) -> u64 {
        if !self.can_decrease(price) {
            return price;
        }
        (price.saturating_mul(9) / 10).max(self.floor)
    }
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self::new(3, 3, 180)
    }
}
