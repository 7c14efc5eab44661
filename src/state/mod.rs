//! Local record of what we believe is listed
//!
//! Handles:
//! - Decoding current and legacy store shapes into `RentalRecord`
//! - Preserving entries it does not understand
//! - Atomic replacement of the persisted snapshot

mod store;

pub use store::{RentalRecord, TrackingStore};
