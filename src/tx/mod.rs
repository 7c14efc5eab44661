//! Transaction submission: fee bidding, confirmation and retry

mod gas;
mod ledger;
mod sender;

pub use gas::GasEstimator;
pub use ledger::EthersLedger;
pub use sender::{CreatedListing, ListingSubmitter, TransactionSender};
