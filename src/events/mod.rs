//! Lending contract event decoding
//!
//! A successful `createLoan` receipt is not proof that a listing exists; the
//! new loan id is only known from the `LoanCreated` log. Decoding is a typed
//! filter over the receipt's logs and a missing event is an ordinary `None`.

use crate::chain::LendingContract;
use crate::error::{MarketError, MarketResult};

use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, Log, TransactionReceipt, H256};
use tracing::{debug, warn};

/// Decoded `LoanCreated` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingCreated {
    pub loan_id: u64,
    pub owner: Address,
    pub bundle_uuid: String,
    pub tx_hash: H256,
    pub block_number: u64,
}

/// Event parser for the lending contract
pub struct EventParser {
    contract_address: Address,
    event: &'static Event,
}

impl EventParser {
    /// Create a new event parser
    pub fn new(lending: &LendingContract) -> MarketResult<Self> {
        Ok(Self {
            contract_address: lending.address(),
            event: lending.loan_created_event()?,
        })
    }

    /// Topic hash of `LoanCreated`
    pub fn topic(&self) -> H256 {
        self.event.signature()
    }

    /// Parse a log entry; `Ok(None)` when it is not a `LoanCreated` from our contract
    pub fn parse_log(&self, log: &Log) -> MarketResult<Option<ListingCreated>> {
        if log.address != self.contract_address || log.topics.first() != Some(&self.topic()) {
            return Ok(None);
        }

        let parsed = self
            .event
            .parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| MarketError::EventParsing(e.to_string()))?;

        let mut loan_id = None;
        let mut owner = None;
        let mut bundle_uuid = None;
        for param in parsed.params {
            match (param.name.as_str(), param.value) {
                ("loanId", Token::Uint(value)) => loan_id = Some(value),
                ("owner", Token::Address(value)) => owner = Some(value),
                ("bundleUUID", Token::String(value)) => bundle_uuid = Some(value),
                _ => {}
            }
        }

        let loan_id = loan_id
            .ok_or_else(|| MarketError::EventParsing("LoanCreated without loanId".to_string()))?;
        if loan_id.bits() > 64 {
            return Err(MarketError::EventParsing(format!(
                "Loan id {} out of range",
                loan_id
            )));
        }

        Ok(Some(ListingCreated {
            loan_id: loan_id.as_u64(),
            owner: owner.unwrap_or_default(),
            bundle_uuid: bundle_uuid.unwrap_or_default(),
            tx_hash: log.transaction_hash.unwrap_or_default(),
            block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(0),
        }))
    }

    /// First `LoanCreated` emitted in `receipt`.
    ///
    /// Logs that fail to decode are skipped. A correlation token mismatch is
    /// logged but still accepted: the receipt belongs to our own transaction.
    pub fn find_listing_created(
        &self,
        receipt: &TransactionReceipt,
        bundle_uuid: &str,
    ) -> Option<ListingCreated> {
        for log in &receipt.logs {
            match self.parse_log(log) {
                Ok(Some(event)) => {
                    if event.bundle_uuid != bundle_uuid {
                        warn!(
                            "LoanCreated {} carries token {:?}, expected {:?}",
                            event.loan_id, event.bundle_uuid, bundle_uuid
                        );
                    }
                    return Some(event);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!("Skipping undecodable log in {:?}: {}", receipt.transaction_hash, e);
                }
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::abi::encode;
    use ethers::types::Bytes;

    pub(crate) fn lending() -> LendingContract {
        LendingContract::new(Address::from_low_u64_be(0xbeef))
    }

    /// A `LoanCreated` log as the lending contract would emit it
    pub(crate) fn loan_created_log(lending: &LendingContract, loan_id: u64, uuid: &str) -> Log {
        let parser = EventParser::new(lending).unwrap();
        let mut owner_topic = H256::zero();
        owner_topic.0[12..].copy_from_slice(Address::from_low_u64_be(0xa11ce).as_bytes());

        Log {
            address: lending.address(),
            topics: vec![
                parser.topic(),
                H256::from_low_u64_be(loan_id),
                owner_topic,
            ],
            data: Bytes::from(encode(&[Token::String(uuid.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_loan_created() {
        let lending = lending();
        let parser = EventParser::new(&lending).unwrap();
        let log = loan_created_log(&lending, 77, "uuid-1");

        let event = parser.parse_log(&log).unwrap().unwrap();
        assert_eq!(event.loan_id, 77);
        assert_eq!(event.bundle_uuid, "uuid-1");
        assert_eq!(event.owner, Address::from_low_u64_be(0xa11ce));
    }

    #[test]
    fn test_ignores_foreign_logs() {
        let lending = lending();
        let parser = EventParser::new(&lending).unwrap();

        let mut other_contract = loan_created_log(&lending, 1, "x");
        other_contract.address = Address::from_low_u64_be(1);
        assert!(parser.parse_log(&other_contract).unwrap().is_none());

        let mut other_event = loan_created_log(&lending, 1, "x");
        other_event.topics[0] = H256::from_low_u64_be(0xdead);
        assert!(parser.parse_log(&other_event).unwrap().is_none());
    }

    #[test]
    fn test_find_listing_created_in_receipt() {
        let lending = lending();
        let parser = EventParser::new(&lending).unwrap();

        let mut unrelated = loan_created_log(&lending, 1, "x");
        unrelated.address = Address::from_low_u64_be(1);
        let receipt = TransactionReceipt {
            logs: vec![unrelated, loan_created_log(&lending, 12, "mine")],
            ..Default::default()
        };
        let found = parser.find_listing_created(&receipt, "mine").unwrap();
        assert_eq!(found.loan_id, 12);

        let empty = TransactionReceipt::default();
        assert!(parser.find_listing_created(&empty, "mine").is_none());
    }
}
