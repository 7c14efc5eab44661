//! Call encoding and output decoding for the lending and collection contracts

use crate::error::{MarketError, MarketResult};

use ethers::abi::{parse_abi, Event};
use ethers::contract::BaseContract;
use ethers::types::{Address, Bytes, U256};
use lazy_static::lazy_static;

/// Rewards are not shared with the borrower
pub const REWARD_PERCENTAGE: u8 = 0;
/// Every listing runs for seven days
pub const LISTING_DURATION_SECS: u64 = 7 * 86_400;
/// Reward routing mode expected by the lending contract
pub const REWARD_MODE: u8 = 1;

pub const LOAN_CREATED_EVENT: &str = "LoanCreated";

const LENDING_ABI: &[&str] = &[
    "function getLoan(uint256 loanId) external view returns (address, address, uint256, uint256, uint256, string, bool)",
    "function isBundled(address nftAddress, uint256 tokenId) external view returns (bool)",
    "function createLoan(address[] nftAddresses, uint256[] tokenIds, uint256 upfrontFee, uint8 rewardPercentage, uint256 duration, address reservedTo, uint8 rewardMode, string bundleUUID) external",
    "function cancelLoan(uint256 loanId) external",
    "event LoanCreated(uint256 indexed loanId, address indexed owner, string bundleUUID)",
];

const COLLECTION_ABI: &[&str] = &[
    "function ownerOf(uint256 tokenId) external view returns (address)",
    "function balanceOf(address owner) external view returns (uint256)",
    "function tokenOfOwnerByIndex(address owner, uint256 index) external view returns (uint256)",
];

lazy_static! {
    static ref LENDING: BaseContract = BaseContract::from(parse_abi(LENDING_ABI).unwrap());
    static ref COLLECTION: BaseContract = BaseContract::from(parse_abi(COLLECTION_ABI).unwrap());
}

/// A contract call ready to be estimated and sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub to: Address,
    pub data: Bytes,
}

/// Raw `getLoan` output
pub type LoanTuple = (Address, Address, U256, U256, U256, String, bool);

fn encode_err(e: impl std::fmt::Display) -> MarketError {
    MarketError::Contract(format!("ABI encoding failed: {}", e))
}

fn decode_err(e: impl std::fmt::Display) -> MarketError {
    MarketError::Contract(format!("ABI decoding failed: {}", e))
}

/// Bindings for the rental lending contract
#[derive(Debug, Clone, Copy)]
pub struct LendingContract {
    address: Address,
}

impl LendingContract {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn get_loan(&self, loan_id: u64) -> MarketResult<ContractCall> {
        self.call("getLoan", U256::from(loan_id))
    }

    pub fn decode_loan(&self, output: &[u8]) -> MarketResult<LoanTuple> {
        LENDING.decode_output("getLoan", output).map_err(decode_err)
    }

    pub fn is_bundled(&self, collection: Address, token_id: u64) -> MarketResult<ContractCall> {
        self.call("isBundled", (collection, U256::from(token_id)))
    }

    pub fn decode_is_bundled(&self, output: &[u8]) -> MarketResult<bool> {
        LENDING.decode_output("isBundled", output).map_err(decode_err)
    }

    /// `createLoan` with the fixed listing terms and the given correlation token
    pub fn create_loan(
        &self,
        collections: &[Address],
        token_ids: &[u64],
        upfront_fee: U256,
        bundle_uuid: &str,
    ) -> MarketResult<ContractCall> {
        let token_ids: Vec<U256> = token_ids.iter().map(|id| U256::from(*id)).collect();
        self.call(
            "createLoan",
            (
                collections.to_vec(),
                token_ids,
                upfront_fee,
                U256::from(REWARD_PERCENTAGE),
                U256::from(LISTING_DURATION_SECS),
                Address::zero(),
                U256::from(REWARD_MODE),
                bundle_uuid.to_string(),
            ),
        )
    }

    pub fn cancel_loan(&self, loan_id: u64) -> MarketResult<ContractCall> {
        self.call("cancelLoan", U256::from(loan_id))
    }

    /// ABI definition of the listing-created event
    pub fn loan_created_event(&self) -> MarketResult<&'static Event> {
        LENDING
            .abi()
            .event(LOAN_CREATED_EVENT)
            .map_err(|e| MarketError::EventParsing(e.to_string()))
    }

    fn call<T: ethers::abi::Tokenize>(&self, function: &str, args: T) -> MarketResult<ContractCall> {
        let data = LENDING.encode(function, args).map_err(encode_err)?;
        Ok(ContractCall {
            to: self.address,
            data,
        })
    }
}

/// Bindings for an enumerable ERC-721 collection
#[derive(Debug, Clone, Copy)]
pub struct CollectionContract {
    address: Address,
}

impl CollectionContract {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn owner_of(&self, token_id: u64) -> MarketResult<ContractCall> {
        self.call("ownerOf", U256::from(token_id))
    }

    pub fn decode_owner(&self, output: &[u8]) -> MarketResult<Address> {
        COLLECTION.decode_output("ownerOf", output).map_err(decode_err)
    }

    pub fn balance_of(&self, owner: Address) -> MarketResult<ContractCall> {
        self.call("balanceOf", owner)
    }

    pub fn token_of_owner_by_index(&self, owner: Address, index: u64) -> MarketResult<ContractCall> {
        self.call("tokenOfOwnerByIndex", (owner, U256::from(index)))
    }

    pub fn decode_uint(&self, function: &str, output: &[u8]) -> MarketResult<U256> {
        COLLECTION.decode_output(function, output).map_err(decode_err)
    }

    fn call<T: ethers::abi::Tokenize>(&self, function: &str, args: T) -> MarketResult<ContractCall> {
        let data = COLLECTION.encode(function, args).map_err(encode_err)?;
        Ok(ContractCall {
            to: self.address,
            data,
        })
    }
}

/// Scale a whole-unit price into the ledger's fixed-point unit
pub fn scale_price(price: u64, decimals: u32) -> U256 {
    U256::from(price) * U256::exp10(decimals as usize)
}
