//! JSON-file tracking store

use crate::error::{MarketError, MarketResult};
use crate::pricing::unix_now;

use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// What we believe about one owned asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalRecord {
    pub price: u64,
    /// Empty until the owning collection has been resolved
    #[serde(default)]
    pub collection_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_id: Option<u64>,
    #[serde(
        default,
        rename = "correlationToken",
        alias = "bundleUUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub bundle_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listed_at: Option<u64>,
}

impl RentalRecord {
    pub fn new(collection: Address, price: u64) -> Self {
        Self {
            price,
            collection_address: to_checksum(&collection, None),
            loan_id: None,
            bundle_uuid: None,
            listed_at: None,
        }
    }

    /// Legacy entries only carried a price
    pub fn from_price(price: u64) -> Self {
        Self {
            price,
            collection_address: String::new(),
            loan_id: None,
            bundle_uuid: None,
            listed_at: None,
        }
    }

    /// Recorded collection, `None` while unknown or unparseable
    pub fn collection(&self) -> Option<Address> {
        let value = self.collection_address.trim();
        if value.is_empty() {
            return None;
        }
        Address::from_str(value).ok()
    }

    pub fn set_collection(&mut self, collection: Address) {
        self.collection_address = to_checksum(&collection, None);
    }

    pub fn has_active_loan(&self) -> bool {
        self.loan_id.is_some()
    }

    /// Record a confirmed listing
    pub fn mark_listed(&mut self, loan_id: u64, bundle_uuid: String, listed_at: u64) {
        self.loan_id = Some(loan_id);
        self.bundle_uuid = Some(bundle_uuid);
        self.listed_at = Some(listed_at);
    }

    /// Forget the loan reference; price and listing history stay
    pub fn clear_loan(&mut self) {
        self.loan_id = None;
        self.bundle_uuid = None;
    }
}

/// Shapes a stored value may take
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Legacy(u64),
    Current(RentalRecord),
}

impl StoredEntry {
    fn into_record(self) -> RentalRecord {
        match self {
            StoredEntry::Legacy(price) => RentalRecord::from_price(price),
            StoredEntry::Current(record) => record,
        }
    }
}

/// The tokenId -> RentalRecord mapping for one wallet
#[derive(Debug, Clone)]
pub struct TrackingStore {
    path: PathBuf,
    records: BTreeMap<u64, RentalRecord>,
    /// Entries we could not decode, written back untouched
    foreign: BTreeMap<String, Value>,
}

impl TrackingStore {
    /// An empty store that will persist to `path`
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
            foreign: BTreeMap::new(),
        }
    }

    /// Load the store; a missing file is an empty store
    pub fn load(path: impl AsRef<Path>) -> MarketResult<Self> {
        let path = path.as_ref();
        let mut store = Self::empty(path);

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No tracking store at {:?}; starting empty", path);
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        let root: Value = serde_json::from_str(&contents)?;
        let entries = match root {
            Value::Object(entries) => entries,
            other => {
                return Err(MarketError::Store(format!(
                    "{:?} must hold a JSON object, found {}",
                    path,
                    json_kind(&other)
                )))
            }
        };

        let now = unix_now();
        for (key, value) in entries {
            let token_id = match key.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    warn!("Preserving tracking entry with non-numeric key {:?}", key);
                    store.foreign.insert(key, value);
                    continue;
                }
            };

            match serde_json::from_value::<StoredEntry>(value.clone()) {
                Ok(entry) => {
                    let mut record = entry.into_record();
                    if record.loan_id.is_some() && record.listed_at.is_none() {
                        warn!(
                            "Token {} tracks loan {:?} without a listing time; assuming now",
                            token_id, record.loan_id
                        );
                        record.listed_at = Some(now);
                    }
                    store.records.insert(token_id, record);
                }
                Err(e) => {
                    warn!("Preserving unrecognized tracking entry {}: {}", key, e);
                    store.foreign.insert(key, value);
                }
            }
        }

        debug!(
            "Loaded {} tracked assets ({} foreign entries) from {:?}",
            store.records.len(),
            store.foreign.len(),
            path
        );
        Ok(store)
    }

    /// Replace the file on disk with the full in-memory mapping.
    ///
    /// Writes a sibling temp file and renames it over the old snapshot, so a
    /// crash mid-write leaves the previous snapshot intact.
    pub fn persist(&self) -> MarketResult<()> {
        let mut root = Map::new();
        for (key, value) in &self.foreign {
            root.insert(key.clone(), value.clone());
        }
        for (token_id, record) in &self.records {
            root.insert(token_id.to_string(), serde_json::to_value(record)?);
        }

        let body = serde_json::to_vec_pretty(&Value::Object(root))?;

        let mut tmp_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| MarketError::Store(format!("{:?} is not a file path", self.path)))?;
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        info!("Persisted {} tracked assets to {:?}", self.records.len(), self.path);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, token_id: u64) -> Option<&RentalRecord> {
        self.records.get(&token_id)
    }

    pub fn get_mut(&mut self, token_id: u64) -> Option<&mut RentalRecord> {
        self.records.get_mut(&token_id)
    }

    pub fn insert(&mut self, token_id: u64, record: RentalRecord) {
        self.records.insert(token_id, record);
    }

    /// Tracked token ids in ascending order
    pub fn token_ids(&self) -> Vec<u64> {
        self.records.keys().copied().collect()
    }

    /// Number of records believed to have a live listing
    pub fn listed_count(&self) -> usize {
        self.records.values().filter(|r| r.has_active_loan()).count()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    const COLLECTION: &str = "0x5aeda56215b167893e80b4fe645ba6d5bab767de";

    fn write(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = TrackingStore::load(dir.path().join("rentals.json")).unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_legacy_bare_price_is_normalized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rentals.json");
        write(&path, r#"{"12": 7}"#);

        let store = TrackingStore::load(&path).unwrap();
        let record = store.get(12).unwrap();
        assert_eq!(record, &RentalRecord::from_price(7));
        assert!(record.collection().is_none());
    }

    #[test]
    fn test_current_record_and_alias() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rentals.json");
        write(
            &path,
            &format!(
                r#"{{"42": {{"price": 5, "collectionAddress": "{}", "loanId": 7, "bundleUUID": "abc", "listedAt": 1700000000}}}}"#,
                COLLECTION
            ),
        );

        let store = TrackingStore::load(&path).unwrap();
        let record = store.get(42).unwrap();
        assert_eq!(record.loan_id, Some(7));
        assert_eq!(record.bundle_uuid.as_deref(), Some("abc"));
        assert_eq!(record.listed_at, Some(1_700_000_000));
        assert_eq!(record.collection(), Some(Address::from_str(COLLECTION).unwrap()));
    }

    #[test]
    fn test_loan_without_listing_time_gets_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rentals.json");
        write(&path, r#"{"3": {"price": 9, "loanId": 4}}"#);

        let store = TrackingStore::load(&path).unwrap();
        assert!(store.get(3).unwrap().listed_at.is_some());
    }

    #[test]
    fn test_unrecognized_entries_survive_a_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rentals.json");
        write(
            &path,
            r#"{"1": 5, "2": "not-a-record", "meta": {"version": 2}}"#,
        );

        let mut store = TrackingStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        store.get_mut(1).unwrap().price = 6;
        assert_ok!(store.persist());

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["2"], Value::String("not-a-record".to_string()));
        assert_eq!(written["meta"]["version"], 2);
        assert_eq!(written["1"]["price"], 6);
        assert_eq!(written["1"]["collectionAddress"], "");
        assert!(written["1"].get("loanId").is_none());
    }

    #[test]
    fn test_persist_roundtrip_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rentals.json");

        let mut store = TrackingStore::empty(&path);
        let mut record = RentalRecord::new(Address::from_str(COLLECTION).unwrap(), 10);
        record.mark_listed(8, "uuid".to_string(), 1_700_000_000);
        store.insert(100, record.clone());
        assert_ok!(store.persist());

        let reloaded = TrackingStore::load(&path).unwrap();
        assert_eq!(reloaded.get(100), Some(&record));
        assert!(!dir.path().join("rentals.json.tmp").exists());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("correlationToken"));
    }

    #[test]
    fn test_non_object_root_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rentals.json");
        write(&path, "[1, 2, 3]");
        assert!(matches!(TrackingStore::load(&path), Err(MarketError::Store(_))));
    }
}
