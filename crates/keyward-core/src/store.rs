//! Persistent allowance store.
//!
//! One enabled session per [`AllowanceKind`], persisted as a flat JSON object:
//!
//! ```json
//! { "token": { "session": { ... }, "enabled_at": "..." }, "time": {}, "eth": {} }
//! ```
//!
//! Every mutation is flushed through a temp file and an atomic rename. A file
//! that cannot be read or parsed is logged and replaced by an empty store
//! instead of failing startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{KeywardError, KeywardResult};
use crate::policy::AllowanceKind;
use crate::session::SessionDescriptor;

/// Persisted entry for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceRecord {
    /// Enabled descriptor, including its enablement proof.
    pub session: SessionDescriptor,

    /// When the enablement was recorded.
    pub enabled_at: DateTime<Utc>,

    /// Operation that carried the enablement on-chain, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_hash: Option<B256>,
}

impl AllowanceRecord {
    pub fn new(session: SessionDescriptor) -> Self {
        Self {
            session,
            enabled_at: Utc::now(),
            op_hash: None,
        }
    }

    pub fn with_op_hash(mut self, op_hash: B256) -> Self {
        self.op_hash = Some(op_hash);
        self
    }
}

/// On-disk layout: every kind is present, inactive kinds are `{}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowanceFile {
    #[serde(default)]
    token: Slot,
    #[serde(default)]
    time: Slot,
    #[serde(default)]
    eth: Slot,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Slot {
    Active(Box<AllowanceRecord>),
    Empty(EmptySlot),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptySlot {}

impl Default for Slot {
    fn default() -> Self {
        Self::Empty(EmptySlot {})
    }
}

impl Slot {
    fn into_record(self) -> Option<AllowanceRecord> {
        match self {
            Self::Active(record) => Some(*record),
            Self::Empty(_) => None,
        }
    }

    fn from_record(record: Option<&AllowanceRecord>) -> Self {
        match record {
            Some(record) => Self::Active(Box::new(record.clone())),
            None => Self::default(),
        }
    }
}

impl AllowanceFile {
    fn into_map(self) -> BTreeMap<AllowanceKind, AllowanceRecord> {
        [
            (AllowanceKind::Token, self.token),
            (AllowanceKind::Time, self.time),
            (AllowanceKind::Eth, self.eth),
        ]
        .into_iter()
        .filter_map(|(kind, slot)| slot.into_record().map(|r| (kind, r)))
        .collect()
    }

    fn from_map(map: &BTreeMap<AllowanceKind, AllowanceRecord>) -> Self {
        Self {
            token: Slot::from_record(map.get(&AllowanceKind::Token)),
            time: Slot::from_record(map.get(&AllowanceKind::Time)),
            eth: Slot::from_record(map.get(&AllowanceKind::Eth)),
        }
    }
}

/// Handle to the allowance store. Clones share state.
///
/// No cross-process locking: two processes enabling the same kind can
/// interleave, and the last flush wins.
#[derive(Debug, Clone)]
pub struct AllowanceStore {
    path: PathBuf,
    inner: Arc<RwLock<BTreeMap<AllowanceKind, AllowanceRecord>>>,
}

impl AllowanceStore {
    /// Load the store at `path`, degrading to empty on any read or parse failure.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match load(&path).await {
            Ok(records) => {
                debug!(path = %path.display(), count = records.len(), "loaded allowances");
                records
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "allowance store unreadable, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            path,
            inner: Arc::new(RwLock::new(records)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Active record for `kind`.
    pub async fn get(&self, kind: AllowanceKind) -> Option<AllowanceRecord> {
        self.inner.read().await.get(&kind).cloned()
    }

    /// Replace the record for `kind` and flush.
    ///
    /// The in-memory state is updated even when the flush fails; the error is
    /// returned so the caller can report the record as unpersisted.
    pub async fn put(&self, kind: AllowanceKind, record: AllowanceRecord) -> KeywardResult<()> {
        if let Some(session_kind) = record.session.kind() {
            if session_kind != kind {
                return Err(KeywardError::StoreIo {
                    message: format!("record for '{session_kind}' cannot be stored under '{kind}'"),
                });
            }
        }

        let mut records = self.inner.write().await;
        records.insert(kind, record);
        flush(&self.path, &records).await?;

        info!(kind = %kind, path = %self.path.display(), "allowance recorded");
        Ok(())
    }

    /// Copy of every active record.
    pub async fn snapshot(&self) -> BTreeMap<AllowanceKind, AllowanceRecord> {
        self.inner.read().await.clone()
    }

    /// The store as it is persisted, for display.
    pub async fn to_json(&self) -> KeywardResult<String> {
        let records = self.inner.read().await;
        serde_json::to_string_pretty(&AllowanceFile::from_map(&records)).map_err(|e| {
            KeywardError::StoreIo {
                message: format!("failed to serialize allowances: {e}"),
            }
        })
    }
}

async fn load(path: &Path) -> KeywardResult<BTreeMap<AllowanceKind, AllowanceRecord>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(KeywardError::StoreIo {
                message: format!("failed to read allowances: {e}"),
            })
        }
    };

    let file: AllowanceFile =
        serde_json::from_str(&content).map_err(|e| KeywardError::StoreIo {
            message: format!("failed to parse allowances: {e}"),
        })?;
    Ok(file.into_map())
}

async fn flush(path: &Path, records: &BTreeMap<AllowanceKind, AllowanceRecord>) -> KeywardResult<()> {
    let content = serde_json::to_string_pretty(&AllowanceFile::from_map(records)).map_err(|e| {
        KeywardError::StoreIo {
            message: format!("failed to serialize allowances: {e}"),
        }
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| KeywardError::StoreIo {
                message: format!("failed to create store directory: {e}"),
            })?;
    }

    write_atomic(path, &content).await
}

async fn write_atomic(path: &Path, content: &str) -> KeywardResult<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .await
        .map_err(|e| KeywardError::StoreIo {
            message: format!("failed to write temp file: {e}"),
        })?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| KeywardError::StoreIo {
            message: format!("failed to rename temp file: {e}"),
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyKind;
    use alloy_primitives::{Address, U256};
    use tempfile::TempDir;

    fn descriptor(policy: PolicyKind) -> SessionDescriptor {
        SessionDescriptor {
            session_signer: Address::repeat_byte(1),
            policies: vec![policy],
            target_actions: Vec::new(),
            salt: B256::repeat_byte(7),
            chain_id: 84532,
            allow_paymaster: false,
            enablement: None,
        }
    }

    fn window(until: u64) -> PolicyKind {
        PolicyKind::TimeWindow {
            valid_after: 0,
            valid_until: until,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = AllowanceStore::open(dir.path().join("allowances.json")).await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites_same_kind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allowances.json");
        let store = AllowanceStore::open(&path).await;

        store
            .put(AllowanceKind::Time, AllowanceRecord::new(descriptor(window(1))))
            .await
            .unwrap();
        store
            .put(AllowanceKind::Time, AllowanceRecord::new(descriptor(window(2))))
            .await
            .unwrap();

        let reloaded = AllowanceStore::open(&path).await;
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[&AllowanceKind::Time].session.policies,
            vec![window(2)]
        );
    }

    #[tokio::test]
    async fn test_large_amount_roundtrips_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allowances.json");
        let limit = U256::from(1_u64 << 53) + U256::from(1_u64);
        let huge = U256::MAX - U256::from(12_345_u64);

        let store = AllowanceStore::open(&path).await;
        store
            .put(
                AllowanceKind::Eth,
                AllowanceRecord::new(descriptor(PolicyKind::ValueLimit {
                    limit,
                    target: None,
                })),
            )
            .await
            .unwrap();
        store
            .put(
                AllowanceKind::Token,
                AllowanceRecord::new(descriptor(PolicyKind::SpendLimit {
                    token: Address::repeat_byte(5),
                    limit: huge,
                })),
            )
            .await
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"9007199254740993\""), "{raw}");

        let reloaded = AllowanceStore::open(&path).await;
        let eth = reloaded.get(AllowanceKind::Eth).await.unwrap();
        assert_eq!(
            eth.session.policies[0],
            PolicyKind::ValueLimit {
                limit,
                target: None
            }
        );
        let token = reloaded.get(AllowanceKind::Token).await.unwrap();
        assert_eq!(
            token.session.policies[0],
            PolicyKind::SpendLimit {
                token: Address::repeat_byte(5),
                limit: huge
            }
        );
    }

    #[tokio::test]
    async fn test_file_layout_has_all_kinds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allowances.json");
        let store = AllowanceStore::open(&path).await;
        store
            .put(AllowanceKind::Time, AllowanceRecord::new(descriptor(window(9))))
            .await
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["token"], serde_json::json!({}));
        assert_eq!(value["eth"], serde_json::json!({}));
        assert!(value["time"]["session"].is_object());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allowances.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = AllowanceStore::open(&path).await;
        assert!(store.snapshot().await.is_empty());

        // Still writable afterwards.
        store
            .put(AllowanceKind::Time, AllowanceRecord::new(descriptor(window(1))))
            .await
            .unwrap();
        assert!(AllowanceStore::open(&path)
            .await
            .get(AllowanceKind::Time)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_legacy_empty_layout_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allowances.json");
        std::fs::write(&path, r#"{"token":{},"time":{},"eth":{}}"#).unwrap();

        let store = AllowanceStore::open(&path).await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = AllowanceStore::open(dir.path().join("a.json")).await;
        let err = store
            .put(AllowanceKind::Eth, AllowanceRecord::new(descriptor(window(1))))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "store_io");
        assert!(store.get(AllowanceKind::Eth).await.is_none());
    }
}
