//! Shared fixtures for the keystore integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use wardkey_crypto_core::PinHashParams;
use wardkey_keystore::{
    KeystoreConfig, ManualClock, MemorySink, MemoryStore, SecureStore, SecurityCore,
    StorageError,
};

/// Argon2id parameters small enough for tests.
pub const TEST_PIN_HASH: PinHashParams = PinHashParams {
    m_cost: 32,
    t_cost: 1,
    p_cost: 1,
};

/// 2024-01-01T00:00:00Z.
pub fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_067_200, 0).unwrap()
}

pub fn test_config() -> KeystoreConfig {
    KeystoreConfig {
        pin_hash: TEST_PIN_HASH,
        ..KeystoreConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Fault-injecting store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Faults {
    failed_writes: HashMap<String, usize>,
    failed_reads: HashMap<String, usize>,
    corrupted_writes: HashMap<String, usize>,
}

/// Consume one fault armed for a prefix of `key`.
fn trip(faults: &mut HashMap<String, usize>, key: &str) -> bool {
    let Some(remaining) = faults
        .iter_mut()
        .find(|(prefix, remaining)| key.starts_with(prefix.as_str()) && **remaining > 0)
        .map(|(_, remaining)| remaining)
    else {
        return false;
    };
    *remaining -= 1;
    true
}

/// A [`MemoryStore`] that fails or corrupts selected operations on demand.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes to keys starting with `prefix`.
    pub fn fail_writes(&self, prefix: &str, times: usize) {
        self.faults
            .lock()
            .failed_writes
            .insert(prefix.to_owned(), times);
    }

    /// Fail the next `times` reads of keys starting with `prefix`.
    pub fn fail_reads(&self, prefix: &str, times: usize) {
        self.faults.lock().failed_reads.insert(prefix.to_owned(), times);
    }

    /// Store garbage instead of the next `times` values written under `prefix`.
    pub fn corrupt_writes(&self, prefix: &str, times: usize) {
        self.faults
            .lock()
            .corrupted_writes
            .insert(prefix.to_owned(), times);
    }

    /// Disarm every fault.
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.read(key).await.unwrap()
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.inner.write(key, value).await.unwrap();
    }

    pub async fn remove(&self, key: &str) {
        self.inner.delete(key).await.unwrap();
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }
}

#[async_trait]
impl SecureStore for FaultyStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        if trip(&mut self.faults.lock().failed_reads, key) {
            return Err(StorageError::Unavailable(format!("injected read failure: {key}")));
        }
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let (fail, corrupt) = {
            let mut faults = self.faults.lock();
            let fail = trip(&mut faults.failed_writes, key);
            (fail, !fail && trip(&mut faults.corrupted_writes, key))
        };
        if fail {
            return Err(StorageError::Unavailable(format!("injected write failure: {key}")));
        }
        let value = if corrupt { "%%corrupt%%" } else { value };
        self.inner.write(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError> {
        self.inner.read_all().await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub core: SecurityCore,
    pub store: Arc<FaultyStore>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<MemorySink>,
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: KeystoreConfig) -> Harness {
    let store = Arc::new(FaultyStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let sink = Arc::new(MemorySink::new());
    let core = SecurityCore::new(store.clone(), config, clock.clone(), sink.clone()).unwrap();
    Harness {
        core,
        store,
        clock,
        sink,
    }
}

/// Replace the character at byte `index` with a different ASCII character.
pub fn flip_char(value: &str, index: usize) -> String {
    let mut bytes = value.as_bytes().to_vec();
    bytes[index] = if bytes[index] == b'A' { b'B' } else { b'A' };
    String::from_utf8(bytes).unwrap()
}
