//! Fuzz target: `UpgradeJournal`
//!
//! Seeds the journal file with arbitrary bytes (a torn write or flash
//! corruption) and then appends records. Checks that:
//! - reading a corrupt blob never panics
//! - the journal never holds more than `JOURNAL_SLOTS` records
//! - after `clear` it reads empty
//!
//! cargo fuzz run fuzz_upgrade_journal

#![no_main]

use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;
use vgstack::app::events::UpgradeTarget;
use vgstack::app::ports::{StorageError, StoragePort};
use vgstack::diagnostics::{JOURNAL_SLOTS, Outcome, UpgradeJournal, UpgradeRecord};

// ── In-memory StoragePort ─────────────────────────────────────

#[derive(Default)]
struct MemStore(HashMap<String, Vec<u8>>);

impl StoragePort for MemStore {
    fn append(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.0.entry(path.to_owned()).or_default().extend_from_slice(data);
        Ok(())
    }
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.0.insert(path.to_owned(), data.to_vec());
        Ok(())
    }
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.0.get(path).cloned().ok_or(StorageError::NotFound)
    }
    fn digest(&self, _path: &str) -> Result<[u8; 16], StorageError> {
        Err(StorageError::IoError)
    }
    fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.read(path).map(|d| d.len() as u64)
    }
    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.0.remove(path);
        Ok(())
    }
    fn exists(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }
}

const PATH: &str = "/fuzz/journal.bin";

fuzz_target!(|data: &[u8]| {
    let Some((&writes, seed)) = data.split_first() else {
        return;
    };

    let mut store = MemStore::default();
    store.0.insert(PATH.to_owned(), seed.to_vec());
    let journal = UpgradeJournal::new(PATH);
    assert!(journal.read_all(&store).len() <= JOURNAL_SLOTS);

    let detail = String::from_utf8_lossy(seed);
    for i in 0..(writes % 8) {
        let outcome = match i % 3 {
            0 => Outcome::Installed,
            1 => Outcome::Failed,
            _ => Outcome::Interrupted,
        };
        let record = UpgradeRecord::new(i as u64, UpgradeTarget::Firmware, outcome, &detail);
        journal.record(&mut store, record);
        assert!(journal.count(&store) <= JOURNAL_SLOTS);
    }

    journal.clear(&mut store);
    assert_eq!(journal.count(&store), 0);
});
