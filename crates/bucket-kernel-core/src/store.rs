use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use crate::config::AssignerConfig;
use crate::Bucket;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable string-keyed storage. Every call may fail independently.
pub trait KeyValueStore {
    /// # Errors
    /// Returns an error when the backing store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Returns an error when the backing store rejects the write.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the backing store rejects the removal.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
}

/// In-process store used by tests and ephemeral callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<BTreeMap<String, String>>,
    failing: Cell<bool>,
    writes: Cell<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails with [`StoreError::Unavailable`].
    #[must_use]
    pub fn failing() -> Self {
        let store = Self::default();
        store.failing.set(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    /// Number of successful `set` calls.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.borrow().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.get() {
            return Err(StoreError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.borrow_mut().insert(key.to_string(), value.to_string());
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// The `assignment` and `manual-override` fields over a [`KeyValueStore`].
///
/// Store failures are logged and swallowed; reads degrade to absent/false.
#[derive(Debug)]
pub struct AssignmentStore<S> {
    kv: S,
    assignment_key: String,
    manual_override_key: String,
    manual_marker: String,
}

impl<S: KeyValueStore> AssignmentStore<S> {
    #[must_use]
    pub fn new(kv: S, config: &AssignerConfig) -> Self {
        Self {
            kv,
            assignment_key: config.assignment_key.clone(),
            manual_override_key: config.manual_override_key.clone(),
            manual_marker: config.manual_marker.clone(),
        }
    }

    #[must_use]
    pub fn get_saved(&self) -> Option<Bucket> {
        match self.kv.get(&self.assignment_key) {
            Ok(Some(raw)) => {
                let bucket = Bucket::parse(&raw);
                if bucket.is_none() {
                    tracing::warn!(
                        key = %self.assignment_key,
                        value = %raw,
                        "ignoring unrecognized saved bucket"
                    );
                }
                bucket
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    key = %self.assignment_key,
                    error = %err,
                    "failed to read saved bucket"
                );
                None
            }
        }
    }

    pub fn save(&self, bucket: Bucket) {
        if let Err(err) = self.kv.set(&self.assignment_key, bucket.as_str()) {
            tracing::warn!(
                key = %self.assignment_key,
                %bucket,
                error = %err,
                "failed to save bucket"
            );
        }
    }

    #[must_use]
    pub fn is_manual_override(&self) -> bool {
        match self.kv.get(&self.manual_override_key) {
            Ok(value) => value.as_deref() == Some(self.manual_marker.as_str()),
            Err(err) => {
                tracing::warn!(
                    key = %self.manual_override_key,
                    error = %err,
                    "failed to read manual override flag"
                );
                false
            }
        }
    }

    pub fn set_manual_override(&self, enabled: bool) {
        let result = if enabled {
            self.kv.set(&self.manual_override_key, &self.manual_marker)
        } else {
            self.kv.remove(&self.manual_override_key)
        };
        if let Err(err) = result {
            tracing::warn!(
                key = %self.manual_override_key,
                enabled,
                error = %err,
                "failed to update manual override flag"
            );
        }
    }

    pub fn clear(&self) {
        for key in [&self.assignment_key, &self.manual_override_key] {
            if let Err(err) = self.kv.remove(key) {
                tracing::warn!(key = %key, error = %err, "failed to clear assignment field");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(kv: &MemoryStore) -> AssignmentStore<&MemoryStore> {
        AssignmentStore::new(kv, &AssignerConfig::default())
    }

    // Test IDs: TSTORE-001
    #[test]
    fn save_and_read_back_bucket() {
        let kv = MemoryStore::new();
        let store = store(&kv);

        assert_eq!(store.get_saved(), None);
        store.save(Bucket::B);
        assert_eq!(store.get_saved(), Some(Bucket::B));
        assert_eq!(kv.snapshot().get("ab_bucket").map(String::as_str), Some("B"));
    }

    // Test IDs: TSTORE-002
    #[test]
    fn manual_override_requires_exact_marker() {
        let kv = MemoryStore::new();
        let store = store(&kv);

        assert!(!store.is_manual_override());
        store.set_manual_override(true);
        assert!(store.is_manual_override());
        assert_eq!(kv.snapshot().get("ab_bucket_manual").map(String::as_str), Some("1"));

        assert!(kv.set("ab_bucket_manual", "true").is_ok());
        assert!(!store.is_manual_override());

        store.set_manual_override(false);
        assert!(!kv.snapshot().contains_key("ab_bucket_manual"));
    }

    // Test IDs: TSTORE-003
    #[test]
    fn clear_removes_both_fields() {
        let kv = MemoryStore::new();
        let store = store(&kv);
        store.save(Bucket::A);
        store.set_manual_override(true);

        store.clear();

        assert!(kv.snapshot().is_empty());
        assert_eq!(store.get_saved(), None);
        assert!(!store.is_manual_override());
    }

    // Test IDs: TSTORE-004
    #[test]
    fn unrecognized_saved_value_reads_as_absent() {
        let kv = MemoryStore::new();
        assert!(kv.set("ab_bucket", "control").is_ok());
        assert_eq!(store(&kv).get_saved(), None);
    }

    // Test IDs: TSTORE-005
    #[test]
    fn failing_backend_degrades_to_sentinels() {
        let kv = MemoryStore::failing();
        let store = store(&kv);

        store.save(Bucket::A);
        store.set_manual_override(true);
        store.clear();

        assert_eq!(store.get_saved(), None);
        assert!(!store.is_manual_override());
        assert_eq!(kv.write_count(), 0);

        kv.set_failing(false);
        assert!(kv.snapshot().is_empty());
    }

    // Test IDs: TSTORE-006
    #[test]
    fn custom_keys_and_marker_are_respected() {
        let kv = MemoryStore::new();
        let config = AssignerConfig {
            assignment_key: "exp".to_string(),
            manual_override_key: "exp_forced".to_string(),
            manual_marker: "yes".to_string(),
            disabled_stages: Vec::new(),
        };
        let store = AssignmentStore::new(&kv, &config);

        store.save(Bucket::A);
        store.set_manual_override(true);

        let entries = kv.snapshot();
        assert_eq!(entries.get("exp").map(String::as_str), Some("A"));
        assert_eq!(entries.get("exp_forced").map(String::as_str), Some("yes"));
        assert!(store.is_manual_override());
    }
}
