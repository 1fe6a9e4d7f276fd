use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::AssignerConfig;
use crate::hash_chain::{HashChain, StageKind};
use crate::identity::{IdentityKeyBuilder, IdentityProvider, IdentitySource, SignatureSource};
use crate::store::{AssignmentStore, KeyValueStore};
use crate::{AssignError, Bucket};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentReport {
    pub bucket: Bucket,
    /// True when this call computed and saved the bucket.
    pub newly_assigned: bool,
    pub manual_override: bool,
    /// Set only when the bucket was computed by this call.
    pub identity_source: Option<IdentitySource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preview {
    pub bucket: Bucket,
    pub score: u32,
    pub stage: StageKind,
    pub identity_source: IdentitySource,
    /// True when the same client would get the same score on another call.
    pub reproducible: bool,
    /// Hex SHA-256 of the identity key; the key itself carries the client IP.
    pub key_fingerprint: String,
}

/// Bucket assignment over an injected store, identity provider and hash chain.
///
/// States: unassigned (no saved bucket), auto-assigned (saved, no override flag),
/// manually assigned (saved, override flag set).
#[derive(Debug)]
pub struct BucketAssigner<S> {
    store: AssignmentStore<S>,
    identity: IdentityKeyBuilder,
    chain: HashChain,
}

impl<S: KeyValueStore> BucketAssigner<S> {
    #[must_use]
    pub fn new(kv: S) -> Self {
        Self::with_config(kv, &AssignerConfig::default())
    }

    #[must_use]
    pub fn with_config(kv: S, config: &AssignerConfig) -> Self {
        Self {
            store: AssignmentStore::new(kv, config),
            identity: IdentityKeyBuilder::default(),
            chain: HashChain::with_disabled(&config.disabled_stages),
        }
    }

    #[must_use]
    pub fn with_identity_provider(mut self, provider: Box<dyn IdentityProvider>) -> Self {
        self.identity.set_provider(provider);
        self
    }

    #[must_use]
    pub fn with_signature_source(mut self, signature: Box<dyn SignatureSource>) -> Self {
        self.identity.set_signature_source(signature);
        self
    }

    #[must_use]
    pub fn with_hash_chain(mut self, chain: HashChain) -> Self {
        self.chain = chain;
        self
    }

    #[must_use]
    pub fn store(&self) -> &AssignmentStore<S> {
        &self.store
    }

    /// Return the saved bucket, or compute, save and return a new one.
    #[must_use]
    pub fn assign(&self) -> Bucket {
        self.assign_report().bucket
    }

    #[must_use]
    pub fn assign_report(&self) -> AssignmentReport {
        if let Some(bucket) = self.store.get_saved() {
            return AssignmentReport {
                bucket,
                newly_assigned: false,
                manual_override: self.store.is_manual_override(),
                identity_source: None,
            };
        }

        let preview = self.peek_report();
        self.store.save(preview.bucket);
        self.store.set_manual_override(false);
        tracing::debug!(
            bucket = %preview.bucket,
            stage = %preview.stage,
            identity_source = preview.identity_source.as_str(),
            "assigned bucket"
        );

        AssignmentReport {
            bucket: preview.bucket,
            newly_assigned: true,
            manual_override: false,
            identity_source: Some(preview.identity_source),
        }
    }

    /// Compute the hash-based bucket without reading or writing the store.
    #[must_use]
    pub fn peek(&self) -> Bucket {
        self.peek_report().bucket
    }

    #[must_use]
    pub fn peek_report(&self) -> Preview {
        let key = self.identity.build();
        let outcome = self.chain.score(key.as_str());
        let key_fingerprint = format!("{:x}", Sha256::digest(key.as_str().as_bytes()));

        Preview {
            bucket: Bucket::from_score(outcome.score),
            score: outcome.score,
            stage: outcome.stage,
            identity_source: key.source(),
            reproducible: outcome.stage.is_deterministic() && key.is_stable(),
            key_fingerprint,
        }
    }

    /// Force the bucket and mark it as a manual override.
    ///
    /// # Errors
    /// Returns [`AssignError::InvalidBucket`] when `raw` is not exactly `A` or `B`;
    /// the store is left untouched.
    pub fn set_manual(&self, raw: &str) -> Result<Bucket, AssignError> {
        let bucket: Bucket = raw.parse()?;
        self.store.save(bucket);
        self.store.set_manual_override(true);
        Ok(bucket)
    }

    #[must_use]
    pub fn get_saved(&self) -> Option<Bucket> {
        self.store.get_saved()
    }

    #[must_use]
    pub fn is_manual_override(&self) -> bool {
        self.store.is_manual_override()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    #[must_use]
    pub fn clear_and_reassign(&self) -> Bucket {
        self.clear_and_reassign_report().bucket
    }

    #[must_use]
    pub fn clear_and_reassign_report(&self) -> AssignmentReport {
        self.store.clear();
        self.assign_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{StaticIdentity, StaticSignature};
    use crate::store::MemoryStore;

    fn assigner<'a>(kv: &'a MemoryStore, ip: &str, agent: &str) -> BucketAssigner<&'a MemoryStore> {
        BucketAssigner::new(kv)
            .with_identity_provider(Box::new(StaticIdentity(ip.to_string())))
            .with_signature_source(Box::new(StaticSignature(Some(agent.to_string()))))
    }

    // Test IDs: TASN-001
    #[test]
    fn peek_is_deterministic_and_does_not_touch_store() {
        let kv = MemoryStore::new();
        let assigner = assigner(&kv, "1.2.3.4", "curl/8.0");

        let first = assigner.peek_report();
        let second = assigner.peek_report();

        assert_eq!(first, second);
        assert_eq!(first.bucket, Bucket::A);
        assert_eq!(first.score, 0x8860_ceaf);
        assert_eq!(first.stage, StageKind::Sha256);
        assert_eq!(first.identity_source, IdentitySource::Provider);
        assert!(first.reproducible);
        assert!(first.key_fingerprint.starts_with("8860ceaffd402b4e"));
        assert!(kv.snapshot().is_empty());
    }

    // Test IDs: TASN-002
    #[test]
    fn assign_is_idempotent_and_writes_once() {
        let kv = MemoryStore::new();
        let assigner = assigner(&kv, "1.2.3.4", "test-agent");

        let first = assigner.assign_report();
        let second = assigner.assign_report();

        assert_eq!(first.bucket, Bucket::B);
        assert!(first.newly_assigned);
        assert_eq!(first.identity_source, Some(IdentitySource::Provider));
        assert_eq!(second.bucket, first.bucket);
        assert!(!second.newly_assigned);
        assert_eq!(second.identity_source, None);
        assert_eq!(kv.write_count(), 1);
        assert!(!assigner.is_manual_override());
    }

    // Test IDs: TASN-003
    #[test]
    fn assign_returns_saved_bucket_without_recomputing() {
        let kv = MemoryStore::new();
        assert!(kv.set("ab_bucket", "A").is_ok());
        let assigner = assigner(&kv, "1.2.3.4", "test-agent");

        assert_eq!(assigner.peek(), Bucket::B);
        assert_eq!(assigner.assign(), Bucket::A);
        assert_eq!(kv.write_count(), 1);
    }

    // Test IDs: TASN-004
    #[test]
    fn manual_override_takes_precedence() {
        let kv = MemoryStore::new();
        let assigner = assigner(&kv, "1.2.3.4", "test-agent");
        assert_eq!(assigner.assign(), Bucket::B);

        assert_eq!(assigner.set_manual("A"), Ok(Bucket::A));

        let report = assigner.assign_report();
        assert_eq!(report.bucket, Bucket::A);
        assert!(report.manual_override);
        assert!(assigner.is_manual_override());
        assert_eq!(assigner.get_saved(), Some(Bucket::A));
    }

    // Test IDs: TASN-005
    #[test]
    fn invalid_manual_bucket_is_rejected_without_mutation() {
        let kv = MemoryStore::new();
        let assigner = assigner(&kv, "1.2.3.4", "test-agent");
        assert_eq!(assigner.set_manual("B"), Ok(Bucket::B));
        let before = kv.snapshot();
        let writes_before = kv.write_count();

        for raw in ["C", "a", "", " A"] {
            assert_eq!(assigner.set_manual(raw), Err(AssignError::InvalidBucket(raw.to_string())));
        }

        assert_eq!(kv.snapshot(), before);
        assert_eq!(kv.write_count(), writes_before);
        assert!(assigner.is_manual_override());
        assert_eq!(assigner.get_saved(), Some(Bucket::B));
    }

    // Test IDs: TASN-006
    #[test]
    fn clear_and_reassign_drops_override_and_matches_peek() {
        let kv = MemoryStore::new();
        let assigner = assigner(&kv, "1.2.3.4", "curl/8.0");
        assert_eq!(assigner.set_manual("B"), Ok(Bucket::B));

        let report = assigner.clear_and_reassign_report();

        assert!(report.newly_assigned);
        assert!(!report.manual_override);
        assert!(!assigner.is_manual_override());
        assert_eq!(report.bucket, assigner.peek());
        assert_eq!(assigner.get_saved(), Some(Bucket::A));
    }

    // Test IDs: TASN-007
    #[test]
    fn assign_clears_stale_override_flag() {
        let kv = MemoryStore::new();
        assert!(kv.set("ab_bucket_manual", "1").is_ok());
        let assigner = assigner(&kv, "1.2.3.4", "curl/8.0");

        let report = assigner.assign_report();

        assert!(report.newly_assigned);
        assert!(!assigner.is_manual_override());
        assert!(!kv.snapshot().contains_key("ab_bucket_manual"));
    }

    // Test IDs: TASN-008
    #[test]
    fn failing_store_still_yields_a_bucket() {
        let kv = MemoryStore::failing();
        let assigner = BucketAssigner::new(&kv);

        let report = assigner.assign_report();

        assert!(matches!(report.bucket, Bucket::A | Bucket::B));
        assert!(report.newly_assigned);
        assert_eq!(report.identity_source, Some(IdentitySource::RandomFallback));
        assert_eq!(assigner.get_saved(), None);
        assert!(!assigner.is_manual_override());
        assert_eq!(assigner.set_manual("A"), Ok(Bucket::A));
        assert_eq!(assigner.get_saved(), None);
    }

    // Test IDs: TASN-009
    #[test]
    fn disabled_primary_stage_uses_fnv1a_score() {
        let kv = MemoryStore::new();
        let config =
            AssignerConfig { disabled_stages: vec![StageKind::Sha256], ..AssignerConfig::default() };
        let assigner = BucketAssigner::with_config(&kv, &config)
            .with_identity_provider(Box::new(StaticIdentity("1.2.3.4".to_string())))
            .with_signature_source(Box::new(StaticSignature(Some("test-agent".to_string()))));

        let preview = assigner.peek_report();

        assert_eq!(preview.stage, StageKind::Fnv1a);
        assert_eq!(preview.score, 566_215_699);
        assert_eq!(preview.bucket, Bucket::B);
    }

    // Test IDs: TASN-010
    #[test]
    fn hash_chain_can_be_replaced() {
        let kv = MemoryStore::new();
        let assigner = assigner(&kv, "10.0.0.1", "mozilla/5.0")
            .with_hash_chain(HashChain::from_stages(vec![Box::new(crate::Fnv1aStage)]));

        let preview = assigner.peek_report();

        assert_eq!(preview.stage, StageKind::Fnv1a);
        assert_eq!(preview.score, 3_919_578_451);
        assert_eq!(preview.bucket, Bucket::A);
        assert!(preview.reproducible);
    }

    // Test IDs: TASN-011
    #[test]
    fn random_stage_or_fallback_identity_is_not_reproducible() {
        let kv = MemoryStore::new();
        let config = AssignerConfig {
            disabled_stages: vec![StageKind::Sha256, StageKind::Fnv1a],
            ..AssignerConfig::default()
        };
        let random_stage = BucketAssigner::with_config(&kv, &config)
            .with_identity_provider(Box::new(StaticIdentity("1.2.3.4".to_string())))
            .with_signature_source(Box::new(StaticSignature(Some("test-agent".to_string()))));

        let preview = random_stage.peek_report();
        assert!(!preview.stage.is_deterministic());
        assert_eq!(preview.identity_source, IdentitySource::Provider);
        assert!(!preview.reproducible);

        let anonymous = BucketAssigner::new(&kv).peek_report();
        assert_eq!(anonymous.stage, StageKind::Sha256);
        assert_eq!(anonymous.identity_source, IdentitySource::RandomFallback);
        assert!(!anonymous.reproducible);
    }
}
