use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod assigner;
mod config;
mod hash_chain;
mod identity;
mod store;

pub use assigner::{AssignmentReport, BucketAssigner, Preview};
pub use config::{
    AssignerConfig, DEFAULT_ASSIGNMENT_KEY, DEFAULT_MANUAL_MARKER, DEFAULT_MANUAL_OVERRIDE_KEY,
};
pub use hash_chain::{
    fnv1a_utf16, sha256_score, DisabledStage, Fnv1aStage, HashChain, HashStage, HashStageError,
    PseudoRandomStage, ScoreOutcome, SecureRandomStage, Sha256Stage, StageKind,
};
pub use identity::{
    normalize_identity_key, IdentityKey, IdentityKeyBuilder, IdentityProvider, IdentitySource,
    NoIdentityProvider, ProviderError, SignatureSource, StaticIdentity, StaticSignature,
};
pub use store::{AssignmentStore, KeyValueStore, MemoryStore, StoreError};

/// Scores at or above this value land in bucket A; everything below lands in B.
pub const BUCKET_THRESHOLD: u32 = 1 << 31;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AssignError {
    #[error("invalid bucket {0:?}: expected \"A\" or \"B\"")]
    InvalidBucket(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Bucket {
    A,
    B,
}

impl Bucket {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }

    /// Map a 32-bit score to its bucket using [`BUCKET_THRESHOLD`].
    #[must_use]
    pub fn from_score(score: u32) -> Self {
        if score >= BUCKET_THRESHOLD {
            Self::A
        } else {
            Self::B
        }
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = AssignError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| AssignError::InvalidBucket(value.to_string()))
    }
}
