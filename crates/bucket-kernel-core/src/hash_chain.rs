use std::fmt::{Debug, Formatter};

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const SCORE_SPAN: f64 = 4_294_967_296.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HashStageError {
    #[error("{stage} stage is disabled")]
    Disabled { stage: StageKind },
    #[error("{stage} stage unavailable: {reason}")]
    Unavailable { stage: StageKind, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Sha256,
    Fnv1a,
    SecureRandom,
    PseudoRandom,
}

impl StageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Fnv1a => "fnv1a",
            Self::SecureRandom => "secure_random",
            Self::PseudoRandom => "pseudo_random",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sha256" => Some(Self::Sha256),
            "fnv1a" => Some(Self::Fnv1a),
            "secure_random" => Some(Self::SecureRandom),
            "pseudo_random" => Some(Self::PseudoRandom),
            _ => None,
        }
    }

    /// Whether the stage yields the same score for the same input on every call.
    #[must_use]
    pub fn is_deterministic(self) -> bool {
        matches!(self, Self::Sha256 | Self::Fnv1a)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One strategy in the scoring chain.
pub trait HashStage {
    fn kind(&self) -> StageKind;

    /// Score `input`, or report that this stage cannot run.
    ///
    /// # Errors
    /// Returns an error when the capability behind the stage is unavailable.
    fn score(&self, input: &str) -> Result<u32, HashStageError>;
}

/// First four bytes of the SHA-256 digest of the UTF-8 input, big-endian.
#[must_use]
pub fn sha256_score(input: &str) -> u32 {
    let digest = Sha256::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// 32-bit FNV-1a over UTF-16 code units.
///
/// Multiplying by the FNV prime is the same as
/// `h + (h<<1) + (h<<4) + (h<<7) + (h<<8) + (h<<24)` modulo 2^32.
#[must_use]
pub fn fnv1a_utf16(input: &str) -> u32 {
    input.encode_utf16().fold(FNV32_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV32_PRIME)
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unit_interval_to_score(value: f64) -> u32 {
    let scaled = (value * SCORE_SPAN).floor();
    if scaled <= 0.0 {
        0
    } else if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    }
}

fn pseudo_random_score() -> u32 {
    unit_interval_to_score(rand::thread_rng().gen::<f64>())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Stage;

impl HashStage for Sha256Stage {
    fn kind(&self) -> StageKind {
        StageKind::Sha256
    }

    fn score(&self, input: &str) -> Result<u32, HashStageError> {
        Ok(sha256_score(input))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aStage;

impl HashStage for Fnv1aStage {
    fn kind(&self) -> StageKind {
        StageKind::Fnv1a
    }

    fn score(&self, input: &str) -> Result<u32, HashStageError> {
        Ok(fnv1a_utf16(input))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SecureRandomStage;

impl HashStage for SecureRandomStage {
    fn kind(&self) -> StageKind {
        StageKind::SecureRandom
    }

    fn score(&self, _input: &str) -> Result<u32, HashStageError> {
        let mut bytes = [0_u8; 4];
        rand::rngs::OsRng.try_fill_bytes(&mut bytes).map_err(|err| {
            HashStageError::Unavailable { stage: StageKind::SecureRandom, reason: err.to_string() }
        })?;
        Ok(u32::from_be_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PseudoRandomStage;

impl HashStage for PseudoRandomStage {
    fn kind(&self) -> StageKind {
        StageKind::PseudoRandom
    }

    fn score(&self, _input: &str) -> Result<u32, HashStageError> {
        Ok(pseudo_random_score())
    }
}

/// Placeholder for a stage whose capability is switched off.
#[derive(Debug, Clone, Copy)]
pub struct DisabledStage {
    pub kind: StageKind,
}

impl HashStage for DisabledStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn score(&self, _input: &str) -> Result<u32, HashStageError> {
        Err(HashStageError::Disabled { stage: self.kind })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreOutcome {
    pub score: u32,
    pub stage: StageKind,
}

pub struct HashChain {
    stages: Vec<Box<dyn HashStage>>,
}

impl HashChain {
    /// SHA-256, then FNV-1a, then OS randomness, then the thread-local PRNG.
    #[must_use]
    pub fn standard() -> Self {
        Self::from_stages(vec![
            Box::new(Sha256Stage),
            Box::new(Fnv1aStage),
            Box::new(SecureRandomStage),
            Box::new(PseudoRandomStage),
        ])
    }

    #[must_use]
    pub fn from_stages(stages: Vec<Box<dyn HashStage>>) -> Self {
        Self { stages }
    }

    /// The standard chain with every stage listed in `disabled` forced to fail.
    #[must_use]
    pub fn with_disabled(disabled: &[StageKind]) -> Self {
        let mut chain = Self::standard();
        for stage in &mut chain.stages {
            let kind = stage.kind();
            if disabled.contains(&kind) {
                *stage = Box::new(DisabledStage { kind });
            }
        }
        chain
    }

    #[must_use]
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|stage| stage.kind()).collect()
    }

    /// Run the stages in order and return the first successful score.
    ///
    /// Never fails: if every configured stage errors, a PRNG score is drawn directly.
    #[must_use]
    pub fn score(&self, input: &str) -> ScoreOutcome {
        for stage in &self.stages {
            let kind = stage.kind();
            match stage.score(input) {
                Ok(score) => return ScoreOutcome { score, stage: kind },
                Err(err) => {
                    tracing::debug!(stage = %kind, error = %err, "hash stage failed; falling through");
                }
            }
        }

        tracing::warn!("every configured hash stage failed; using pseudo-random score");
        ScoreOutcome { score: pseudo_random_score(), stage: StageKind::PseudoRandom }
    }
}

impl Default for HashChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl Debug for HashChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashChain").field("stages", &self.stage_kinds()).finish()
    }
}
