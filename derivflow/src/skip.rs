//! Skip policy: may a subject reuse its previous result?
//!
//! The cache is existence and success based. A subject is skipped only if
//! skipping is enabled, a previous successful entry exists, every recorded
//! output is still present and the node parameters are the defaults. When
//! content digests were recorded and verification is on, the files must
//! also still hash to the recorded values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

use crate::core::SubjectPath;
use crate::store::{file_digest, ResumeEntry};

/// Summary of a node's parameters as far as caching is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "hash", rename_all = "snake_case")]
pub enum ParamFingerprint {
    /// Parameters leave the result unchanged relative to the cached one.
    #[default]
    Default,
    /// Non-default parameters; the cache cannot be trusted.
    Custom(String),
}

impl ParamFingerprint {
    /// `Default` if `params` equals `defaults`, otherwise a hash of `params`.
    #[must_use]
    pub fn against_defaults(params: &serde_json::Value, defaults: &serde_json::Value) -> Self {
        if params == defaults {
            Self::Default
        } else {
            Self::Custom(fingerprint_parameters(params))
        }
    }

    /// Returns true for the default fingerprint.
    #[must_use]
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

/// Hashes parameters into a short hex fingerprint.
#[must_use]
pub fn fingerprint_parameters(params: &serde_json::Value) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Why a subject was or was not skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    /// Reuse the previous result.
    Skip,
    /// Skipping is turned off for the node.
    Disabled,
    /// The subject was never processed.
    NoEntry,
    /// The previous attempt failed.
    PreviouslyFailed,
    /// A recorded output is gone.
    OutputMissing(String),
    /// A recorded output changed since it was produced.
    DigestMismatch(String),
    /// The node runs with non-default parameters.
    CustomParameters,
}

impl SkipDecision {
    /// Returns true if the subject is skipped.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// Skip evaluation with optional content verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipPolicy {
    verify_content_digests: bool,
}

impl SkipPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(verify_content_digests: bool) -> Self {
        Self {
            verify_content_digests,
        }
    }

    /// Evaluates the skip rules in order and reports the first that applies.
    #[must_use]
    pub fn evaluate(
        &self,
        subject: &SubjectPath,
        skip_enabled: bool,
        resume_entry: Option<&ResumeEntry>,
        fingerprint: &ParamFingerprint,
    ) -> SkipDecision {
        let decision = self.decide(skip_enabled, resume_entry, fingerprint);
        debug!(subject = %subject, decision = ?decision, "Skip decision");
        decision
    }

    fn decide(
        &self,
        skip_enabled: bool,
        resume_entry: Option<&ResumeEntry>,
        fingerprint: &ParamFingerprint,
    ) -> SkipDecision {
        if !skip_enabled {
            return SkipDecision::Disabled;
        }
        let Some(entry) = resume_entry else {
            return SkipDecision::NoEntry;
        };
        if !entry.success {
            return SkipDecision::PreviouslyFailed;
        }
        if let Some(missing) = entry.output_paths.iter().find(|p| !Path::new(p).exists()) {
            return SkipDecision::OutputMissing(missing.clone());
        }
        if !fingerprint.is_default() {
            return SkipDecision::CustomParameters;
        }
        if self.verify_content_digests {
            if let Some(digests) = &entry.digests {
                for (path, expected) in digests {
                    match file_digest(path) {
                        Ok(actual) if &actual == expected => {}
                        _ => return SkipDecision::DigestMismatch(path.clone()),
                    }
                }
            }
        }
        SkipDecision::Skip
    }
}

/// Returns true if the subject may reuse its previous result.
#[must_use]
pub fn should_skip(
    subject: &SubjectPath,
    skip_enabled: bool,
    resume_entry: Option<&ResumeEntry>,
    fingerprint: &ParamFingerprint,
) -> bool {
    SkipPolicy::default()
        .evaluate(subject, skip_enabled, resume_entry, fingerprint)
        .is_skip()
}
