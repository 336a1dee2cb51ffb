//! Signature policy engine
//!
//! Signs outgoing requests/responses and verifies incoming ones according to
//! per-action rules. The most specific rule matching an action wins:
//! exact action name, then the longest `Prefix*` pattern, then `*`.
//!
//! Signatures cover the canonical form of a message: the JSON object without
//! `signatures` and without the hop-mutable `networkPath`, with object keys
//! sorted recursively. Signers sign the digest of that form.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{Request, Response};

pub const ED25519: &str = "Ed25519";

/// Signing and verification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("{action} requires {required} valid signature(s), found {valid}")]
    InsufficientSignatures {
        action: String,
        required: usize,
        valid: usize,
    },

    #[error("invalid signature from key {key_id}")]
    InvalidSignature { key_id: String },

    #[error("signature from key {key_id} covers a different message")]
    HashMismatch { key_id: String },

    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("unknown key {0}")]
    UnknownKey(String),

    #[error("malformed signature encoding: {0}")]
    Encoding(String),

    #[error("no signing key configured for {0}")]
    NoSigner(String),

    #[error("cannot canonicalize message: {0}")]
    Canonicalization(String),
}

/// One signature attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: String,
    pub algorithm: String,
    /// Hex-encoded signature bytes
    pub signature: String,
    /// Hex-encoded digest of the canonical message the signature covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covered_hash: Option<String>,
}

/// Digest used for the canonical form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

/// Which action names a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionPattern {
    /// `*`
    Any,
    /// `Prefix*`
    Prefix(String),
    Exact(String),
}

impl ActionPattern {
    pub fn matches(&self, action: &str) -> bool {
        match self {
            ActionPattern::Any => true,
            ActionPattern::Prefix(prefix) => action.starts_with(prefix.as_str()),
            ActionPattern::Exact(name) => name == action,
        }
    }

    /// Higher is more specific
    fn specificity(&self) -> (u8, usize) {
        match self {
            ActionPattern::Any => (0, 0),
            ActionPattern::Prefix(prefix) => (1, prefix.len()),
            ActionPattern::Exact(name) => (2, name.len()),
        }
    }
}

impl From<String> for ActionPattern {
    fn from(s: String) -> Self {
        if s == "*" {
            ActionPattern::Any
        } else if let Some(prefix) = s.strip_suffix('*') {
            ActionPattern::Prefix(prefix.to_string())
        } else {
            ActionPattern::Exact(s)
        }
    }
}

impl From<ActionPattern> for String {
    fn from(pattern: ActionPattern) -> Self {
        match pattern {
            ActionPattern::Any => "*".to_string(),
            ActionPattern::Prefix(prefix) => format!("{}*", prefix),
            ActionPattern::Exact(name) => name,
        }
    }
}

/// Message direction a rule applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Requests,
    Responses,
    #[default]
    Both,
}

impl RuleScope {
    fn covers(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (RuleScope::Both, _)
                | (RuleScope::Requests, Direction::Request)
                | (RuleScope::Responses, Direction::Response)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

/// Signing/verification requirements for matching actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePolicyRule {
    pub action: ActionPattern,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub minimum_signatures: usize,
    /// Key ids accepted for verification; empty accepts any key the verifier knows
    #[serde(default)]
    pub accepted_keys: Vec<String>,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

impl SignaturePolicyRule {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: ActionPattern::from(action.into()),
            scope: RuleScope::Both,
            minimum_signatures: 0,
            accepted_keys: Vec::new(),
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }

    pub fn requiring(mut self, minimum_signatures: usize) -> Self {
        self.minimum_signatures = minimum_signatures;
        self
    }

    pub fn accepting(mut self, key_id: impl Into<String>) -> Self {
        self.accepted_keys.push(key_id.into());
        self
    }

    pub fn scoped(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn hashed_with(mut self, hash_algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }
}

/// Rule set for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePolicy {
    #[serde(default)]
    pub rules: Vec<SignaturePolicyRule>,
    /// Also verify requests on relay hops, not only at the terminal node
    #[serde(default)]
    pub verify_at_relays: bool,
}

impl SignaturePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: SignaturePolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn verifying_at_relays(mut self) -> Self {
        self.verify_at_relays = true;
        self
    }

    /// Load a policy from its JSON representation
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn rule_for_request(&self, action: &str) -> Option<&SignaturePolicyRule> {
        self.rule_for(action, Direction::Request)
    }

    pub fn rule_for_response(&self, action: &str) -> Option<&SignaturePolicyRule> {
        self.rule_for(action, Direction::Response)
    }

    fn rule_for(&self, action: &str, direction: Direction) -> Option<&SignaturePolicyRule> {
        self.rules
            .iter()
            .filter(|r| r.scope.covers(direction) && r.action.matches(action))
            .max_by_key(|r| r.action.specificity())
    }
}

/// Produces signatures with one key
pub trait Signer: Send + Sync {
    fn key_id(&self) -> &str;
    fn algorithm(&self) -> &str;
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, SignatureError>;
}

/// Checks signatures against known keys
pub trait Verifier: Send + Sync {
    fn knows(&self, key_id: &str) -> bool;
    fn verify(
        &self,
        key_id: &str,
        algorithm: &str,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError>;
}

/// Ed25519 signing key
pub struct Ed25519Signer {
    key_id: String,
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Create from a 32-byte secret seed
    pub fn from_seed(key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn algorithm(&self) -> &str {
        ED25519
    }

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, SignatureError> {
        Ok(self.signing_key.sign(digest).to_bytes().to_vec())
    }
}

/// Trusted public keys by key id
#[derive(Default)]
pub struct KeyRing {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.insert(key_id, key);
        self
    }

    pub fn insert(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Add a key from its hex-encoded 32-byte public key
    pub fn insert_hex(&mut self, key_id: impl Into<String>, hex_key: &str) -> Result<(), SignatureError> {
        let bytes: [u8; 32] = hex::decode(hex_key)
            .map_err(|e| SignatureError::Encoding(e.to_string()))?
            .try_into()
            .map_err(|_| SignatureError::Encoding("public key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::Encoding(e.to_string()))?;
        self.insert(key_id, key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Verifier for KeyRing {
    fn knows(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    fn verify(
        &self,
        key_id: &str,
        algorithm: &str,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        if algorithm != ED25519 {
            return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| SignatureError::UnknownKey(key_id.to_string()))?;
        let bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::Encoding("signature must be 64 bytes".to_string()))?;
        key.verify(digest, &ed25519_dalek::Signature::from_bytes(&bytes))
            .map_err(|_| SignatureError::InvalidSignature {
                key_id: key_id.to_string(),
            })
    }
}

/// Outcome of a successful verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// No rule matched the action
    NotRequired,
    /// Rule satisfied by this many valid signatures
    Verified(usize),
}

/// Canonical bytes covered by signatures
pub fn canonical_bytes<T: Serialize>(message: &T) -> Result<Vec<u8>, SignatureError> {
    let mut value = serde_json::to_value(message)
        .map_err(|e| SignatureError::Canonicalization(e.to_string()))?;
    if let Value::Object(object) = &mut value {
        object.remove("signatures");
        object.remove("networkPath");
    }
    serde_json::to_vec(&sorted(value)).map_err(|e| SignatureError::Canonicalization(e.to_string()))
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (key, v) in entries {
                out.insert(key, sorted(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Applies a [`SignaturePolicy`] with a signer and a verifier
pub struct SignatureEngine {
    policy: SignaturePolicy,
    signer: Option<Arc<dyn Signer>>,
    verifier: Arc<dyn Verifier>,
}

impl SignatureEngine {
    pub fn new(
        policy: SignaturePolicy,
        signer: Option<Arc<dyn Signer>>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            policy,
            signer,
            verifier,
        }
    }

    /// Engine with no rules: signs nothing, accepts everything
    pub fn permissive() -> Self {
        Self::new(SignaturePolicy::default(), None, Arc::new(KeyRing::new()))
    }

    pub fn policy(&self) -> &SignaturePolicy {
        &self.policy
    }

    /// Append a signature if a rule matches the request's action
    pub fn sign_request(&self, request: &mut Request) -> Result<bool, SignatureError> {
        let Some(rule) = self.policy.rule_for_request(&request.action) else {
            return Ok(false);
        };
        let signature = self.signature_for(&request.action, rule, &*request)?;
        request.signatures.push(signature);
        Ok(true)
    }

    /// Append a signature if a rule matches the originating action
    pub fn sign_response(&self, action: &str, response: &mut Response) -> Result<bool, SignatureError> {
        let Some(rule) = self.policy.rule_for_response(action) else {
            return Ok(false);
        };
        let signature = self.signature_for(action, rule, &*response)?;
        response.signatures.push(signature);
        Ok(true)
    }

    pub fn verify_request(&self, request: &Request) -> Result<Verification, SignatureError> {
        match self.policy.rule_for_request(&request.action) {
            None => Ok(Verification::NotRequired),
            Some(rule) => self.verify(&request.action, rule, request, &request.signatures),
        }
    }

    pub fn verify_response(&self, action: &str, response: &Response) -> Result<Verification, SignatureError> {
        match self.policy.rule_for_response(action) {
            None => Ok(Verification::NotRequired),
            Some(rule) => self.verify(action, rule, response, &response.signatures),
        }
    }

    fn signature_for<T: Serialize>(
        &self,
        action: &str,
        rule: &SignaturePolicyRule,
        message: &T,
    ) -> Result<Signature, SignatureError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SignatureError::NoSigner(action.to_string()))?;

        let digest = rule.hash_algorithm.digest(&canonical_bytes(message)?);
        let bytes = signer.sign(&digest)?;
        debug!("Signed {} with key {}", action, signer.key_id());

        Ok(Signature {
            key_id: signer.key_id().to_string(),
            algorithm: signer.algorithm().to_string(),
            signature: hex::encode(bytes),
            covered_hash: Some(hex::encode(&digest)),
        })
    }

    fn verify<T: Serialize>(
        &self,
        action: &str,
        rule: &SignaturePolicyRule,
        message: &T,
        signatures: &[Signature],
    ) -> Result<Verification, SignatureError> {
        let digest = rule.hash_algorithm.digest(&canonical_bytes(message)?);
        let expected_hash = hex::encode(&digest);

        let mut valid = 0;
        let mut rejected: Option<SignatureError> = None;
        for sig in signatures {
            let accepted = if rule.accepted_keys.is_empty() {
                self.verifier.knows(&sig.key_id)
            } else {
                rule.accepted_keys.iter().any(|k| k == &sig.key_id)
            };
            if !accepted {
                debug!("Ignoring signature from unaccepted key {} on {}", sig.key_id, action);
                continue;
            }

            match self.check(sig, &digest, &expected_hash) {
                Ok(()) => valid += 1,
                Err(e) => {
                    warn!("Skipping signature on {}: {}", action, e);
                    rejected = Some(e);
                }
            }
        }

        if valid < rule.minimum_signatures {
            warn!(
                "{} rejected: {} of {} required signatures",
                action, valid, rule.minimum_signatures
            );
            // report the concrete failure when there is one
            return Err(rejected.unwrap_or(SignatureError::InsufficientSignatures {
                action: action.to_string(),
                required: rule.minimum_signatures,
                valid,
            }));
        }

        Ok(Verification::Verified(valid))
    }

    fn check(&self, sig: &Signature, digest: &[u8], expected_hash: &str) -> Result<(), SignatureError> {
        if let Some(covered) = &sig.covered_hash {
            if !covered.eq_ignore_ascii_case(expected_hash) {
                return Err(SignatureError::HashMismatch {
                    key_id: sig.key_id.clone(),
                });
            }
        }

        let bytes = hex::decode(&sig.signature).map_err(|e| SignatureError::Encoding(e.to_string()))?;
        self.verifier.verify(&sig.key_id, &sig.algorithm, digest, &bytes)
    }
}
