use alloy_primitives::keccak256;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

use crate::types::{OperatorId, PubKey, ResponseDigest, Signature};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureVerificationError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature does not cover the digest")]
    Mismatch,

    #[error("nothing to aggregate")]
    NothingToAggregate,
}

// boundary to the signature backend. a production deployment plugs
// its bls library in here; pairing math stays on that side of the
// trait. the bundled scheme below is ed25519 with concatenation
// standing in for point addition, enough for dev nets and tests.
pub trait SignatureScheme: Send + Sync + 'static {
    // check one operator's partial signature over a response digest
    fn verify_partial(
        &self,
        pubkey: &PubKey,
        digest: &ResponseDigest,
        signature: &Signature,
    ) -> Result<(), SignatureVerificationError>;

    // fold partial signatures into the aggregate; callers pass them
    // in a deterministic order (the engine sorts by operator id)
    fn aggregate_signatures(
        &self,
        partials: &[Signature],
    ) -> Result<Signature, SignatureVerificationError>;

    fn aggregate_pubkeys(&self, pubkeys: &[PubKey]) -> Result<PubKey, SignatureVerificationError>;
}

pub struct Ed25519Scheme;

impl Ed25519Scheme {
    fn verifying_key(pubkey: &PubKey) -> Result<VerifyingKey, SignatureVerificationError> {
        let bytes: [u8; 32] = pubkey
            .0
            .as_slice()
            .try_into()
            .map_err(|_| SignatureVerificationError::MalformedKey("need 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureVerificationError::MalformedKey(e.to_string()))
    }
}

impl SignatureScheme for Ed25519Scheme {
    fn verify_partial(
        &self,
        pubkey: &PubKey,
        digest: &ResponseDigest,
        signature: &Signature,
    ) -> Result<(), SignatureVerificationError> {
        let key = Self::verifying_key(pubkey)?;
        let sig = ed25519_dalek::Signature::from_slice(&signature.0)
            .map_err(|e| SignatureVerificationError::MalformedSignature(e.to_string()))?;
        key.verify(digest.as_slice(), &sig)
            .map_err(|_| SignatureVerificationError::Mismatch)
    }

    fn aggregate_signatures(
        &self,
        partials: &[Signature],
    ) -> Result<Signature, SignatureVerificationError> {
        if partials.is_empty() {
            return Err(SignatureVerificationError::NothingToAggregate);
        }
        let mut folded = Vec::with_capacity(partials.len() * 64);
        for partial in partials {
            folded.extend_from_slice(&partial.0);
        }
        Ok(Signature(folded))
    }

    fn aggregate_pubkeys(&self, pubkeys: &[PubKey]) -> Result<PubKey, SignatureVerificationError> {
        if pubkeys.is_empty() {
            return Err(SignatureVerificationError::NothingToAggregate);
        }
        let mut folded = Vec::with_capacity(pubkeys.len() * 32);
        for pubkey in pubkeys {
            folded.extend_from_slice(&pubkey.0);
        }
        Ok(PubKey(folded))
    }
}

// operator identity is the keccak of the public key, as registered
// on-chain
pub fn operator_id_from_pubkey(pubkey: &PubKey) -> OperatorId {
    keccak256(&pubkey.0)
}

// keypair holder for the bundled scheme, used by dev workers and
// the test suites
pub struct OperatorSigner {
    signing_key: SigningKey,
}

impl OperatorSigner {
    pub fn random() -> OperatorSigner {
        OperatorSigner {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> OperatorSigner {
        OperatorSigner {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn pubkey(&self) -> PubKey {
        PubKey(self.signing_key.verifying_key().as_bytes().to_vec())
    }

    pub fn operator_id(&self) -> OperatorId {
        operator_id_from_pubkey(&self.pubkey())
    }

    pub fn sign_digest(&self, digest: &ResponseDigest) -> Signature {
        Signature(self.signing_key.sign(digest.as_slice()).to_bytes().to_vec())
    }
}
