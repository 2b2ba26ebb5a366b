//! `WebAuthn` assertions as a second factor.
//!
//! The ceremony is split in two steps:
//! 1. [`WebAuthnVerifier::begin_assertion`] hands the browser a single-use
//!    random challenge.
//! 2. [`WebAuthnVerifier::finish_assertion`] consumes it and checks the signed
//!    client data and authenticator data against the credential registered for
//!    the user.
//!
//! Registration takes an already extracted public key; attestation is not
//! verified.

use crate::{clock::Clock, config::AuthConfig, error::AuthError};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use ring::signature::{self, UnparsedPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

const CHALLENGE_BYTES: usize = 32;
const RP_ID_HASH_LEN: usize = 32;
// rpIdHash (32) + flags (1) + signCount (4)
const MIN_AUTH_DATA_LEN: usize = 37;
const FLAG_USER_PRESENT: u8 = 0x01;
const CLIENT_DATA_TYPE_GET: &str = "webauthn.get";

/// COSE algorithms accepted for assertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoseAlgorithm {
    /// ECDSA P-256 with SHA-256, public key as an uncompressed SEC1 point.
    #[serde(rename = "ES256")]
    Es256,
    /// Ed25519, raw 32-byte public key.
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl CoseAlgorithm {
    fn verification(self) -> &'static dyn signature::VerificationAlgorithm {
        match self {
            Self::Es256 => &signature::ECDSA_P256_SHA256_ASN1,
            Self::EdDsa => &signature::ED25519,
        }
    }

    const fn key_len(self) -> usize {
        match self {
            Self::Es256 => 65,
            Self::EdDsa => 32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredCredential {
    /// base64url credential id as reported by the authenticator.
    pub credential_id: String,
    pub algorithm: CoseAlgorithm,
    pub public_key: Vec<u8>,
    pub sign_count: u32,
}

/// Browser response to `navigator.credentials.get`, base64url fields.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssertionResponse {
    pub credential_id: String,
    pub client_data_json: String,
    pub authenticator_data: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    kind: String,
    challenge: String,
    origin: String,
}

#[derive(Debug)]
struct PendingAssertion {
    challenge: String,
    expires_at: DateTime<Utc>,
}

pub struct WebAuthnVerifier {
    credentials: DashMap<String, Vec<RegisteredCredential>>,
    pending: DashMap<String, PendingAssertion>,
    rp_id_hash: [u8; RP_ID_HASH_LEN],
    rp_origin: String,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, AuthError> {
    Base64UrlUnpadded::decode_vec(value.trim_end_matches('=')).map_err(|_| {
        debug!(field, "assertion field is not base64url");
        AuthError::AssertionRejected("malformed assertion")
    })
}

impl WebAuthnVerifier {
    #[must_use]
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            credentials: DashMap::new(),
            pending: DashMap::new(),
            rp_id_hash: Sha256::digest(config.webauthn_rp_id().as_bytes()).into(),
            rp_origin: config.webauthn_rp_origin().to_string(),
            ttl: config.webauthn_challenge_ttl(),
            clock,
        }
    }

    /// Register a credential for `username`, replacing one with the same id.
    ///
    /// # Errors
    /// [`AuthError::AssertionRejected`] if the key has the wrong length for
    /// its algorithm.
    pub fn register(&self, username: &str, credential: RegisteredCredential) -> Result<(), AuthError> {
        if credential.public_key.len() != credential.algorithm.key_len() {
            return Err(AuthError::AssertionRejected("public key has the wrong length"));
        }
        let mut registered = self.credentials.entry(username.to_string()).or_default();
        registered.retain(|c| c.credential_id != credential.credential_id);
        info!(username, algorithm = ?credential.algorithm, "webauthn credential registered");
        registered.push(credential);
        Ok(())
    }

    #[must_use]
    pub fn has_credentials(&self, username: &str) -> bool {
        self.credentials
            .get(username)
            .is_some_and(|registered| !registered.is_empty())
    }

    #[must_use]
    pub fn credentials_of(&self, username: &str) -> Vec<RegisteredCredential> {
        self.credentials
            .get(username)
            .map(|registered| registered.clone())
            .unwrap_or_default()
    }

    /// Issue a fresh challenge for `username`, replacing any pending one.
    ///
    /// # Errors
    /// [`AuthError::Internal`] if the OS random source fails.
    pub fn begin_assertion(&self, username: &str) -> Result<String, AuthError> {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AuthError::Internal(format!("challenge generation failed: {e}")))?;
        let challenge = Base64UrlUnpadded::encode_string(&bytes);
        self.pending.insert(
            username.to_string(),
            PendingAssertion {
                challenge: challenge.clone(),
                expires_at: self.clock.now() + self.ttl,
            },
        );
        Ok(challenge)
    }

    /// Verify an assertion for `username`. The pending challenge is consumed
    /// whatever the outcome.
    ///
    /// # Errors
    /// [`AuthError::ChallengeAbsent`] or [`AuthError::ChallengeExpired`] when
    /// no usable challenge is pending, otherwise
    /// [`AuthError::AssertionRejected`] naming the failed check.
    pub fn finish_assertion(
        &self,
        username: &str,
        assertion: &AssertionResponse,
    ) -> Result<(), AuthError> {
        let (_, pending) = self
            .pending
            .remove(username)
            .ok_or(AuthError::ChallengeAbsent)?;
        if self.clock.now() > pending.expires_at {
            return Err(AuthError::ChallengeExpired);
        }

        let result = self.check(username, &pending.challenge, assertion);
        if let Err(e) = &result {
            warn!(username, "webauthn assertion rejected: {e}");
        }
        result
    }

    fn check(
        &self,
        username: &str,
        expected_challenge: &str,
        assertion: &AssertionResponse,
    ) -> Result<(), AuthError> {
        let client_data_raw = decode("client_data_json", &assertion.client_data_json)?;
        let auth_data = decode("authenticator_data", &assertion.authenticator_data)?;
        let signature = decode("signature", &assertion.signature)?;

        let client_data: ClientData = serde_json::from_slice(&client_data_raw)
            .map_err(|_| AuthError::AssertionRejected("malformed client data"))?;
        if client_data.kind != CLIENT_DATA_TYPE_GET {
            return Err(AuthError::AssertionRejected("wrong client data type"));
        }
        let challenge_ok: bool = client_data
            .challenge
            .trim_end_matches('=')
            .as_bytes()
            .ct_eq(expected_challenge.as_bytes())
            .into();
        if !challenge_ok {
            return Err(AuthError::AssertionRejected("challenge mismatch"));
        }
        if client_data.origin != self.rp_origin {
            return Err(AuthError::AssertionRejected("origin mismatch"));
        }

        if auth_data.len() < MIN_AUTH_DATA_LEN {
            return Err(AuthError::AssertionRejected("authenticator data too short"));
        }
        if auth_data[..RP_ID_HASH_LEN] != self.rp_id_hash {
            return Err(AuthError::AssertionRejected("relying party mismatch"));
        }
        if auth_data[RP_ID_HASH_LEN] & FLAG_USER_PRESENT == 0 {
            return Err(AuthError::AssertionRejected("user not present"));
        }
        let mut counter = [0u8; 4];
        counter.copy_from_slice(&auth_data[RP_ID_HASH_LEN + 1..MIN_AUTH_DATA_LEN]);
        let counter = u32::from_be_bytes(counter);

        // Holding the entry serialises concurrent assertions for the user.
        let mut registered = self
            .credentials
            .get_mut(username)
            .ok_or(AuthError::AssertionRejected("no credential registered"))?;
        let credential = registered
            .iter_mut()
            .find(|c| c.credential_id == assertion.credential_id)
            .ok_or(AuthError::AssertionRejected("unknown credential"))?;

        let mut signed = auth_data.clone();
        signed.extend_from_slice(&Sha256::digest(&client_data_raw));
        UnparsedPublicKey::new(credential.algorithm.verification(), &credential.public_key)
            .verify(&signed, &signature)
            .map_err(|_| AuthError::AssertionRejected("bad signature"))?;

        if (counter != 0 || credential.sign_count != 0) && counter <= credential.sign_count {
            return Err(AuthError::AssertionRejected("signature counter did not increase"));
        }
        credential.sign_count = counter;
        debug!(username, counter, "webauthn assertion verified");
        Ok(())
    }

    /// Drop expired challenges.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.pending.len();
        self.pending.retain(|_, pending| now <= pending.expires_at);
        before.saturating_sub(self.pending.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::anyhow;
    use ring::{
        rand::SystemRandom,
        signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING},
    };

    /// Software authenticator producing assertions for tests.
    pub(crate) enum TestKey {
        Es256(EcdsaKeyPair),
        EdDsa(Ed25519KeyPair),
    }

    impl TestKey {
        pub(crate) fn es256() -> anyhow::Result<Self> {
            let rng = SystemRandom::new();
            let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
                .map_err(|e| anyhow!("{e}"))?;
            let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| anyhow!("{e}"))?;
            Ok(Self::Es256(pair))
        }

        pub(crate) fn ed25519() -> anyhow::Result<Self> {
            let rng = SystemRandom::new();
            let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|e| anyhow!("{e}"))?;
            let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|e| anyhow!("{e}"))?;
            Ok(Self::EdDsa(pair))
        }

        pub(crate) fn credential(&self, id: &str) -> RegisteredCredential {
            let (algorithm, public_key) = match self {
                Self::Es256(pair) => (CoseAlgorithm::Es256, pair.public_key().as_ref().to_vec()),
                Self::EdDsa(pair) => (CoseAlgorithm::EdDsa, pair.public_key().as_ref().to_vec()),
            };
            RegisteredCredential {
                credential_id: id.to_string(),
                algorithm,
                public_key,
                sign_count: 0,
            }
        }

        pub(crate) fn assert(
            &self,
            id: &str,
            challenge: &str,
            origin: &str,
            rp_id: &str,
            counter: u32,
        ) -> anyhow::Result<AssertionResponse> {
            let client_data = serde_json::json!({
                "type": CLIENT_DATA_TYPE_GET,
                "challenge": challenge,
                "origin": origin,
            })
            .to_string();
            let mut auth_data = Sha256::digest(rp_id.as_bytes()).to_vec();
            auth_data.push(FLAG_USER_PRESENT);
            auth_data.extend_from_slice(&counter.to_be_bytes());

            let mut signed = auth_data.clone();
            signed.extend_from_slice(&Sha256::digest(client_data.as_bytes()));
            let signature = match self {
                Self::Es256(pair) => pair
                    .sign(&SystemRandom::new(), &signed)
                    .map_err(|e| anyhow!("{e}"))?
                    .as_ref()
                    .to_vec(),
                Self::EdDsa(pair) => pair.sign(&signed).as_ref().to_vec(),
            };

            Ok(AssertionResponse {
                credential_id: id.to_string(),
                client_data_json: Base64UrlUnpadded::encode_string(client_data.as_bytes()),
                authenticator_data: Base64UrlUnpadded::encode_string(&auth_data),
                signature: Base64UrlUnpadded::encode_string(&signature),
            })
        }
    }

    fn verifier() -> (WebAuthnVerifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_noon());
        let config = AuthConfig::new().with_relying_party_origin("https://auth.example.com/");
        (WebAuthnVerifier::new(&config, clock.clone()), clock)
    }

    const ORIGIN: &str = "https://auth.example.com";
    const RP_ID: &str = "auth.example.com";

    #[test]
    fn es256_and_ed25519_assertions_verify() -> anyhow::Result<()> {
        let (verifier, _) = verifier();
        for (id, key) in [("ec", TestKey::es256()?), ("ed", TestKey::ed25519()?)] {
            verifier.register("alice", key.credential(id))?;
            let challenge = verifier.begin_assertion("alice")?;
            let assertion = key.assert(id, &challenge, ORIGIN, RP_ID, 1)?;
            assert_eq!(verifier.finish_assertion("alice", &assertion), Ok(()));
        }
        Ok(())
    }

    #[test]
    fn challenge_is_single_use() -> anyhow::Result<()> {
        let (verifier, _) = verifier();
        let key = TestKey::ed25519()?;
        verifier.register("alice", key.credential("k"))?;
        let challenge = verifier.begin_assertion("alice")?;
        let assertion = key.assert("k", &challenge, ORIGIN, RP_ID, 1)?;
        assert_eq!(verifier.finish_assertion("alice", &assertion), Ok(()));
        assert_eq!(
            verifier.finish_assertion("alice", &assertion),
            Err(AuthError::ChallengeAbsent)
        );
        Ok(())
    }

    #[test]
    fn expired_challenge_is_rejected() -> anyhow::Result<()> {
        let (verifier, clock) = verifier();
        let key = TestKey::ed25519()?;
        verifier.register("alice", key.credential("k"))?;
        let challenge = verifier.begin_assertion("alice")?;
        clock.advance_secs(61);
        let assertion = key.assert("k", &challenge, ORIGIN, RP_ID, 1)?;
        assert_eq!(
            verifier.finish_assertion("alice", &assertion),
            Err(AuthError::ChallengeExpired)
        );
        Ok(())
    }

    #[test]
    fn signature_from_another_key_is_rejected() -> anyhow::Result<()> {
        let (verifier, _) = verifier();
        let registered = TestKey::es256()?;
        let attacker = TestKey::es256()?;
        verifier.register("alice", registered.credential("k"))?;
        let challenge = verifier.begin_assertion("alice")?;
        let assertion = attacker.assert("k", &challenge, ORIGIN, RP_ID, 1)?;
        assert_eq!(
            verifier.finish_assertion("alice", &assertion),
            Err(AuthError::AssertionRejected("bad signature"))
        );
        Ok(())
    }

    #[test]
    fn client_data_and_rp_checks() -> anyhow::Result<()> {
        let (verifier, _) = verifier();
        let key = TestKey::ed25519()?;
        verifier.register("alice", key.credential("k"))?;

        let challenge = verifier.begin_assertion("alice")?;
        let assertion = key.assert("k", &challenge, "https://evil.example.com", RP_ID, 1)?;
        assert_eq!(
            verifier.finish_assertion("alice", &assertion),
            Err(AuthError::AssertionRejected("origin mismatch"))
        );

        let _ = verifier.begin_assertion("alice")?;
        let assertion = key.assert("k", "c3RhbGU", ORIGIN, RP_ID, 1)?;
        assert_eq!(
            verifier.finish_assertion("alice", &assertion),
            Err(AuthError::AssertionRejected("challenge mismatch"))
        );

        let challenge = verifier.begin_assertion("alice")?;
        let assertion = key.assert("k", &challenge, ORIGIN, "example.com", 1)?;
        assert_eq!(
            verifier.finish_assertion("alice", &assertion),
            Err(AuthError::AssertionRejected("relying party mismatch"))
        );
        Ok(())
    }

    #[test]
    fn counter_must_increase() -> anyhow::Result<()> {
        let (verifier, _) = verifier();
        let key = TestKey::ed25519()?;
        verifier.register("alice", key.credential("k"))?;

        let challenge = verifier.begin_assertion("alice")?;
        let assertion = key.assert("k", &challenge, ORIGIN, RP_ID, 7)?;
        assert_eq!(verifier.finish_assertion("alice", &assertion), Ok(()));
        assert_eq!(verifier.credentials_of("alice")[0].sign_count, 7);

        let challenge = verifier.begin_assertion("alice")?;
        let cloned = key.assert("k", &challenge, ORIGIN, RP_ID, 7)?;
        assert_eq!(
            verifier.finish_assertion("alice", &cloned),
            Err(AuthError::AssertionRejected("signature counter did not increase"))
        );
        Ok(())
    }

    #[test]
    fn zero_counters_are_accepted_repeatedly() -> anyhow::Result<()> {
        let (verifier, _) = verifier();
        let key = TestKey::es256()?;
        verifier.register("alice", key.credential("k"))?;
        for _ in 0..2 {
            let challenge = verifier.begin_assertion("alice")?;
            let assertion = key.assert("k", &challenge, ORIGIN, RP_ID, 0)?;
            assert_eq!(verifier.finish_assertion("alice", &assertion), Ok(()));
        }
        Ok(())
    }

    #[test]
    fn wrong_key_length_is_refused() {
        let (verifier, _) = verifier();
        let result = verifier.register(
            "alice",
            RegisteredCredential {
                credential_id: "k".to_string(),
                algorithm: CoseAlgorithm::Es256,
                public_key: vec![4; 33],
                sign_count: 0,
            },
        );
        assert!(result.is_err());
        assert!(!verifier.has_credentials("alice"));
    }
}
