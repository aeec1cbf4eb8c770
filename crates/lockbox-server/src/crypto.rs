use anyhow::{Context, Result};
use argon2::{password_hash::SaltString, Argon2, Params, PasswordHasher};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

const NONCE_LEN: usize = 12;

/// 32-byte AEAD key derived from a caller's master key via Argon2id.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Failures opening a sealed value. `Auth` is the one callers care about:
/// it means the master key is wrong or the ciphertext was tampered with, and
/// services map it to a domain-level "masterkey is not correct" outcome
/// instead of a generic internal error.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("message authentication failed")]
    Auth,
    #[error("malformed ciphertext: {0}")]
    Format(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Authenticated encryption of secret values. The caller supplies the master
/// key per call; the server never persists it. The AEAD key is
/// Argon2id(master key, salt), where the salt is derived from the server
/// secret, so ciphertexts are bound to both the account's master key and
/// this deployment.
pub struct CryptoService {
    salt: SaltString,
}

impl CryptoService {
    pub fn new(server_secret: &str) -> Self {
        let digest = Sha256::digest(server_secret.as_bytes());
        let salt = SaltString::encode_b64(&digest[..16]).expect("16-byte salt always encodes");
        Self { salt }
    }

    /// Derive the AEAD key for `master_key`. One derivation covers any number
    /// of seal/open calls under the same master key.
    pub fn derive_key(&self, master_key: &str) -> Result<EncryptionKey> {
        // Derivation runs on every secret operation, so the cost sits at the
        // OWASP interactive baseline rather than a vault-unlock setting.
        let params = Params::new(
            19456, // m_cost: 19 MiB
            2,     // t_cost
            1,     // p_cost
            Some(32),
        )
        .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;

        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
        let hash = argon2
            .hash_password(master_key.as_bytes(), &self.salt)
            .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
        let output = hash.hash.context("no hash output")?;

        let mut key = [0u8; 32];
        key.copy_from_slice(&output.as_bytes()[..32]);
        Ok(EncryptionKey(key))
    }

    /// Seal `plaintext` under a previously derived key. A fresh random nonce
    /// is drawn per call and prepended, so sealing is non-deterministic; the
    /// result is base64 text, safe for a string column.
    pub fn seal(&self, key: &EncryptionKey, plaintext: &str) -> Result<String> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Open a sealed value. Any tag mismatch, whether from wrong key material
    /// or a corrupted ciphertext, is [`CryptoError::Auth`]; undecrypted bytes
    /// are never returned.
    pub fn open(&self, key: &EncryptionKey, sealed: &str) -> Result<String, CryptoError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| CryptoError::Format(format!("invalid base64: {e}")))?;
        if bytes.len() < NONCE_LEN {
            return Err(CryptoError::Format("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Auth)?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Internal(anyhow::anyhow!("plaintext is not UTF-8: {e}")))
    }

    /// Derive-and-seal in one step, for single-value call sites.
    pub fn encrypt(&self, plaintext: &str, master_key: &str) -> Result<String> {
        let key = self.derive_key(master_key)?;
        self.seal(&key, plaintext)
    }

    /// Derive-and-open in one step, for single-value call sites.
    pub fn decrypt(&self, sealed: &str, master_key: &str) -> Result<String, CryptoError> {
        let key = self.derive_key(master_key)?;
        self.open(&key, sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        CryptoService::new("test-server-secret")
    }

    #[test]
    fn round_trip() {
        let cs = service();
        let sealed = cs.encrypt("hello, lockbox!", "master-1").unwrap();
        assert_ne!(sealed, "hello, lockbox!");
        assert_eq!(cs.decrypt(&sealed, "master-1").unwrap(), "hello, lockbox!");
    }

    #[test]
    fn wrong_master_key_is_an_auth_failure() {
        let cs = service();
        let sealed = cs.encrypt("v", "master-1").unwrap();
        assert!(matches!(
            cs.decrypt(&sealed, "master-2").unwrap_err(),
            CryptoError::Auth
        ));
    }

    #[test]
    fn different_server_secret_is_an_auth_failure() {
        let sealed = service().encrypt("v", "master-1").unwrap();
        let other = CryptoService::new("another-secret");
        assert!(matches!(
            other.decrypt(&sealed, "master-1").unwrap_err(),
            CryptoError::Auth
        ));
    }

    #[test]
    fn sealing_is_non_deterministic() {
        let cs = service();
        let key = cs.derive_key("master-1").unwrap();
        let a = cs.seal(&key, "same plaintext").unwrap();
        let b = cs.seal(&key, "same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn any_flipped_bit_fails_authentication() {
        let cs = service();
        let key = cs.derive_key("master-1").unwrap();
        let sealed = cs.seal(&key, "payload").unwrap();
        let bytes = BASE64.decode(&sealed).unwrap();

        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            let reencoded = BASE64.encode(&tampered);
            assert!(
                matches!(cs.open(&key, &reencoded).unwrap_err(), CryptoError::Auth),
                "flip at byte {i} must fail authentication"
            );
        }
    }

    #[test]
    fn malformed_input_is_a_format_error() {
        let cs = service();
        let key = cs.derive_key("master-1").unwrap();
        assert!(matches!(
            cs.open(&key, "%%% not base64 %%%").unwrap_err(),
            CryptoError::Format(_)
        ));
        let short = BASE64.encode([0u8; 4]);
        assert!(matches!(
            cs.open(&key, &short).unwrap_err(),
            CryptoError::Format(_)
        ));
    }
}
