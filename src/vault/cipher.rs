//! Secret encryption using AES-256-GCM with PBKDF2 key derivation.
//!
//! Stored ciphertext format: `base64(salt || nonce || ciphertext || tag)`.
//! Salt and nonce are random per encryption, so encrypting the same
//! plaintext twice yields different ciphertexts.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{VaultError, VaultResult};

/// Size of the salt for key derivation
const SALT_SIZE: usize = 16;
/// Size of the nonce for AES-GCM
const NONCE_SIZE: usize = 12;
/// PBKDF2 iteration count
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key size (256 bits)
const KEY_SIZE: usize = 32;

/// Symmetric cipher bound to the vault passphrase
pub struct SecretCipher {
    passphrase: Zeroizing<String>,
}

impl SecretCipher {
    pub fn new(passphrase: String) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase),
        }
    }

    /// Encrypt plaintext into the stored base64 format
    pub fn encrypt(&self, plaintext: &str) -> VaultResult<String> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = derive_key(&self.passphrase, &salt);

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| VaultError::Crypto(format!("cipher init failed: {e}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("encryption failed: {e:?}")))?;

        let mut blob = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt the stored base64 format back to plaintext
    pub fn decrypt(&self, stored: &str) -> VaultResult<Zeroizing<String>> {
        let blob = BASE64
            .decode(stored)
            .map_err(|e| VaultError::Crypto(format!("invalid ciphertext encoding: {e}")))?;

        if blob.len() < SALT_SIZE + NONCE_SIZE {
            return Err(VaultError::Crypto("ciphertext too short".into()));
        }

        let (salt, rest) = blob.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let key = derive_key(&self.passphrase, salt);

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| VaultError::Crypto(format!("cipher init failed: {e}")))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Crypto("decryption failed (wrong passphrase?)".into()))?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Crypto("decrypted payload is not UTF-8".into()))
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    Zeroizing::new(pbkdf2_hmac_array::<Sha256, KEY_SIZE>(
        passphrase.as_bytes(),
        salt,
        PBKDF2_ITERATIONS,
    ))
}
