use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

/// AEAD cipher for credential blobs at rest.
///
/// Sealed layout: 12-byte random nonce followed by ciphertext+tag. The key is
/// the base64-decoded `encryption_key` config value and must be 32 bytes.
pub struct BlobCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl BlobCipher {
    pub fn new(key_base64: &str) -> Result<Self> {
        let key_bytes = general_purpose::STANDARD
            .decode(key_base64)
            .context("encryption key is not valid base64")?;
        if key_bytes.len() != 32 {
            bail!(
                "encryption key must decode to 32 bytes, got {}",
                key_bytes.len()
            );
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| anyhow::anyhow!("failed to construct AES-256-GCM key"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("failed to generate nonce"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| anyhow::anyhow!("sealing failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + buffer.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&buffer);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            bail!("sealed blob too short");
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| anyhow::anyhow!("invalid nonce"))?;

        let mut buffer = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| anyhow::anyhow!("opening failed, wrong key or corrupt blob"))?;
        Ok(plaintext.to_vec())
    }
}

/// Generate a fresh base64 key suitable for the `encryption_key` option.
pub fn generate_key_base64() -> Result<String> {
    let rng = SystemRandom::new();
    let mut key = [0u8; 32];
    rng.fill(&mut key)
        .map_err(|_| anyhow::anyhow!("failed to generate key material"))?;
    Ok(general_purpose::STANDARD.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = generate_key_base64().unwrap();
        let cipher = BlobCipher::new(&key).unwrap();

        let sealed = cipher.seal(b"session state").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"session state");

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened, b"session state");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let cipher_a = BlobCipher::new(&generate_key_base64().unwrap()).unwrap();
        let cipher_b = BlobCipher::new(&generate_key_base64().unwrap()).unwrap();

        let sealed = cipher_a.seal(b"secret").unwrap();
        assert!(cipher_b.open(&sealed).is_err());
    }

    #[test]
    fn rejects_short_key() {
        let short = general_purpose::STANDARD.encode([0u8; 16]);
        assert!(BlobCipher::new(&short).is_err());
    }
}
