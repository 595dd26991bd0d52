use crate::error::{PearlError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Compute SHA256 hash of data, hex encoded.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Deterministic ledger address of one chunk slot.
pub fn chunk_address(file_identifier: &str, physical_index: u64) -> String {
    compute_hash(format!("{}:{}", file_identifier, physical_index).as_bytes())
}

/// Seals escrow credentials so they never sit in the database as plaintext.
#[derive(Clone)]
pub struct CredentialSealer {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSealer").finish_non_exhaustive()
    }
}

impl CredentialSealer {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(PearlError::Config(
                "credential secret cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            key: derive_key(secret.as_bytes()),
        })
    }

    /// Key for one buried reward. The seed comes from the uploader, who
    /// derives it from the file contents; the identifier and sector are public.
    pub fn for_reward(reward_seed: &str, file_identifier: &str, sector: u64) -> Result<Self> {
        if reward_seed.trim().is_empty() {
            return Err(PearlError::InvalidRequest(
                "reward seed cannot be empty".to_string(),
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(reward_seed.as_bytes());
        hasher.update([0u8]);
        hasher.update(file_identifier.as_bytes());
        hasher.update([0u8]);
        hasher.update(sector.to_be_bytes());
        Ok(Self {
            key: hasher.finalize().into(),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| PearlError::Crypto(format!("seal failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = hex::decode(sealed)
            .map_err(|e| PearlError::Crypto(format!("sealed value is not hex: {}", e)))?;
        if raw.len() <= NONCE_LEN {
            return Err(PearlError::Crypto("sealed value too short".to_string()));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| PearlError::Crypto(format!("open failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| PearlError::Crypto(format!("opened value is not utf-8: {}", e)))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| PearlError::Crypto(format!("invalid key: {}", e)))
    }
}

fn derive_key(material: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(material);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_chunk_address_is_deterministic() {
        assert_eq!(chunk_address("genesis", 3), chunk_address("genesis", 3));
        assert_ne!(chunk_address("genesis", 3), chunk_address("genesis", 4));
    }

    #[test]
    fn test_seal_and_open() {
        let sealer = CredentialSealer::new("node-secret").unwrap();
        let sealed = sealer.seal("escrow-private-key").unwrap();
        assert!(!sealed.contains("escrow-private-key"));
        assert_eq!(sealer.open(&sealed).unwrap(), "escrow-private-key");

        // fresh nonce per seal
        assert_ne!(sealed, sealer.seal("escrow-private-key").unwrap());
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = CredentialSealer::for_reward("seed", "genesis", 0)
            .unwrap()
            .seal("reward-key")
            .unwrap();
        assert!(
            CredentialSealer::for_reward("seed", "genesis", 1)
                .unwrap()
                .open(&sealed)
                .is_err()
        );
        assert_eq!(
            CredentialSealer::for_reward("seed", "genesis", 0)
                .unwrap()
                .open(&sealed)
                .unwrap(),
            "reward-key"
        );
        assert!(CredentialSealer::new("").is_err());
    }

    #[test]
    fn test_reward_key_needs_the_seed() {
        let sealed = CredentialSealer::for_reward("chunk-hash-chain", "genesis", 2)
            .unwrap()
            .seal("reward-key")
            .unwrap();

        // everything public about the slot is not enough
        for public in ["genesis/2", "genesis:2", "genesis", "2"] {
            assert!(CredentialSealer::new(public).unwrap().open(&sealed).is_err());
        }
        assert!(
            CredentialSealer::for_reward("other-seed", "genesis", 2)
                .unwrap()
                .open(&sealed)
                .is_err()
        );
        assert!(matches!(
            CredentialSealer::for_reward(" ", "genesis", 2),
            Err(PearlError::InvalidRequest(_))
        ));
    }
}
