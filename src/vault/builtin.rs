use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for small secrets stored as text.
///
/// Sealed values are `base64(nonce || ciphertext)`, so they fit the plain
/// `TEXT` value column of the key/value table.
pub struct TokenSealer {
    cipher: Aes256Gcm,
}

impl TokenSealer {
    pub fn new(master_key_hex: &str) -> anyhow::Result<Self> {
        let mut key = parse_master_key(master_key_hex)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("invalid key length: {:?}", e));
        key.zeroize();
        Ok(Self { cipher: cipher? })
    }

    pub fn seal(&self, plaintext: &str) -> anyhow::Result<String> {
        let nonce_bytes = generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("sealing failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    pub fn open(&self, sealed: &str) -> anyhow::Result<String> {
        let blob = base64::engine::general_purpose::STANDARD.decode(sealed.trim())?;
        if blob.len() <= NONCE_LEN {
            anyhow::bail!("sealed value too short ({} bytes)", blob.len());
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow::anyhow!("unsealing failed: {}", e))?;

        let text = String::from_utf8(plaintext.clone());
        plaintext.zeroize();
        Ok(text?)
    }
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn parse_master_key(hex: &str) -> anyhow::Result<[u8; 32]> {
    if hex.len() != 64 {
        anyhow::bail!(
            "REELGATE_MASTER_KEY must be 64 hex chars (32 bytes), got {} chars",
            hex.len()
        );
    }
    let bytes = hex::decode(hex)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
