//! At-rest sealing for proprietary remote scripts.
//!
//! Layout: `LNS1 | nonce[16] | ciphertext | tag[32]`. The keystream is the
//! keyed blake3 XOF over the nonce; the tag is a keyed blake3 hash of
//! `nonce | ciphertext` under a key derived from the session key.

use rand::RngCore;

const MAGIC: &[u8; 4] = b"LNS1";
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const MAC_CONTEXT: &str = "lantern 2024 sealed script mac";

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    pub fn from_hex(text: &str) -> Result<Self, String> {
        blake3::Hash::from_hex(text.trim())
            .map(|hash| Self(*hash.as_bytes()))
            .map_err(|e| format!("invalid session key: {e}"))
    }

    /// Stretches an arbitrary passphrase into a key.
    pub fn derive(passphrase: &str) -> Self {
        Self(blake3::derive_key("lantern 2024 session key", passphrase.as_bytes()))
    }

    #[cfg(test)]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

pub fn is_sealed(data: &[u8]) -> bool {
    data.len() >= MAGIC.len() + NONCE_LEN + TAG_LEN && data.starts_with(MAGIC)
}

fn apply_keystream(key: &SessionKey, nonce: &[u8], data: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(&key.0);
    hasher.update(nonce);
    let mut reader = hasher.finalize_xof();
    let mut block = [0u8; 64];
    for chunk in data.chunks_mut(block.len()) {
        reader.fill(&mut block[..chunk.len()]);
        for (byte, ks) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= ks;
        }
    }
}

fn tag(key: &SessionKey, nonce: &[u8], ciphertext: &[u8]) -> blake3::Hash {
    let mac_key = blake3::derive_key(MAC_CONTEXT, &key.0);
    let mut hasher = blake3::Hasher::new_keyed(&mac_key);
    hasher.update(nonce);
    hasher.update(ciphertext);
    hasher.finalize()
}

pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + plaintext.len() + TAG_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&nonce);
    let body_start = out.len();
    out.extend_from_slice(plaintext);
    apply_keystream(key, &nonce, &mut out[body_start..]);
    let mac = tag(key, &nonce, &out[body_start..]);
    out.extend_from_slice(mac.as_bytes());
    out
}

pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, String> {
    if !is_sealed(sealed) {
        return Err("not a sealed script".to_string());
    }
    let nonce = &sealed[MAGIC.len()..MAGIC.len() + NONCE_LEN];
    let body = &sealed[MAGIC.len() + NONCE_LEN..sealed.len() - TAG_LEN];
    let mut expected = [0u8; TAG_LEN];
    expected.copy_from_slice(&sealed[sealed.len() - TAG_LEN..]);
    // blake3::Hash equality is constant time.
    if tag(key, nonce, body) != blake3::Hash::from(expected) {
        return Err("sealed script failed authentication (wrong session key?)".to_string());
    }
    let mut plain = body.to_vec();
    apply_keystream(key, nonce, &mut plain);
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_recovers_sealed_source() {
        let key = SessionKey::derive("unit-test");
        let source = b"function on_paint() end\n".repeat(10);
        let sealed = seal(&key, &source);
        assert!(is_sealed(&sealed));
        assert_ne!(&sealed[4 + 16..4 + 16 + source.len()], &source[..]);
        assert_eq!(open(&key, &sealed).expect("open"), source);
    }

    #[test]
    fn wrong_key_or_tampering_fails() {
        let key = SessionKey::derive("a");
        let mut sealed = seal(&key, b"print(1)");
        assert!(open(&SessionKey::derive("b"), &sealed).is_err());
        let mid = sealed.len() / 2;
        sealed[mid] ^= 1;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn hex_keys_round_through_text() {
        let key = SessionKey::derive("hex");
        assert_eq!(SessionKey::from_hex(&key.to_hex()).expect("parse"), key);
        assert!(SessionKey::from_hex("abc").is_err());
    }
}
