//! Request payload sealing. The symmetric key is derived from the machine id,
//! so only local processes can produce payloads the daemon accepts.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

pub fn machine_id_path() -> &'static str {
    "/etc/machine-id"
}

pub async fn read_machine_id() -> Option<String> {
    match tokio::fs::read_to_string(machine_id_path()).await {
        Ok(id) => {
            let id = id.trim().to_string();
            if id.is_empty() {
                None
            } else {
                Some(id)
            }
        }
        Err(_) => None,
    }
}

pub fn derive_key(machine_id: &str) -> [u8; 32] {
    Sha256::digest(machine_id.as_bytes()).into()
}

/// `base64(nonce + ciphertext)` with AES-256-GCM.
pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Option<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext.as_bytes()).ok()?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Some(BASE64.encode(sealed))
}

pub fn decrypt(payload: &str, key: &[u8; 32]) -> Option<String> {
    let sealed = BASE64.decode(payload.trim()).ok()?;
    if sealed.len() <= NONCE_LEN {
        return None;
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
    String::from_utf8(plaintext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let key = derive_key("8c41f5166ae24b7fa45c243fb4a7b89d");
        let sealed = encrypt("{\"pid\": 42}", &key).unwrap();
        assert_eq!(decrypt(&sealed, &key).as_deref(), Some("{\"pid\": 42}"));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt("secret", &derive_key("machine-a")).unwrap();
        assert!(decrypt(&sealed, &derive_key("machine-b")).is_none());
    }

    #[test]
    fn garbage_payload_fails() {
        let key = derive_key("id");
        assert!(decrypt("not base64!!", &key).is_none());
        assert!(decrypt("aGVsbG8=", &key).is_none());
    }
}
