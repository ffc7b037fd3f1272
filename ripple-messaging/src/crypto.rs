//! Room payload encryption.
//!
//! Every room owns immutable symmetric key material created at room
//! creation: a 32-byte key derived with scrypt from a fixed password and a
//! random salt, plus a random 16-byte IV. The hex-encoded pair is wrapped
//! as JSON under the process-wide master key/IV (AES-CBC, PKCS7) and stored
//! base64-of-hex as the room's `encryption_data`. Message bodies are
//! AES-CBC encrypted under the unwrapped room key and travel hex-then-base64.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SCRYPT_LOG_N: u8 = 14; // N = 16384
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const ROOM_KEY_LEN: usize = 32;
const ROOM_IV_LEN: usize = 16;
const KEY_PASSWORD: &[u8] = b"ripple-room-key";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("invalid hex payload")]
    InvalidHex,
    #[error("ciphertext length is not a cipher block multiple")]
    InvalidLength,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("message is empty")]
    EmptyMessage,
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Hex-encoded key/IV pair as serialized inside the wrapped blob.
#[derive(Serialize, Deserialize)]
struct KeyMaterial {
    key: String,
    iv: String,
}

/// AES-CBC over a 16/24/32-byte key; the variant follows the key length,
/// so whatever master key operators configure keeps working.
fn cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, iv)
            .map(|cipher| cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
            .map_err(|_| CryptoError::InvalidKeyMaterial),
        24 => Aes192CbcEnc::new_from_slices(key, iv)
            .map(|cipher| cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
            .map_err(|_| CryptoError::InvalidKeyMaterial),
        32 => Aes256CbcEnc::new_from_slices(key, iv)
            .map(|cipher| cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
            .map_err(|_| CryptoError::InvalidKeyMaterial),
        _ => Err(CryptoError::InvalidKeyMaterial),
    }
}

fn cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CryptoError::InvalidPadding),
        24 => Aes192CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CryptoError::InvalidPadding),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| CryptoError::InvalidPadding),
        _ => Err(CryptoError::InvalidKeyMaterial),
    }
}

/// Process-wide codec holding the master key material from configuration.
#[derive(Clone)]
pub struct MessageCipher {
    master_key: Vec<u8>,
    master_iv: [u8; 16],
}

impl MessageCipher {
    pub fn new(master_key_hex: &str, master_iv_hex: &str) -> Result<Self, CryptoError> {
        let key = hex::decode(master_key_hex).map_err(|_| CryptoError::InvalidHex)?;
        let iv = hex::decode(master_iv_hex).map_err(|_| CryptoError::InvalidHex)?;

        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(CryptoError::InvalidKeyMaterial);
        }

        Ok(Self {
            master_key: key,
            master_iv: iv.try_into().map_err(|_| CryptoError::InvalidKeyMaterial)?,
        })
    }

    /// Create fresh key material for a new room and return the wrapped
    /// `encryption_data` blob.
    pub fn generate_room_key(&self) -> Result<String, CryptoError> {
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; ROOM_IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, ROOM_KEY_LEN)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let mut key = [0u8; ROOM_KEY_LEN];
        scrypt::scrypt(KEY_PASSWORD, &salt, &params, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let material = KeyMaterial {
            key: hex::encode(key),
            iv: hex::encode(iv),
        };
        let wrapped_hex = self.wrap_key_material(&material)?;
        Ok(hex_to_base64(&wrapped_hex)?)
    }

    /// Encrypt a plaintext message under a room's wrapped key material.
    pub fn encrypt_message(&self, plain: &str, encryption_data: &str) -> Result<String, CryptoError> {
        if plain.is_empty() {
            return Err(CryptoError::EmptyMessage);
        }
        let (key, iv) = self.unwrap_key_material(encryption_data)?;
        let encrypted = cbc_encrypt(&key, &iv, plain.as_bytes())?;

        hex_to_base64(&hex::encode(encrypted))
    }

    /// Decrypt a base64-of-hex ciphertext under a room's wrapped key material.
    pub fn decrypt_message(
        &self,
        ciphertext: &str,
        encryption_data: &str,
    ) -> Result<String, CryptoError> {
        if ciphertext.is_empty() {
            return Err(CryptoError::EmptyMessage);
        }
        let (key, iv) = self.unwrap_key_material(encryption_data)?;

        let encrypted = base64_to_bytes(ciphertext)?;
        if encrypted.is_empty() || encrypted.len() % 16 != 0 {
            return Err(CryptoError::InvalidLength);
        }

        let plain = cbc_decrypt(&key, &iv, &encrypted)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidPadding)
    }

    fn wrap_key_material(&self, material: &KeyMaterial) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(material).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let encrypted = cbc_encrypt(&self.master_key, &self.master_iv, &json)?;
        Ok(hex::encode(encrypted))
    }

    fn unwrap_key_material(&self, encryption_data: &str) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let wrapped = base64_to_bytes(encryption_data)?;
        if wrapped.is_empty() || wrapped.len() % 16 != 0 {
            return Err(CryptoError::InvalidLength);
        }

        let json = cbc_decrypt(&self.master_key, &self.master_iv, &wrapped)?;

        let material: KeyMaterial =
            serde_json::from_slice(&json).map_err(|_| CryptoError::InvalidKeyMaterial)?;

        let key = hex::decode(&material.key).map_err(|_| CryptoError::InvalidHex)?;
        let iv = hex::decode(&material.iv).map_err(|_| CryptoError::InvalidHex)?;
        if key.len() != ROOM_KEY_LEN || iv.len() != ROOM_IV_LEN {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        Ok((key, iv))
    }
}

/// Storage format helpers. Payloads are carried base64-encoded over the
/// wire but the cipher pipeline works on hex strings, matching the format
/// of `encryption_data` blobs written by existing deployments.
fn hex_to_base64(hex_str: &str) -> Result<String, CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidHex)?;
    Ok(BASE64.encode(bytes))
}

fn base64_to_bytes(b64: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(b64).map_err(|_| CryptoError::InvalidBase64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> MessageCipher {
        MessageCipher::new(
            "000102030405060708090a0b0c0d0e0f",
            "f0e0d0c0b0a090807060504030201000",
        )
        .unwrap()
    }

    #[test]
    fn master_key_length_selects_the_cipher() {
        let iv = "f0e0d0c0b0a090807060504030201000";

        // 16, 24 and 32 byte keys are all valid AES material.
        for key in [
            "000102030405060708090a0b0c0d0e0f",
            "000102030405060708090a0b0c0d0e0f0001020304050607",
            "000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f",
        ] {
            let cipher = MessageCipher::new(key, iv).unwrap();
            let encryption_data = cipher.generate_room_key().unwrap();
            let encrypted = cipher.encrypt_message("hola", &encryption_data).unwrap();
            assert_eq!(cipher.decrypt_message(&encrypted, &encryption_data).unwrap(), "hola");
        }

        // Anything else is not an AES key.
        assert!(MessageCipher::new("0011", iv).is_err());
        assert!(MessageCipher::new("000102030405060708090a0b0c0d0e0f00", iv).is_err());
        assert!(MessageCipher::new("zz0102030405060708090a0b0c0d0e0f", "00").is_err());
    }

    #[test]
    fn round_trip() {
        let cipher = test_cipher();
        let encryption_data = cipher.generate_room_key().unwrap();

        let plain = "hola, ¿cómo estás?";
        let encrypted = cipher.encrypt_message(plain, &encryption_data).unwrap();
        assert_ne!(encrypted, plain);

        let decrypted = cipher.decrypt_message(&encrypted, &encryption_data).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn each_room_gets_distinct_material() {
        let cipher = test_cipher();
        let a = cipher.generate_room_key().unwrap();
        let b = cipher.generate_room_key().unwrap();
        assert_ne!(a, b);

        // A message encrypted for room A must not decrypt cleanly for room B.
        let encrypted = cipher.encrypt_message("payload", &a).unwrap();
        let cross = cipher.decrypt_message(&encrypted, &b);
        assert!(cross.map(|p| p != "payload").unwrap_or(true));
    }

    #[test]
    fn empty_message_is_rejected() {
        let cipher = test_cipher();
        let encryption_data = cipher.generate_room_key().unwrap();
        assert!(matches!(
            cipher.encrypt_message("", &encryption_data),
            Err(CryptoError::EmptyMessage)
        ));
    }

    #[test]
    fn malformed_ciphertext_is_rejected() {
        let cipher = test_cipher();
        let encryption_data = cipher.generate_room_key().unwrap();

        assert!(matches!(
            cipher.decrypt_message("not-base64!!!", &encryption_data),
            Err(CryptoError::InvalidBase64)
        ));

        // Valid base64 but not a block multiple.
        let short = BASE64.encode([1u8, 2, 3]);
        assert!(matches!(
            cipher.decrypt_message(&short, &encryption_data),
            Err(CryptoError::InvalidLength)
        ));
    }

    #[test]
    fn garbage_encryption_data_is_rejected() {
        let cipher = test_cipher();
        let err = cipher.encrypt_message("hi", "!!!").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidBase64));
    }
}
