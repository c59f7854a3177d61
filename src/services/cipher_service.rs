//! 字段级认证加密
//!
//! 256 位密钥在进程启动时由 Argon2 从主密钥和固定盐派生一次，
//! 每次加密使用新的 96 位随机 IV。密文信封格式为十六进制的 `iv:tag:ciphertext`。

use crate::services::privacy_service::PrivacyError;
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use argon2::Argon2;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use serde_json::Value;

const KEY_SALT: &[u8] = b"market-guard-field-encryption";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn new(master_secret: &Secret<String>) -> Result<Self, PrivacyError> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(master_secret.expose_secret().as_bytes(), KEY_SALT, &mut key)
            .map_err(|e| PrivacyError::KeyDerivation(e.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| PrivacyError::KeyDerivation(e.to_string()))?;
        key.fill(0);

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, PrivacyError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| PrivacyError::Encryption)?;

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(buffer)
        ))
    }

    /// 先校验认证标签，失败时不返回任何明文
    pub fn decrypt(&self, envelope: &str) -> Result<String, PrivacyError> {
        let parts: Vec<&str> = envelope.split(':').collect();
        let [iv_hex, tag_hex, ct_hex] = parts.as_slice() else {
            return Err(PrivacyError::MalformedEnvelope("expected iv:tag:ciphertext".to_string()));
        };

        let decode = |part: &str, what: &str| {
            hex::decode(part)
                .map_err(|_| PrivacyError::MalformedEnvelope(format!("{} is not hex", what)))
        };
        let iv = decode(iv_hex, "iv")?;
        let tag = decode(tag_hex, "tag")?;
        let mut buffer = decode(ct_hex, "ciphertext")?;

        if iv.len() != IV_LEN {
            return Err(PrivacyError::MalformedEnvelope(format!("iv must be {} bytes", IV_LEN)));
        }
        if tag.len() != TAG_LEN {
            return Err(PrivacyError::MalformedEnvelope(format!("tag must be {} bytes", TAG_LEN)));
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| PrivacyError::Decryption)?;

        String::from_utf8(buffer).map_err(|_| PrivacyError::Decryption)
    }

    /// 加密指定的顶层字段；空值跳过，非字符串按 JSON 文本加密
    pub fn encrypt_fields(&self, data: &Value, fields: &[&str]) -> Result<Value, PrivacyError> {
        let mut out = data.clone();
        if let Value::Object(map) = &mut out {
            for field in fields {
                if let Some(value) = map.get_mut(*field) {
                    let plain = match &*value {
                        Value::Null => continue,
                        Value::String(s) if s.is_empty() => continue,
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    *value = Value::String(self.encrypt(&plain)?);
                }
            }
        }
        Ok(out)
    }

    /// 任一字段解密失败则整体失败
    pub fn decrypt_fields(&self, data: &Value, fields: &[&str]) -> Result<Value, PrivacyError> {
        let mut out = data.clone();
        if let Value::Object(map) = &mut out {
            for field in fields {
                if let Some(value) = map.get_mut(*field) {
                    let envelope = match &*value {
                        Value::Null => continue,
                        Value::String(s) => s.clone(),
                        _ => {
                            return Err(PrivacyError::MalformedEnvelope(format!(
                                "field {} is not an envelope",
                                field
                            )))
                        }
                    };
                    *value = Value::String(self.decrypt(&envelope).map_err(|e| {
                        tracing::warn!(field = *field, "Field decryption failed");
                        e
                    })?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use serde_json::json;

    static CIPHER: Lazy<FieldCipher> = Lazy::new(|| {
        FieldCipher::new(&Secret::new("unit-test-master-secret-with-32-chars!".to_string())).unwrap()
    });

    #[test]
    fn test_roundtrip_unicode() {
        for plain in ["", "9876543210", "किसान बाजार", "emoji 🌾 ok", "a:b:c"] {
            let envelope = CIPHER.encrypt(plain).unwrap();
            assert_eq!(CIPHER.decrypt(&envelope).unwrap(), plain);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let a = CIPHER.encrypt("same").unwrap();
        let b = CIPHER.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.split(':').next().unwrap().len(), IV_LEN * 2);
    }

    #[test]
    fn test_any_bit_flip_fails_closed() {
        let envelope = CIPHER.encrypt("account 123456789012").unwrap();
        let raw: Vec<&str> = envelope.split(':').collect();

        for (part_idx, part) in raw.iter().enumerate() {
            let mut bytes = hex::decode(part).unwrap();
            for byte_idx in 0..bytes.len() {
                for bit in 0..8 {
                    bytes[byte_idx] ^= 1 << bit;
                    let mut parts: Vec<String> = raw.iter().map(|s| s.to_string()).collect();
                    parts[part_idx] = hex::encode(&bytes);
                    assert!(CIPHER.decrypt(&parts.join(":")).is_err());
                    bytes[byte_idx] ^= 1 << bit;
                }
            }
        }
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(matches!(
            CIPHER.decrypt("abcd"),
            Err(PrivacyError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            CIPHER.decrypt("zz:zz:zz"),
            Err(PrivacyError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            CIPHER.decrypt("00:00000000000000000000000000000000:00"),
            Err(PrivacyError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_field_helpers() {
        let record = json!({"name": "Asha", "phone": "9876543210", "upiId": null});
        let encrypted = CIPHER.encrypt_fields(&record, &["phone", "upiId"]).unwrap();
        assert_ne!(encrypted["phone"], record["phone"]);
        assert_eq!(encrypted["upiId"], Value::Null);
        assert_eq!(encrypted["name"], "Asha");

        let decrypted = CIPHER.decrypt_fields(&encrypted, &["phone"]).unwrap();
        assert_eq!(decrypted, record);

        let mixed = json!({"address": "12 Market Road", "pin": 422001, "upiId": ""});
        let encrypted = CIPHER.encrypt_fields(&mixed, &["address", "pin", "upiId"]).unwrap();
        assert_eq!(encrypted["upiId"], "");
        let decrypted = CIPHER.decrypt_fields(&encrypted, &["address", "pin"]).unwrap();
        assert_eq!(decrypted["address"], "12 Market Road");
        assert_eq!(decrypted["pin"], "422001");

        let broken = json!({"phone": "00:11:22"});
        assert!(CIPHER.decrypt_fields(&broken, &["phone"]).is_err());
    }
}
