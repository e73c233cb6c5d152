//! 机密参数的加解密
//!
//! 密文以"enc:"前缀落库，格式为 base64(nonce || ciphertext || tag)。
//! 密钥从 TASKHUB_SECRET_KEY 环境变量读取（base64编码的32字节）。

use base64::{engine::general_purpose, Engine as _};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};

use taskhub_errors::{HubError, HubResult};

pub const SECRET_PREFIX: &str = "enc:";

const KEY_ENV: &str = "TASKHUB_SECRET_KEY";
const NONCE_LEN: usize = 12;

pub struct SecretCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SecretCipher {
    pub fn from_env() -> HubResult<Self> {
        let encoded = std::env::var(KEY_ENV)
            .map_err(|_| HubError::Crypto(format!("缺少密钥环境变量 {KEY_ENV}")))?;
        Self::from_base64_key(&encoded)
    }

    pub fn from_base64_key(encoded: &str) -> HubResult<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| HubError::Crypto(format!("密钥不是合法的base64: {e}")))?;
        if bytes.len() != 32 {
            return Err(HubError::Crypto(format!(
                "密钥长度必须为32字节，实际{}字节",
                bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&aead::AES_256_GCM, &bytes)
            .map_err(|_| HubError::Crypto("密钥初始化失败".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(SECRET_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> HubResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| HubError::Crypto("随机数生成失败".to_string()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| HubError::Crypto("加密失败".to_string()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&in_out);
        Ok(format!("{SECRET_PREFIX}{}", general_purpose::STANDARD.encode(blob)))
    }

    /// 解密"enc:"前缀的密文；明文值原样返回
    pub fn decrypt(&self, value: &str) -> HubResult<String> {
        let Some(encoded) = value.strip_prefix(SECRET_PREFIX) else {
            return Ok(value.to_string());
        };
        let blob = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| HubError::Crypto(format!("密文不是合法的base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(HubError::Crypto("密文长度不足".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| HubError::Crypto("密文nonce无效".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| HubError::Crypto("解密失败，密钥不匹配或密文被篡改".to_string()))?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| HubError::Crypto("解密结果不是合法的UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        let key = general_purpose::STANDARD.encode([7u8; 32]);
        SecretCipher::from_base64_key(&key).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let encrypted = cipher.encrypt("db-password-123").unwrap();
        assert!(SecretCipher::is_encrypted(&encrypted));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "db-password-123");
    }

    #[test]
    fn test_plaintext_passes_through() {
        let cipher = test_cipher();
        assert_eq!(cipher.decrypt("not-encrypted").unwrap(), "not-encrypted");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = test_cipher();
        let encrypted = cipher.encrypt("secret").unwrap();

        let other_key = general_purpose::STANDARD.encode([9u8; 32]);
        let other = SecretCipher::from_base64_key(&other_key).unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        let short = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(SecretCipher::from_base64_key(&short).is_err());
    }

    #[test]
    fn test_nonce_makes_ciphertext_unique() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same-input").unwrap();
        let b = cipher.encrypt("same-input").unwrap();
        assert_ne!(a, b);
    }
}
