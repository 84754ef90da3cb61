use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

pub const TOKEN_CACHE_KEY_ENV: &str = "MAILWATCH_TOKEN_CACHE_KEY";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

/// AES-256-GCM sealing for the token cache file.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_BYTES],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    /// Reads the key from `MAILWATCH_TOKEN_CACHE_KEY`; unset means plaintext.
    pub fn from_env() -> Result<Option<Self>, MonitorError> {
        std::env::var(TOKEN_CACHE_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|value| Self::from_hex(&value))
            .transpose()
    }

    pub fn from_hex(raw: &str) -> Result<Self, MonitorError> {
        let decoded = hex_decode(raw)?;
        let key: [u8; KEY_BYTES] = decoded.try_into().map_err(|_| {
            corrupt(format!(
                "{TOKEN_CACHE_KEY_ENV} must be 64 hex characters (32 bytes)"
            ))
        })?;
        Ok(Self { key })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, MonitorError> {
        let key = self.aead_key()?;
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| corrupt("generate random nonce for token cache"))?;

        let mut buffer = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut buffer,
        )
        .map_err(|_| corrupt("encrypt token cache"))?;

        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            nonce_hex: hex_encode(&nonce_bytes),
            ciphertext_hex: hex_encode(&buffer),
        };
        serde_json::to_string(&envelope).map_err(|error| corrupt(error.to_string()))
    }

    pub fn open(&self, raw: &str) -> Result<Vec<u8>, MonitorError> {
        let envelope: SealedEnvelope =
            serde_json::from_str(raw).map_err(|error| corrupt(error.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(corrupt(format!(
                "unsupported token envelope version {}",
                envelope.version
            )));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(&envelope.nonce_hex)?
            .try_into()
            .map_err(|_| corrupt("invalid nonce length in token envelope"))?;
        let mut ciphertext = hex_decode(&envelope.ciphertext_hex)?;

        let key = self.aead_key()?;
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| corrupt("decrypt token cache"))?;
        Ok(plaintext.to_vec())
    }

    fn aead_key(&self) -> Result<LessSafeKey, MonitorError> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| corrupt("construct AES-256-GCM key"))?;
        Ok(LessSafeKey::new(unbound))
    }
}

fn corrupt(message: impl Into<String>) -> MonitorError {
    MonitorError::CacheCorrupt(message.into())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, MonitorError> {
    let bytes = raw.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(corrupt("hex string length must be even"));
    }

    bytes
        .chunks(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(corrupt("invalid hex digit")),
        })
        .collect()
}

fn nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
