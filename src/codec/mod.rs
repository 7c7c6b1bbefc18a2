//! codec — конвейер преобразования байтов записи: compress → encrypt.
//!
//! Политика:
//! - Порядок на encode строго "сжать, затем зашифровать"; decode зеркален.
//! - Вид кодека фиксируется при создании БД (хранится в DatabaseHeader);
//!   открытие с другим кодеком — config mismatch на уровне engine/open.
//! - AES-256-GCM: свежий случайный 96-битный nonce на каждый encode,
//!   выход = nonce ‖ ciphertext+tag. Ошибка проверки тега — "auth failed".
//! - Ключ: парольная строка конфига (≥16 байт) растягивается SHA-256 до
//!   32 байт; материал ключа зануляется при уничтожении (Zeroize).

use anyhow::{anyhow, Result};
use std::fmt;
use std::io::{Read, Write};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Длина nonce AES-GCM, байт.
pub const GCM_NONCE_LEN: usize = 12;

/// true, если где-то в цепочке ошибки лежит AEAD-отказ. Читающие пути
/// гасят прочие ошибки в None, но отказ аутентификации поднимают наружу.
pub fn is_auth_error(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.to_string().contains("auth failed"))
}

// ---------- виды сжатия / шифрования ----------

/// Алгоритм сжатия записи. Хранится как u8 в DatabaseHeader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None = 0,
    Gzip = 1,
    Deflate = 2,
    Brotli = 3,
    Lz4 = 4,
    Zstd = 5,
    Snappy = 6,
    Lzma = 7,
}

impl CompressionKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Deflate),
            3 => Some(Self::Brotli),
            4 => Some(Self::Lz4),
            5 => Some(Self::Zstd),
            6 => Some(Self::Snappy),
            7 => Some(Self::Lzma),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "brotli",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
            Self::Lzma => "lzma",
        };
        write!(f, "{}", s)
    }
}

/// Алгоритм шифрования записи. Хранится как u8 в DatabaseHeader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionKind {
    None = 0,
    Aes256Gcm = 1,
}

impl EncryptionKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Aes256Gcm),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Aes256Gcm => write!(f, "aes-256-gcm"),
        }
    }
}

// ---------- материал ключа ----------

/// 32-байтный материал ключа AEAD; стирается из памяти в Drop.
struct KeyBytes([u8; 32]);

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Растянуть парольную строку в 32-байтный ключ (SHA-256).
fn derive_key(passphrase: &str) -> Result<KeyBytes> {
    if passphrase.len() < 16 {
        return Err(anyhow!(
            "encryption key must be at least 16 bytes, got {}",
            passphrase.len()
        ));
    }
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(KeyBytes(key))
}

// ---------- кодек ----------

/// Конвейер compress⇄decompress + AEAD над сырым байтовым буфером.
/// Aes256Gcm чистый и Sync — encode/decode безопасно звать по &self.
pub struct Codec {
    compression: CompressionKind,
    encryption: EncryptionKind,
    cipher: Option<Aes256Gcm>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Codec {{ compression: {}, encryption: {} }}",
            self.compression, self.encryption
        )
    }
}

impl Codec {
    /// Собрать кодек; валидирует длину ключа при включённом шифровании.
    pub fn new(
        compression: CompressionKind,
        encryption: EncryptionKind,
        passphrase: &str,
    ) -> Result<Self> {
        let cipher = match encryption {
            EncryptionKind::None => None,
            EncryptionKind::Aes256Gcm => {
                let kb = derive_key(passphrase)?;
                let key = Key::<Aes256Gcm>::from_slice(&kb.0);
                Some(Aes256Gcm::new(key))
            }
        };
        Ok(Self {
            compression,
            encryption,
            cipher,
        })
    }

    #[inline]
    pub fn compression(&self) -> CompressionKind {
        self.compression
    }

    #[inline]
    pub fn encryption(&self) -> EncryptionKind {
        self.encryption
    }

    /// true, если хотя бы одна ступень конвейера активна (меняется формат
    /// записи на диске: EncryptedDataHeader вместо RecordHeader).
    #[inline]
    pub fn is_active(&self) -> bool {
        self.compression != CompressionKind::None || self.encryption != EncryptionKind::None
    }

    /// compress → encrypt.
    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compress(raw)?;
        match &self.cipher {
            None => Ok(compressed),
            Some(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let ct = cipher
                    .encrypt(&nonce, compressed.as_slice())
                    .map_err(|e| anyhow!("aead encrypt failed: {}", e))?;
                let mut out = Vec::with_capacity(GCM_NONCE_LEN + ct.len());
                out.extend_from_slice(nonce.as_slice());
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// decrypt → decompress.
    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let compressed = match &self.cipher {
            None => stored.to_vec(),
            Some(cipher) => {
                if stored.len() < GCM_NONCE_LEN {
                    return Err(anyhow!("auth failed: ciphertext shorter than nonce"));
                }
                let (nonce_bytes, ct) = stored.split_at(GCM_NONCE_LEN);
                let nonce = Nonce::from_slice(nonce_bytes);
                cipher
                    .decrypt(nonce, ct)
                    .map_err(|_| anyhow!("auth failed: aead tag verification failed"))?
            }
        };
        self.decompress(&compressed)
    }

    // ---------- ступень сжатия ----------

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            CompressionKind::None => Ok(raw.to_vec()),
            CompressionKind::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(raw)?;
                Ok(enc.finish()?)
            }
            CompressionKind::Deflate => {
                let mut enc =
                    flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(raw)?;
                Ok(enc.finish()?)
            }
            CompressionKind::Brotli => {
                let mut out = Vec::new();
                {
                    let mut w = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                    w.write_all(raw)?;
                }
                Ok(out)
            }
            CompressionKind::Lz4 => {
                let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
                enc.write_all(raw)?;
                enc.finish()
                    .map_err(|e| anyhow!("lz4 finish failed: {}", e))
            }
            CompressionKind::Zstd => Ok(zstd::bulk::compress(raw, 0)?),
            CompressionKind::Snappy => {
                let mut enc = snap::write::FrameEncoder::new(Vec::new());
                enc.write_all(raw)?;
                enc.into_inner()
                    .map_err(|e| anyhow!("snappy finish failed: {}", e))
            }
            CompressionKind::Lzma => {
                let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
                enc.write_all(raw)?;
                Ok(enc.finish()?)
            }
        }
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            CompressionKind::None => Ok(bytes.to_vec()),
            CompressionKind::Gzip => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionKind::Deflate => {
                let mut out = Vec::new();
                flate2::read::DeflateDecoder::new(bytes).read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionKind::Brotli => {
                let mut out = Vec::new();
                brotli::Decompressor::new(bytes, 4096).read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionKind::Lz4 => {
                let mut out = Vec::new();
                lz4_flex::frame::FrameDecoder::new(bytes).read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionKind::Zstd => Ok(zstd::stream::decode_all(bytes)?),
            CompressionKind::Snappy => {
                let mut out = Vec::new();
                snap::read::FrameDecoder::new(bytes).read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionKind::Lzma => {
                let mut out = Vec::new();
                xz2::read::XzDecoder::new(bytes).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}
