//! Centralized configuration for an UltraKV engine.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering them per call.
//! - Chainable `with_*` setters; `validate()` runs once at open.
//! - No environment variables: the engine is configured in code only.
//!
//! Codec settings (compression/encryption/key) are fixed at database
//! creation; reopening with a different codec is a config mismatch.

use anyhow::{anyhow, Result};

use crate::codec::{CompressionKind, EncryptionKind};

/// Top-level configuration for a single engine/file.
#[derive(Clone, Debug)]
pub struct UltraConfig {
    /// Reuse freed regions through the free-space allocator. When false
    /// every value is appended to end-of-file.
    pub enable_free_space_reuse: bool,

    /// Serve reads from an in-memory value cache.
    pub enable_memory_mode: bool,

    /// Re-read every written value and compare (fails the put on mismatch).
    pub enable_update_validation: bool,

    /// Maximum UTF-8 key length in bytes.
    pub max_key_length: i32,

    /// Size of a freshly created first index page, KiB (min 1).
    pub default_index_page_size_kb: i32,

    /// Size of the persisted free-block region, KiB (0 disables reuse).
    pub free_space_region_size_kb: i32,

    /// Growth factor for end-of-file allocations: actual = 1 + n/100.
    pub allocation_multiplier: u8,

    /// Compression applied to values (and keys inside index pages).
    pub compression_type: CompressionKind,

    /// AEAD applied after compression.
    pub encryption_type: EncryptionKind,

    /// Passphrase for the AEAD key (≥ 16 bytes when encryption is on).
    pub encryption_key: String,

    /// Write/read buffer sizes, KiB (min 4).
    pub write_buffer_size_kb: i32,
    pub read_buffer_size_kb: i32,

    // ---------- GC ----------
    /// Do not consider GC below this file size.
    pub gc_min_file_size_kb: i32,
    /// Free-space share (percent of file size) that arms GC.
    pub gc_free_space_threshold: u8,
    /// Minimum number of live records for GC to make sense.
    pub gc_min_record_count: u16,
    /// Run shrink automatically from the background worker.
    pub gc_auto_recycle_enabled: bool,
    /// Background flush/GC tick period in seconds (0 disables the worker).
    pub gc_flush_interval: u16,
}

impl Default for UltraConfig {
    fn default() -> Self {
        Self {
            enable_free_space_reuse: true,
            enable_memory_mode: false,
            enable_update_validation: false,
            max_key_length: 4096,
            default_index_page_size_kb: 64,
            free_space_region_size_kb: 16,
            allocation_multiplier: 10,
            compression_type: CompressionKind::None,
            encryption_type: EncryptionKind::None,
            encryption_key: String::new(),
            write_buffer_size_kb: 64,
            read_buffer_size_kb: 64,
            gc_min_file_size_kb: 1024,
            gc_free_space_threshold: 30,
            gc_min_record_count: 100,
            gc_auto_recycle_enabled: true,
            gc_flush_interval: 5,
        }
    }
}

impl UltraConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the combination of options. Called by `Engine::open`.
    pub fn validate(&self) -> Result<()> {
        if self.max_key_length <= 0 {
            return Err(anyhow!("max_key_length must be positive"));
        }
        if self.default_index_page_size_kb < 1 {
            return Err(anyhow!("default_index_page_size_kb must be >= 1"));
        }
        if self.free_space_region_size_kb < 0 {
            return Err(anyhow!("free_space_region_size_kb must be >= 0"));
        }
        if self.write_buffer_size_kb < 4 || self.read_buffer_size_kb < 4 {
            return Err(anyhow!("write/read buffer sizes must be >= 4 KiB"));
        }
        if self.encryption_type != EncryptionKind::None && self.encryption_key.len() < 16 {
            return Err(anyhow!(
                "encryption key must be at least 16 bytes, got {}",
                self.encryption_key.len()
            ));
        }
        Ok(())
    }

    /// Effective free-space reuse: the flag AND a non-zero region.
    #[inline]
    pub fn free_space_reuse_effective(&self) -> bool {
        self.enable_free_space_reuse && self.free_space_region_size_kb > 0
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_free_space_reuse(mut self, on: bool) -> Self {
        self.enable_free_space_reuse = on;
        self
    }

    pub fn with_memory_mode(mut self, on: bool) -> Self {
        self.enable_memory_mode = on;
        self
    }

    pub fn with_update_validation(mut self, on: bool) -> Self {
        self.enable_update_validation = on;
        self
    }

    pub fn with_max_key_length(mut self, bytes: i32) -> Self {
        self.max_key_length = bytes;
        self
    }

    pub fn with_default_index_page_size_kb(mut self, kb: i32) -> Self {
        self.default_index_page_size_kb = kb;
        self
    }

    pub fn with_free_space_region_size_kb(mut self, kb: i32) -> Self {
        self.free_space_region_size_kb = kb;
        self
    }

    pub fn with_allocation_multiplier(mut self, n: u8) -> Self {
        self.allocation_multiplier = n;
        self
    }

    pub fn with_compression(mut self, kind: CompressionKind) -> Self {
        self.compression_type = kind;
        self
    }

    pub fn with_encryption<S: Into<String>>(mut self, kind: EncryptionKind, key: S) -> Self {
        self.encryption_type = kind;
        self.encryption_key = key.into();
        self
    }

    pub fn with_write_buffer_size_kb(mut self, kb: i32) -> Self {
        self.write_buffer_size_kb = kb;
        self
    }

    pub fn with_read_buffer_size_kb(mut self, kb: i32) -> Self {
        self.read_buffer_size_kb = kb;
        self
    }

    pub fn with_gc_min_file_size_kb(mut self, kb: i32) -> Self {
        self.gc_min_file_size_kb = kb;
        self
    }

    pub fn with_gc_free_space_threshold(mut self, percent: u8) -> Self {
        self.gc_free_space_threshold = percent;
        self
    }

    pub fn with_gc_min_record_count(mut self, n: u16) -> Self {
        self.gc_min_record_count = n;
        self
    }

    pub fn with_gc_auto_recycle(mut self, on: bool) -> Self {
        self.gc_auto_recycle_enabled = on;
        self
    }

    pub fn with_gc_flush_interval(mut self, secs: u16) -> Self {
        self.gc_flush_interval = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        UltraConfig::default().validate().unwrap();
    }

    #[test]
    fn short_encryption_key_rejected() {
        let cfg = UltraConfig::new().with_encryption(EncryptionKind::Aes256Gcm, "short");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least 16 bytes"));
    }

    #[test]
    fn buffer_minimums_enforced() {
        let cfg = UltraConfig::new().with_read_buffer_size_kb(2);
        assert!(cfg.validate().is_err());
    }
}
