//! header — DatabaseHeader (128 B, offset 0).
//!
//! Формат (LE, плотная упаковка):
//! [magic u32="UKVD"][version u8=1][compression u8][encryption u8]
//! [reuse u8][memory u8][validation u8][free_region_kb i32][alloc_mult u8]
//! [write_buf_kb i32][read_buf_kb i32][created_ms i64][last_access_ms i64]
//! [last_gc_ms i64][gc_min_file_kb i32][gc_free_pct u8][gc_min_records u16]
//! [gc_flush_secs u16][gc_auto u8][gc_total u32][max_key_len i32]
//! [index_page_kb i32][reserved 55][checksum u32 = fnv1a32(0..124)]
//!
//! Политика:
//! - is_valid: magic совпадает, version <= текущей, checksum сходится.
//! - Несовпадение при открытии — corrupt header (фатально).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::codec::{CompressionKind, EncryptionKind};
use crate::config::UltraConfig;
use crate::consts::{DB_HEADER_POS, DB_HEADER_SIZE, DB_MAGIC, DB_VERSION};
use crate::hash::fnv1a32;
use crate::util::now_ms;

const CKSUM_OFF: usize = 124;

#[derive(Debug, Clone)]
pub struct DatabaseHeader {
    pub version: u8,
    pub compression: CompressionKind,
    pub encryption: EncryptionKind,
    pub free_space_reuse: bool,
    pub memory_mode: bool,
    pub update_validation: bool,
    pub free_space_region_kb: i32,
    pub allocation_multiplier: u8,
    pub write_buffer_kb: i32,
    pub read_buffer_kb: i32,
    pub created_ms: i64,
    pub last_access_ms: i64,
    pub last_gc_ms: i64,
    pub gc_min_file_size_kb: i32,
    pub gc_free_space_threshold: u8,
    pub gc_min_record_count: u16,
    pub gc_flush_interval_secs: u16,
    pub gc_auto_recycle: bool,
    pub gc_total_count: u32,
    pub max_key_length: i32,
    pub default_index_page_size_kb: i32,
}

impl DatabaseHeader {
    /// Собрать заголовок новой БД из конфига.
    pub fn from_config(cfg: &UltraConfig) -> Self {
        let now = now_ms();
        Self {
            version: DB_VERSION,
            compression: cfg.compression_type,
            encryption: cfg.encryption_type,
            free_space_reuse: cfg.free_space_reuse_effective(),
            memory_mode: cfg.enable_memory_mode,
            update_validation: cfg.enable_update_validation,
            free_space_region_kb: if cfg.free_space_reuse_effective() {
                cfg.free_space_region_size_kb
            } else {
                0
            },
            allocation_multiplier: cfg.allocation_multiplier,
            write_buffer_kb: cfg.write_buffer_size_kb,
            read_buffer_kb: cfg.read_buffer_size_kb,
            created_ms: now,
            last_access_ms: now,
            last_gc_ms: 0,
            gc_min_file_size_kb: cfg.gc_min_file_size_kb,
            gc_free_space_threshold: cfg.gc_free_space_threshold,
            gc_min_record_count: cfg.gc_min_record_count,
            gc_flush_interval_secs: cfg.gc_flush_interval,
            gc_auto_recycle: cfg.gc_auto_recycle_enabled,
            gc_total_count: 0,
            max_key_length: cfg.max_key_length,
            default_index_page_size_kb: cfg.default_index_page_size_kb,
        }
    }

    /// Фактический множитель аллокации: 1 + n/100.
    #[inline]
    pub fn allocation_factor(&self) -> f64 {
        1.0 + (self.allocation_multiplier as f64) / 100.0
    }

    /// Байтовый размер региона свободных блоков.
    #[inline]
    pub fn free_region_bytes(&self) -> u64 {
        crate::util::kib(self.free_space_region_kb)
    }

    // ---------- (де)сериализация ----------

    pub fn to_bytes(&self) -> [u8; DB_HEADER_SIZE] {
        let mut b = [0u8; DB_HEADER_SIZE];
        LittleEndian::write_u32(&mut b[0..4], DB_MAGIC);
        b[4] = self.version;
        b[5] = self.compression.to_u8();
        b[6] = self.encryption.to_u8();
        b[7] = self.free_space_reuse as u8;
        b[8] = self.memory_mode as u8;
        b[9] = self.update_validation as u8;
        LittleEndian::write_i32(&mut b[10..14], self.free_space_region_kb);
        b[14] = self.allocation_multiplier;
        LittleEndian::write_i32(&mut b[15..19], self.write_buffer_kb);
        LittleEndian::write_i32(&mut b[19..23], self.read_buffer_kb);
        LittleEndian::write_i64(&mut b[23..31], self.created_ms);
        LittleEndian::write_i64(&mut b[31..39], self.last_access_ms);
        LittleEndian::write_i64(&mut b[39..47], self.last_gc_ms);
        LittleEndian::write_i32(&mut b[47..51], self.gc_min_file_size_kb);
        b[51] = self.gc_free_space_threshold;
        LittleEndian::write_u16(&mut b[52..54], self.gc_min_record_count);
        LittleEndian::write_u16(&mut b[54..56], self.gc_flush_interval_secs);
        b[56] = self.gc_auto_recycle as u8;
        LittleEndian::write_u32(&mut b[57..61], self.gc_total_count);
        LittleEndian::write_i32(&mut b[61..65], self.max_key_length);
        LittleEndian::write_i32(&mut b[65..69], self.default_index_page_size_kb);
        // [69..124] reserved = 0
        let cksum = fnv1a32(&b[..CKSUM_OFF]);
        LittleEndian::write_u32(&mut b[CKSUM_OFF..CKSUM_OFF + 4], cksum);
        b
    }

    pub fn from_bytes(b: &[u8; DB_HEADER_SIZE]) -> Result<Self> {
        let magic = LittleEndian::read_u32(&b[0..4]);
        if magic != DB_MAGIC {
            return Err(anyhow!(
                "corrupt header: bad database magic {:#010x} (expected {:#010x})",
                magic,
                DB_MAGIC
            ));
        }
        let version = b[4];
        if version > DB_VERSION {
            return Err(anyhow!(
                "corrupt header: unsupported database version {} (current {})",
                version,
                DB_VERSION
            ));
        }
        let stored = LittleEndian::read_u32(&b[CKSUM_OFF..CKSUM_OFF + 4]);
        let calc = fnv1a32(&b[..CKSUM_OFF]);
        if stored != calc {
            return Err(anyhow!(
                "corrupt header: database checksum mismatch (stored {:#010x}, calc {:#010x})",
                stored,
                calc
            ));
        }

        let compression = CompressionKind::from_u8(b[5])
            .ok_or_else(|| anyhow!("corrupt header: unknown compression kind {}", b[5]))?;
        let encryption = EncryptionKind::from_u8(b[6])
            .ok_or_else(|| anyhow!("corrupt header: unknown encryption kind {}", b[6]))?;

        Ok(Self {
            version,
            compression,
            encryption,
            free_space_reuse: b[7] != 0,
            memory_mode: b[8] != 0,
            update_validation: b[9] != 0,
            free_space_region_kb: LittleEndian::read_i32(&b[10..14]),
            allocation_multiplier: b[14],
            write_buffer_kb: LittleEndian::read_i32(&b[15..19]),
            read_buffer_kb: LittleEndian::read_i32(&b[19..23]),
            created_ms: LittleEndian::read_i64(&b[23..31]),
            last_access_ms: LittleEndian::read_i64(&b[31..39]),
            last_gc_ms: LittleEndian::read_i64(&b[39..47]),
            gc_min_file_size_kb: LittleEndian::read_i32(&b[47..51]),
            gc_free_space_threshold: b[51],
            gc_min_record_count: LittleEndian::read_u16(&b[52..54]),
            gc_flush_interval_secs: LittleEndian::read_u16(&b[54..56]),
            gc_auto_recycle: b[56] != 0,
            gc_total_count: LittleEndian::read_u32(&b[57..61]),
            max_key_length: LittleEndian::read_i32(&b[61..65]),
            default_index_page_size_kb: LittleEndian::read_i32(&b[65..69]),
        })
    }

    /// true, если magic/version/checksum согласованы.
    pub fn is_valid(b: &[u8; DB_HEADER_SIZE]) -> bool {
        Self::from_bytes(b).is_ok()
    }

    // ---------- файловый I/O ----------

    pub fn save(&self, file: &mut File) -> Result<()> {
        let bytes = self.to_bytes();
        file.seek(SeekFrom::Start(DB_HEADER_POS))?;
        file.write_all(&bytes)?;
        Ok(())
    }

    pub fn load(file: &mut File) -> Result<Self> {
        let mut bytes = [0u8; DB_HEADER_SIZE];
        file.seek(SeekFrom::Start(DB_HEADER_POS))?;
        file.read_exact(&mut bytes)
            .map_err(|e| anyhow!("corrupt header: short read of database header: {}", e))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let cfg = UltraConfig::default();
        let mut h = DatabaseHeader::from_config(&cfg);
        h.gc_total_count = 7;
        h.last_gc_ms = 123_456;

        let bytes = h.to_bytes();
        assert!(DatabaseHeader::is_valid(&bytes));

        let h2 = DatabaseHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h2.version, DB_VERSION);
        assert_eq!(h2.gc_total_count, 7);
        assert_eq!(h2.last_gc_ms, 123_456);
        assert_eq!(h2.max_key_length, cfg.max_key_length);
        assert_eq!(h2.allocation_multiplier, cfg.allocation_multiplier);
        assert!((h2.allocation_factor() - 1.10).abs() < 1e-9);
    }

    #[test]
    fn corrupt_checksum_rejected() {
        let h = DatabaseHeader::from_config(&UltraConfig::default());
        let mut bytes = h.to_bytes();
        bytes[30] ^= 0xFF;
        let err = DatabaseHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("corrupt header"));
    }

    #[test]
    fn future_version_rejected() {
        let h = DatabaseHeader::from_config(&UltraConfig::default());
        let mut bytes = h.to_bytes();
        bytes[4] = DB_VERSION + 1;
        // checksum пересчитываем, чтобы отказ был именно по версии
        let cksum = crate::hash::fnv1a32(&bytes[..124]);
        byteorder::LittleEndian::write_u32(&mut bytes[124..128], cksum);
        let err = DatabaseHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported database version"));
    }
}
