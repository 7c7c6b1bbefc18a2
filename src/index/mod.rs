//! index — первичный страничный индекс.
//!
//! Раскладка региона (LE):
//! - IndexHeader (64 B, offset P0 = 1024 + free_region):
//!   [magic u32="IDXH"][ver u8=1][page_count u8][reserved u16]
//!   [total_index_bytes i64][region_start i64][created_ms i64][updated_ms i64]
//!   [total i32][active i32][deleted i32][reserved][checksum u32 @60]
//! - IndexBlock[32] (по 16 B): {page_position i64, page_size i64};
//!   нулевой слот — невалиден.
//!
//! Страницы и протокол reserve→confirm — в page.rs / manager.rs.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::consts::{
    INDEX_BLOCKS_SIZE, INDEX_BLOCK_SIZE, INDEX_HEADER_SIZE, INDEX_MAGIC, INDEX_VERSION,
    MAX_INDEX_PAGES,
};
use crate::hash::fnv1a32_zeroed_field;
use crate::util::now_ms;

pub mod entry;
pub mod manager;
pub mod page;

pub use entry::IndexEntry;
pub use manager::{IndexManager, IndexStats, Reservation};
pub use page::IndexPage;

const CKSUM_OFF: usize = 60;

/// Слот таблицы страниц. Нулевые position и size — свободный слот.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexBlock {
    pub page_position: i64,
    pub page_size: i64,
}

impl IndexBlock {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.page_position > 0 && self.page_size > 0
    }
}

#[derive(Debug, Clone)]
pub struct IndexHeader {
    pub version: u8,
    pub page_count: u8,
    pub total_index_bytes: i64,
    pub region_start: i64,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub total_entries: i32,
    pub active_entries: i32,
    pub deleted_entries: i32,
}

impl IndexHeader {
    pub fn new(region_start: u64) -> Self {
        let now = now_ms();
        Self {
            version: INDEX_VERSION,
            page_count: 0,
            total_index_bytes: 0,
            region_start: region_start as i64,
            created_ms: now,
            updated_ms: now,
            total_entries: 0,
            active_entries: 0,
            deleted_entries: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut b = [0u8; INDEX_HEADER_SIZE];
        LittleEndian::write_u32(&mut b[0..4], INDEX_MAGIC);
        b[4] = self.version;
        b[5] = self.page_count;
        // [6..8] reserved
        LittleEndian::write_i64(&mut b[8..16], self.total_index_bytes);
        LittleEndian::write_i64(&mut b[16..24], self.region_start);
        LittleEndian::write_i64(&mut b[24..32], self.created_ms);
        LittleEndian::write_i64(&mut b[32..40], self.updated_ms);
        LittleEndian::write_i32(&mut b[40..44], self.total_entries);
        LittleEndian::write_i32(&mut b[44..48], self.active_entries);
        LittleEndian::write_i32(&mut b[48..52], self.deleted_entries);
        // [52..60] reserved
        let cksum = fnv1a32_zeroed_field(&b, CKSUM_OFF);
        LittleEndian::write_u32(&mut b[CKSUM_OFF..CKSUM_OFF + 4], cksum);
        b
    }

    pub fn from_bytes(b: &[u8; INDEX_HEADER_SIZE]) -> Result<Self> {
        let magic = LittleEndian::read_u32(&b[0..4]);
        if magic != INDEX_MAGIC {
            return Err(anyhow!("corrupt header: bad index magic {:#010x}", magic));
        }
        let version = b[4];
        if version > INDEX_VERSION {
            return Err(anyhow!(
                "corrupt header: unsupported index version {}",
                version
            ));
        }
        let stored = LittleEndian::read_u32(&b[CKSUM_OFF..CKSUM_OFF + 4]);
        let calc = fnv1a32_zeroed_field(b, CKSUM_OFF);
        if stored != calc {
            return Err(anyhow!("corrupt header: index checksum mismatch"));
        }
        let page_count = b[5];
        if page_count as usize > MAX_INDEX_PAGES {
            return Err(anyhow!(
                "corrupt header: index page count {} exceeds {}",
                page_count,
                MAX_INDEX_PAGES
            ));
        }
        Ok(Self {
            version,
            page_count,
            total_index_bytes: LittleEndian::read_i64(&b[8..16]),
            region_start: LittleEndian::read_i64(&b[16..24]),
            created_ms: LittleEndian::read_i64(&b[24..32]),
            updated_ms: LittleEndian::read_i64(&b[32..40]),
            total_entries: LittleEndian::read_i32(&b[40..44]),
            active_entries: LittleEndian::read_i32(&b[44..48]),
            deleted_entries: LittleEndian::read_i32(&b[48..52]),
        })
    }

    // ---------- файловый I/O (заголовок + таблица блоков) ----------

    pub fn save(&self, file: &mut File, header_pos: u64, blocks: &[IndexBlock]) -> Result<()> {
        let bytes = self.to_bytes();
        file.seek(SeekFrom::Start(header_pos))?;
        file.write_all(&bytes)?;

        let mut table = [0u8; INDEX_BLOCKS_SIZE];
        for (i, blk) in blocks.iter().take(MAX_INDEX_PAGES).enumerate() {
            let off = i * INDEX_BLOCK_SIZE;
            LittleEndian::write_i64(&mut table[off..off + 8], blk.page_position);
            LittleEndian::write_i64(&mut table[off + 8..off + 16], blk.page_size);
        }
        file.write_all(&table)?;
        Ok(())
    }

    pub fn load(
        file: &mut File,
        header_pos: u64,
    ) -> Result<(Self, [IndexBlock; MAX_INDEX_PAGES])> {
        let mut bytes = [0u8; INDEX_HEADER_SIZE];
        file.seek(SeekFrom::Start(header_pos))?;
        file.read_exact(&mut bytes)
            .map_err(|e| anyhow!("corrupt header: short read of index header: {}", e))?;
        let header = Self::from_bytes(&bytes)?;

        let mut table = [0u8; INDEX_BLOCKS_SIZE];
        file.read_exact(&mut table)?;
        let mut blocks = [IndexBlock::default(); MAX_INDEX_PAGES];
        for (i, blk) in blocks.iter_mut().enumerate() {
            let off = i * INDEX_BLOCK_SIZE;
            blk.page_position = LittleEndian::read_i64(&table[off..off + 8]);
            blk.page_size = LittleEndian::read_i64(&table[off + 8..off + 16]);
        }
        Ok((header, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_header_roundtrip() {
        let mut h = IndexHeader::new(17_920);
        h.page_count = 3;
        h.total_index_bytes = 64 * 1024;
        h.total_entries = 100;
        h.active_entries = 90;
        h.deleted_entries = 10;

        let bytes = h.to_bytes();
        let h2 = IndexHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h2.page_count, 3);
        assert_eq!(h2.region_start, 17_920);
        assert_eq!(h2.total_entries, 100);
        assert_eq!(h2.active_entries, 90);
        assert_eq!(h2.deleted_entries, 10);
    }

    #[test]
    fn zero_block_is_invalid() {
        assert!(!IndexBlock::default().is_valid());
        assert!(IndexBlock {
            page_position: 2048,
            page_size: 65536
        }
        .is_valid());
    }
}
