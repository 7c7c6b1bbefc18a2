//! free — аллокатор свободного пространства кучи значений.
//!
//! Формат (LE):
//! - FreeSpaceHeader (64 B, offset 128):
//!   [magic u32="FSPS"][ver u8=1][enabled u8][region_size i32][block_count i32]
//!   [alloc_count u32][recycle_count u32][last_used_ms i64]
//!   [total_recycled i64][largest_block_ever i64][reserved][checksum u32 @60]
//! - Регион блоков (offset 1024, фиксированная ёмкость region/16):
//!   подряд идущие записи {position i64, size i64}.
//!
//! Политика:
//! - Список в памяти держится отсортированным по size (возрастание);
//!   выбор best-fit — первый блок с size >= запроса.
//! - Блок крупнее запроса на waste_threshold = max(64, size/4) режется:
//!   остаток возвращается в список, наружу уходит ровно size.
//! - release сливает новый блок со ВСЕМИ смежными, пока смежность не
//!   исчерпана, затем пересортировка.
//! - При переполнении региона вытесняются наименьшие блоки.
//! - Отключённый аллокатор: try_reserve всегда None, release — no-op.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::consts::{
    FREE_BLOCK_SIZE, FREE_HEADER_POS, FREE_HEADER_SIZE, FREE_MAGIC, FREE_REGION_POS, FREE_VERSION,
};
use crate::hash::fnv1a32_zeroed_field;
use crate::util::now_ms;

const CKSUM_OFF: usize = 60;

/// Свободный диапазон кучи: [position, position + size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub position: i64,
    pub size: i64,
}

impl FreeBlock {
    #[inline]
    pub fn end(&self) -> i64 {
        self.position + self.size
    }
}

/// Счётчики/состояние заголовка региона.
#[derive(Debug, Clone)]
pub struct FreeSpaceHeader {
    pub version: u8,
    pub enabled: bool,
    pub region_size: i32,
    pub block_count: i32,
    pub alloc_count: u32,
    pub recycle_count: u32,
    pub last_used_ms: i64,
    pub total_recycled_bytes: i64,
    pub largest_block_ever: i64,
}

impl FreeSpaceHeader {
    pub fn new(enabled: bool, region_bytes: u64) -> Self {
        Self {
            version: FREE_VERSION,
            enabled,
            region_size: region_bytes.min(i32::MAX as u64) as i32,
            block_count: 0,
            alloc_count: 0,
            recycle_count: 0,
            last_used_ms: 0,
            total_recycled_bytes: 0,
            largest_block_ever: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; FREE_HEADER_SIZE] {
        let mut b = [0u8; FREE_HEADER_SIZE];
        LittleEndian::write_u32(&mut b[0..4], FREE_MAGIC);
        b[4] = self.version;
        b[5] = self.enabled as u8;
        LittleEndian::write_i32(&mut b[6..10], self.region_size);
        LittleEndian::write_i32(&mut b[10..14], self.block_count);
        LittleEndian::write_u32(&mut b[14..18], self.alloc_count);
        LittleEndian::write_u32(&mut b[18..22], self.recycle_count);
        LittleEndian::write_i64(&mut b[22..30], self.last_used_ms);
        LittleEndian::write_i64(&mut b[30..38], self.total_recycled_bytes);
        LittleEndian::write_i64(&mut b[38..46], self.largest_block_ever);
        // [46..60] reserved
        let cksum = fnv1a32_zeroed_field(&b, CKSUM_OFF);
        LittleEndian::write_u32(&mut b[CKSUM_OFF..CKSUM_OFF + 4], cksum);
        b
    }

    pub fn from_bytes(b: &[u8; FREE_HEADER_SIZE]) -> Result<Self> {
        let magic = LittleEndian::read_u32(&b[0..4]);
        if magic != FREE_MAGIC {
            return Err(anyhow!(
                "corrupt header: bad free-space magic {:#010x}",
                magic
            ));
        }
        let version = b[4];
        if version > FREE_VERSION {
            return Err(anyhow!(
                "corrupt header: unsupported free-space version {}",
                version
            ));
        }
        let stored = LittleEndian::read_u32(&b[CKSUM_OFF..CKSUM_OFF + 4]);
        let calc = fnv1a32_zeroed_field(b, CKSUM_OFF);
        if stored != calc {
            return Err(anyhow!("corrupt header: free-space checksum mismatch"));
        }
        Ok(Self {
            version,
            enabled: b[5] != 0,
            region_size: LittleEndian::read_i32(&b[6..10]),
            block_count: LittleEndian::read_i32(&b[10..14]),
            alloc_count: LittleEndian::read_u32(&b[14..18]),
            recycle_count: LittleEndian::read_u32(&b[18..22]),
            last_used_ms: LittleEndian::read_i64(&b[22..30]),
            total_recycled_bytes: LittleEndian::read_i64(&b[30..38]),
            largest_block_ever: LittleEndian::read_i64(&b[38..46]),
        })
    }
}

/// Аллокатор: список свободных блоков + персист в фиксированный регион.
#[derive(Debug)]
pub struct FreeSpace {
    header: FreeSpaceHeader,
    region_bytes: u64,
    /// Нижняя граница кучи: release ниже неё игнорируется.
    data_start: i64,
    /// Отсортирован по (size, position), возрастание.
    blocks: Vec<FreeBlock>,
    dirty: bool,
}

impl FreeSpace {
    pub fn new(enabled: bool, region_bytes: u64, data_start: u64) -> Self {
        Self {
            header: FreeSpaceHeader::new(enabled, region_bytes),
            region_bytes,
            data_start: data_start as i64,
            blocks: Vec::new(),
            dirty: false,
        }
    }

    /// Ёмкость региона в блоках.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.region_bytes as usize) / FREE_BLOCK_SIZE
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.header.enabled
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn total_free_bytes(&self) -> i64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    #[inline]
    pub fn largest_block(&self) -> i64 {
        self.blocks.iter().map(|b| b.size).max().unwrap_or(0)
    }

    pub fn header(&self) -> &FreeSpaceHeader {
        &self.header
    }

    pub fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }

    /// Метрика фрагментации: 1 - largest / (total / count). 0.0 при пустом списке.
    pub fn fragmentation(&self) -> f64 {
        let count = self.blocks.len() as f64;
        if count == 0.0 {
            return 0.0;
        }
        let total = self.total_free_bytes() as f64;
        let largest = self.largest_block() as f64;
        if total == 0.0 {
            return 0.0;
        }
        1.0 - largest / (total / count)
    }

    /// Best-fit: первый (наименьший) блок с size >= запроса; крупный блок
    /// режется, остаток возвращается в список.
    pub fn try_reserve(&mut self, size: i64) -> Option<FreeBlock> {
        if !self.header.enabled || size <= 0 {
            return None;
        }
        let idx = self.blocks.iter().position(|b| b.size >= size)?;
        let block = self.blocks.remove(idx);

        let waste_threshold = (size / 4).max(64);
        let granted = if block.size > size + waste_threshold {
            self.insert_sorted(FreeBlock {
                position: block.position + size,
                size: block.size - size,
            });
            FreeBlock {
                position: block.position,
                size,
            }
        } else {
            block
        };

        self.header.alloc_count = self.header.alloc_count.wrapping_add(1);
        self.header.last_used_ms = now_ms();
        self.dirty = true;
        Some(granted)
    }

    /// Вернуть диапазон в список: слияние со всеми смежными блоками до
    /// исчерпания смежности, затем пересортировка и вытеснение при
    /// переполнении региона.
    pub fn release(&mut self, position: i64, size: i64) {
        if !self.header.enabled || size <= 0 || position < self.data_start {
            return;
        }

        let mut cur = FreeBlock { position, size };
        loop {
            let mut merged = false;
            let mut i = 0;
            while i < self.blocks.len() {
                let b = self.blocks[i];
                if b.end() == cur.position || cur.end() == b.position {
                    self.blocks.swap_remove(i);
                    cur = FreeBlock {
                        position: cur.position.min(b.position),
                        size: cur.size + b.size,
                    };
                    merged = true;
                } else {
                    i += 1;
                }
            }
            if !merged {
                break;
            }
        }
        self.insert_sorted(cur);

        // Переполнение: наименьшие блоки выбрасываются (теряются до shrink)
        let cap = self.capacity();
        while cap > 0 && self.blocks.len() > cap {
            self.blocks.remove(0);
        }

        self.header.recycle_count = self.header.recycle_count.wrapping_add(1);
        self.header.total_recycled_bytes = self.header.total_recycled_bytes.saturating_add(size);
        if cur.size > self.header.largest_block_ever {
            self.header.largest_block_ever = cur.size;
        }
        self.header.last_used_ms = now_ms();
        self.dirty = true;
    }

    /// Полный сброс списка (clear/shrink).
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.dirty = true;
    }

    #[inline]
    fn insert_sorted(&mut self, block: FreeBlock) {
        let at = self
            .blocks
            .partition_point(|b| (b.size, b.position) < (block.size, block.position));
        self.blocks.insert(at, block);
    }

    // ---------- персист ----------

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Записать заголовок + регион блоков. Регион предварительно зануляется.
    pub fn save(&mut self, file: &mut File) -> Result<()> {
        self.header.block_count = self.blocks.len() as i32;
        let hdr = self.header.to_bytes();
        file.seek(SeekFrom::Start(FREE_HEADER_POS))?;
        file.write_all(&hdr)?;

        if self.region_bytes > 0 {
            let mut region = vec![0u8; self.region_bytes as usize];
            for (i, b) in self.blocks.iter().enumerate() {
                let off = i * FREE_BLOCK_SIZE;
                LittleEndian::write_i64(&mut region[off..off + 8], b.position);
                LittleEndian::write_i64(&mut region[off + 8..off + 16], b.size);
            }
            file.seek(SeekFrom::Start(FREE_REGION_POS))?;
            file.write_all(&region)?;
        }

        self.dirty = false;
        Ok(())
    }

    /// Прочитать заголовок + блоки из файла.
    pub fn load(file: &mut File, data_start: u64) -> Result<Self> {
        let mut hdr_bytes = [0u8; FREE_HEADER_SIZE];
        file.seek(SeekFrom::Start(FREE_HEADER_POS))?;
        file.read_exact(&mut hdr_bytes)
            .map_err(|e| anyhow!("corrupt header: short read of free-space header: {}", e))?;
        let header = FreeSpaceHeader::from_bytes(&hdr_bytes)?;

        let region_bytes = header.region_size.max(0) as u64;
        let mut blocks = Vec::new();
        if region_bytes > 0 && header.block_count > 0 {
            let cap = (region_bytes as usize) / FREE_BLOCK_SIZE;
            let count = (header.block_count as usize).min(cap);
            let mut raw = vec![0u8; count * FREE_BLOCK_SIZE];
            file.seek(SeekFrom::Start(FREE_REGION_POS))?;
            file.read_exact(&mut raw)?;
            for i in 0..count {
                let off = i * FREE_BLOCK_SIZE;
                let position = LittleEndian::read_i64(&raw[off..off + 8]);
                let size = LittleEndian::read_i64(&raw[off + 8..off + 16]);
                if size > 0 && position >= data_start as i64 {
                    blocks.push(FreeBlock { position, size });
                }
            }
            blocks.sort_unstable_by_key(|b| (b.size, b.position));
        }

        Ok(Self {
            header,
            region_bytes,
            data_start: data_start as i64,
            blocks,
            dirty: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_for_test() -> FreeSpace {
        // data_start = 0, регион 1 KiB (64 блока)
        FreeSpace::new(true, 1024, 0)
    }

    #[test]
    fn best_fit_picks_smallest_sufficient() {
        let mut fs = fs_for_test();
        fs.release(1000, 500);
        fs.release(5000, 120);
        fs.release(9000, 300);

        let got = fs.try_reserve(100).unwrap();
        // 120 — наименьший подходящий; резки нет (120 <= 100 + max(64, 25))
        assert_eq!(got.position, 5000);
        assert_eq!(got.size, 120);
    }

    #[test]
    fn oversized_block_is_split() {
        let mut fs = fs_for_test();
        fs.release(1000, 4096);
        let got = fs.try_reserve(256).unwrap();
        assert_eq!(got.position, 1000);
        assert_eq!(got.size, 256);
        // Остаток вернулся в список
        assert_eq!(fs.block_count(), 1);
        assert_eq!(fs.blocks()[0].position, 1256);
        assert_eq!(fs.blocks()[0].size, 4096 - 256);
    }

    #[test]
    fn adjacent_blocks_merge() {
        let mut fs = fs_for_test();
        fs.release(1000, 100);
        fs.release(1200, 100);
        fs.release(1100, 100); // мостик между двумя

        assert_eq!(fs.block_count(), 1);
        assert_eq!(fs.blocks()[0].position, 1000);
        assert_eq!(fs.blocks()[0].size, 300);

        // Инвариант: смежных пар не осталось
        for a in fs.blocks() {
            for b in fs.blocks() {
                if a != b {
                    assert_ne!(a.end(), b.position);
                }
            }
        }
    }

    #[test]
    fn release_below_data_start_ignored() {
        let mut fs = FreeSpace::new(true, 1024, 4096);
        fs.release(100, 64);
        assert_eq!(fs.block_count(), 0);
        fs.release(5000, 0);
        assert_eq!(fs.block_count(), 0);
        fs.release(5000, 64);
        assert_eq!(fs.block_count(), 1);
    }

    #[test]
    fn disabled_allocator_is_inert() {
        let mut fs = FreeSpace::new(false, 1024, 0);
        fs.release(1000, 500);
        assert_eq!(fs.block_count(), 0);
        assert!(fs.try_reserve(10).is_none());
    }

    #[test]
    fn overflow_evicts_smallest() {
        // Регион на 2 блока
        let mut fs = FreeSpace::new(true, 32, 0);
        fs.release(1000, 100);
        fs.release(3000, 300);
        fs.release(5000, 200);
        assert_eq!(fs.block_count(), 2);
        // Выжили два крупнейших
        let sizes: Vec<i64> = fs.blocks().iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![200, 300]);
    }

    #[test]
    fn header_roundtrip() {
        let mut h = FreeSpaceHeader::new(true, 2048);
        h.block_count = 3;
        h.alloc_count = 10;
        h.total_recycled_bytes = 9999;
        let bytes = h.to_bytes();
        let h2 = FreeSpaceHeader::from_bytes(&bytes).unwrap();
        assert!(h2.enabled);
        assert_eq!(h2.region_size, 2048);
        assert_eq!(h2.block_count, 3);
        assert_eq!(h2.alloc_count, 10);
        assert_eq!(h2.total_recycled_bytes, 9999);
    }

    #[test]
    fn fragmentation_metric() {
        let mut fs = fs_for_test();
        assert_eq!(fs.fragmentation(), 0.0);
        fs.release(1000, 100);
        // Один блок: largest == total/count -> 0
        assert!(fs.fragmentation().abs() < 1e-9);
        fs.release(3000, 100);
        fs.release(9000, 100);
        // Равные блоки: largest == mean -> по-прежнему 0
        assert!(fs.fragmentation().abs() < 1e-9);
    }
}
