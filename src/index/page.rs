//! index/page — страница индекса фиксированного размера.
//!
//! Формат (LE):
//! - IndexPageHeader (32 B):
//!   [magic u32="IDXP"][entry_count i32][max_entries i32][used_space i32]
//!   [free_space i32][last_update_ms i64][checksum u32 @28]
//!   (checksum — fnv1a32 по 32 байтам заголовка с занулённым полем).
//! - Далее подряд (append-only, порядок вставки):
//!   (IndexEntry 32 B ‖ key_bytes[entry.key_length]) …
//!
//! Инварианты:
//! - used_space + free_space == page_size; used_space >= 32;
//! - кортеж никогда не пересекает границу страницы;
//! - порядок кортежей стабилен, кроме compact().
//!
//! Ключи хранятся в том виде, который даёт кодек (encode при активном
//! конвейере), поэтому сравнение — всегда через decode.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::codec::Codec;
use crate::consts::{INDEX_ENTRY_SIZE, INDEX_PAGE_HEADER_SIZE, INDEX_PAGE_MAGIC};
use crate::hash::fnv1a32_zeroed_field;
use crate::index::entry::IndexEntry;
use crate::util::now_ms;

const HDR: usize = INDEX_PAGE_HEADER_SIZE;
const CKSUM_OFF: usize = 28;

/// Доля удалённых кортежей, при которой страницу пора уплотнять.
pub const COMPACT_DELETED_RATIO: f64 = 0.3;

/// Итог add_or_update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Ключ уже есть — кортеж не тронут (обновление идёт через
    /// update_confirmed, слот значения переиспользуется).
    Present,
    /// Кортеж дописан по указанному смещению.
    Appended(usize),
    /// Не хватает свободного места под 32 + key_bytes.len().
    NoSpace,
}

#[derive(Debug)]
pub struct IndexPage {
    pub page_index: u8,
    pub position: i64,
    buf: Vec<u8>,
    entry_count: i32,
    max_entries: i32,
    used_space: i32,
    free_space: i32,
    last_update_ms: i64,
    dirty: bool,
}

impl IndexPage {
    /// Новая пустая страница (нулевой буфер + заголовок).
    pub fn new(page_index: u8, position: i64, size: usize) -> Self {
        let max_entries = ((size - HDR) / (INDEX_ENTRY_SIZE + 1)) as i32;
        Self {
            page_index,
            position,
            buf: vec![0u8; size],
            entry_count: 0,
            max_entries,
            used_space: HDR as i32,
            free_space: (size - HDR) as i32,
            last_update_ms: now_ms(),
            dirty: true,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    #[inline]
    pub fn used_space(&self) -> i32 {
        self.used_space
    }

    #[inline]
    pub fn free_space(&self) -> i32 {
        self.free_space
    }

    #[inline]
    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Хватает ли места под кортеж с ключом key_len байт.
    #[inline]
    pub fn has_space(&self, key_len: usize) -> bool {
        self.free_space as usize >= INDEX_ENTRY_SIZE + key_len
    }

    // ---------- обход кортежей ----------

    /// Обход всех кортежей (включая удалённые) в порядке вставки.
    /// Колбэк возвращает true, чтобы остановить обход.
    fn for_each_tuple<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(usize, IndexEntry, &[u8]) -> bool,
    {
        let used = self.used_space as usize;
        let mut off = HDR;
        while off < used {
            if off + INDEX_ENTRY_SIZE > used {
                return Err(anyhow!(
                    "corrupt index page {}: tuple header crosses used_space",
                    self.page_index
                ));
            }
            let entry = IndexEntry::read_from(&self.buf[off..off + INDEX_ENTRY_SIZE])?;
            let klen = entry.key_length;
            if klen <= 0 || off + INDEX_ENTRY_SIZE + klen as usize > used {
                return Err(anyhow!(
                    "corrupt index page {}: bad key length {} at offset {}",
                    self.page_index,
                    klen,
                    off
                ));
            }
            let key_bytes = &self.buf[off + INDEX_ENTRY_SIZE..off + INDEX_ENTRY_SIZE + klen as usize];
            if f(off, entry, key_bytes) {
                return Ok(());
            }
            off += INDEX_ENTRY_SIZE + klen as usize;
        }
        Ok(())
    }

    /// Найти живой кортеж по плоскому (декодированному) ключу.
    pub fn find(&self, key_plain: &[u8], codec: &Codec) -> Result<Option<(usize, IndexEntry)>> {
        let mut found = None;
        let mut decode_err: Option<anyhow::Error> = None;
        self.for_each_tuple(|off, entry, stored_key| {
            if entry.is_deleted {
                return false;
            }
            let plain = if codec.is_active() {
                match codec.decode(stored_key) {
                    Ok(p) => p,
                    Err(e) => {
                        decode_err = Some(e);
                        return true;
                    }
                }
            } else {
                stored_key.to_vec()
            };
            if plain == key_plain {
                found = Some((off, entry));
                true
            } else {
                false
            }
        })?;
        if let Some(e) = decode_err {
            return Err(e);
        }
        Ok(found)
    }

    /// true, если живой кортеж с таким ключом существует.
    pub fn contains(&self, key_plain: &[u8], codec: &Codec) -> Result<bool> {
        Ok(self.find(key_plain, codec)?.is_some())
    }

    /// Обход живых кортежей с декодированием ключа. Кортежи, чей ключ не
    /// прошёл AEAD-проверку, пропускаются; их число возвращается наружу
    /// (читающая сторона решает, что с этим делать).
    pub fn for_each_active<F>(&self, codec: &Codec, mut f: F) -> Result<usize>
    where
        F: FnMut(Vec<u8>, usize, IndexEntry),
    {
        let mut failures = 0usize;
        self.for_each_tuple(|off, entry, stored_key| {
            if entry.is_deleted {
                return false;
            }
            let plain = if codec.is_active() {
                match codec.decode(stored_key) {
                    Ok(p) => p,
                    Err(_) => {
                        failures += 1;
                        return false;
                    }
                }
            } else {
                stored_key.to_vec()
            };
            f(plain, off, entry);
            false
        })?;
        Ok(failures)
    }

    /// Сырые байты ключа кортежа по известному смещению.
    pub fn stored_key_at(&self, offset: usize) -> Result<Vec<u8>> {
        let entry = self.entry_at(offset)?;
        let start = offset + INDEX_ENTRY_SIZE;
        Ok(self.buf[start..start + entry.key_length as usize].to_vec())
    }

    // ---------- мутации ----------

    /// Дописать кортеж либо сообщить, что ключ уже есть / нет места.
    pub fn add_or_update(
        &mut self,
        key_plain: &[u8],
        entry: IndexEntry,
        processed_key: &[u8],
        codec: &Codec,
    ) -> Result<AddOutcome> {
        if self.contains(key_plain, codec)? {
            return Ok(AddOutcome::Present);
        }
        if !self.has_space(processed_key.len()) {
            return Ok(AddOutcome::NoSpace);
        }

        let off = self.used_space as usize;
        let mut e = entry;
        e.page_index = self.page_index;
        e.key_length = processed_key.len() as i32;
        e.write_to(&mut self.buf[off..off + INDEX_ENTRY_SIZE])?;
        self.buf[off + INDEX_ENTRY_SIZE..off + INDEX_ENTRY_SIZE + processed_key.len()]
            .copy_from_slice(processed_key);

        self.entry_count += 1;
        let tuple = (INDEX_ENTRY_SIZE + processed_key.len()) as i32;
        self.used_space += tuple;
        self.free_space -= tuple;
        self.last_update_ms = now_ms();
        self.dirty = true;
        Ok(AddOutcome::Appended(off))
    }

    /// Пометить живой кортеж удалённым (место не возвращается до compact).
    pub fn remove(&mut self, key_plain: &[u8], codec: &Codec) -> Result<bool> {
        match self.find(key_plain, codec)? {
            None => Ok(false),
            Some((off, mut entry)) => {
                entry.is_deleted = true;
                entry.write_to(&mut self.buf[off..off + INDEX_ENTRY_SIZE])?;
                self.last_update_ms = now_ms();
                self.dirty = true;
                Ok(true)
            }
        }
    }

    /// Перезаписать 32-байтный дескриптор кортежа на месте (confirm).
    pub fn update_confirmed(
        &mut self,
        key_plain: &[u8],
        new_entry: IndexEntry,
        codec: &Codec,
    ) -> Result<bool> {
        match self.find(key_plain, codec)? {
            None => Ok(false),
            Some((off, _)) => {
                self.write_entry_at(off, new_entry)?;
                Ok(true)
            }
        }
    }

    /// Прямой вариант confirm по известному смещению.
    pub fn write_entry_at(&mut self, offset: usize, mut entry: IndexEntry) -> Result<()> {
        let stored = self.entry_at(offset)?;
        entry.page_index = self.page_index;
        entry.key_length = stored.key_length;
        entry.write_to(&mut self.buf[offset..offset + INDEX_ENTRY_SIZE])?;
        self.last_update_ms = now_ms();
        self.dirty = true;
        Ok(())
    }

    pub fn entry_at(&self, offset: usize) -> Result<IndexEntry> {
        if offset < HDR || offset + INDEX_ENTRY_SIZE > self.used_space as usize {
            return Err(anyhow!(
                "index page {}: entry offset {} out of bounds",
                self.page_index,
                offset
            ));
        }
        IndexEntry::read_from(&self.buf[offset..offset + INDEX_ENTRY_SIZE])
    }

    /// Откат свежей резервации: хвостовой кортеж усечётся, иной — пометится
    /// удалённым (исчезнет при compact).
    pub fn rollback_reserved(&mut self, offset: usize) -> Result<()> {
        let entry = self.entry_at(offset)?;
        let tuple = INDEX_ENTRY_SIZE + entry.key_length as usize;
        if offset + tuple == self.used_space as usize {
            self.buf[offset..offset + tuple].fill(0);
            self.entry_count -= 1;
            self.used_space -= tuple as i32;
            self.free_space += tuple as i32;
        } else {
            let mut e = entry;
            e.is_deleted = true;
            e.write_to(&mut self.buf[offset..offset + INDEX_ENTRY_SIZE])?;
        }
        self.last_update_ms = now_ms();
        self.dirty = true;
        Ok(())
    }

    // ---------- уплотнение ----------

    /// Число удалённых кортежей и занятые ими байты.
    pub fn deleted_stats(&self) -> Result<(i32, i32)> {
        let mut count = 0i32;
        let mut bytes = 0i32;
        self.for_each_tuple(|_, entry, key| {
            if entry.is_deleted {
                count += 1;
                bytes += (INDEX_ENTRY_SIZE + key.len()) as i32;
            }
            false
        })?;
        Ok((count, bytes))
    }

    /// Пора ли уплотнять: deleted >= 0.3 * total.
    pub fn needs_compact(&self) -> bool {
        if self.entry_count == 0 {
            return false;
        }
        match self.deleted_stats() {
            Ok((deleted, _)) => deleted as f64 >= COMPACT_DELETED_RATIO * self.entry_count as f64,
            Err(_) => false,
        }
    }

    /// Перестроить буфер, выбросив удалённые кортежи. Возвращает число
    /// удалённых. Порядок живых кортежей сохраняется.
    pub fn compact(&mut self) -> Result<i32> {
        let mut kept: Vec<(IndexEntry, Vec<u8>)> = Vec::new();
        let mut removed = 0i32;
        self.for_each_tuple(|_, entry, key| {
            if entry.is_deleted {
                removed += 1;
            } else {
                kept.push((entry, key.to_vec()));
            }
            false
        })?;

        let mut scratch = vec![0u8; self.buf.len()];
        let mut write_off = HDR;
        for (entry, key) in &kept {
            entry.write_to(&mut scratch[write_off..write_off + INDEX_ENTRY_SIZE])?;
            let tuple = INDEX_ENTRY_SIZE + key.len();
            scratch[write_off + INDEX_ENTRY_SIZE..write_off + tuple].copy_from_slice(key);
            write_off += tuple;
        }

        self.buf = scratch;
        self.entry_count = kept.len() as i32;
        self.used_space = write_off as i32;
        self.free_space = (self.buf.len() - write_off) as i32;
        self.last_update_ms = now_ms();
        self.dirty = true;
        Ok(removed)
    }

    // ---------- персист ----------

    fn write_header_into_buf(&mut self) {
        LittleEndian::write_u32(&mut self.buf[0..4], INDEX_PAGE_MAGIC);
        LittleEndian::write_i32(&mut self.buf[4..8], self.entry_count);
        LittleEndian::write_i32(&mut self.buf[8..12], self.max_entries);
        LittleEndian::write_i32(&mut self.buf[12..16], self.used_space);
        LittleEndian::write_i32(&mut self.buf[16..20], self.free_space);
        LittleEndian::write_i64(&mut self.buf[20..28], self.last_update_ms);
        let cksum = fnv1a32_zeroed_field(&self.buf[..HDR], CKSUM_OFF);
        LittleEndian::write_u32(&mut self.buf[CKSUM_OFF..CKSUM_OFF + 4], cksum);
    }

    /// Записать страницу целиком по её позиции.
    pub fn persist(&mut self, file: &mut File) -> Result<()> {
        self.write_header_into_buf();
        file.seek(SeekFrom::Start(self.position as u64))?;
        file.write_all(&self.buf)?;
        self.dirty = false;
        Ok(())
    }

    /// Прочитать страницу из файла по слоту таблицы блоков.
    pub fn load_from(file: &mut File, page_index: u8, position: i64, size: usize) -> Result<Self> {
        let mut buf = vec![0u8; size];
        file.seek(SeekFrom::Start(position as u64))?;
        file.read_exact(&mut buf)
            .map_err(|e| anyhow!("corrupt header: short read of index page {}: {}", page_index, e))?;

        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != INDEX_PAGE_MAGIC {
            return Err(anyhow!(
                "corrupt header: bad index page magic {:#010x} (page {})",
                magic,
                page_index
            ));
        }
        let stored = LittleEndian::read_u32(&buf[CKSUM_OFF..CKSUM_OFF + 4]);
        let calc = fnv1a32_zeroed_field(&buf[..HDR], CKSUM_OFF);
        if stored != calc {
            return Err(anyhow!(
                "corrupt header: index page {} checksum mismatch",
                page_index
            ));
        }

        let entry_count = LittleEndian::read_i32(&buf[4..8]);
        let max_entries = LittleEndian::read_i32(&buf[8..12]);
        let used_space = LittleEndian::read_i32(&buf[12..16]);
        let free_space = LittleEndian::read_i32(&buf[16..20]);
        let last_update_ms = LittleEndian::read_i64(&buf[20..28]);

        if used_space < HDR as i32 || (used_space + free_space) as usize != size {
            return Err(anyhow!(
                "corrupt header: index page {} space accounting broken (used {}, free {}, size {})",
                page_index,
                used_space,
                free_space,
                size
            ));
        }

        Ok(Self {
            page_index,
            position,
            buf,
            entry_count,
            max_entries,
            used_space,
            free_space,
            last_update_ms,
            dirty: false,
        })
    }
}
