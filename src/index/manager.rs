//! index/manager — набор страниц (≤32) + in-memory карта key → entry.
//!
//! Протокол Put:
//! 1) reserve(): для нового ключа кортеж с value_position = -1 дописывается
//!    в подходящую страницу ((a) страница с этим ключом — через кэш,
//!    (b) страница со свободным местом, (c) страница, где место появится
//!    после compact(), (d) новая страница), кэш получает резервацию;
//! 2) вызывающая сторона пишет значение и узнаёт реальные
//!    value_position/length/allocated;
//! 3) confirm() перезаписывает тот же кортеж на месте и освежает кэш;
//!    при ошибке записи значения rollback() убирает свежий кортеж
//!    (для обновления существующего ключа старый слот остаётся валидным).
//!
//! Кэш — отражение всех страниц; каждая мутация страницы отражается в
//! кэше до того, как страница считается устойчивой. Записи в кэш идут
//! только под общим write-мьютексом движка; чтения свободны.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;

use crate::codec::Codec;
use crate::consts::{
    INDEX_ENTRY_SIZE, MAX_INDEX_PAGES, MAX_INDEX_PAGE_SIZE, MIN_INDEX_PAGE_SIZE,
};
use crate::index::page::AddOutcome;
use crate::index::{IndexBlock, IndexEntry, IndexHeader, IndexPage};
use crate::util::now_ms;

/// Общая карта key → entry (живые подтверждённые + свежие резервации).
pub type KeyCache = Arc<RwLock<HashMap<String, IndexEntry>>>;

/// Резервация кортежа под Put.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub key: String,
    /// Для свежего ключа — кортеж-резервация; для обновления — текущий
    /// дескриптор (его слот значения переиспользуется, если влезает).
    pub entry: IndexEntry,
    /// Смещение кортежа внутри страницы entry.page_index.
    pub offset: usize,
    pub fresh: bool,
}

/// Сводка состояния индекса.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStats {
    pub page_count: u8,
    pub max_pages: u8,
    pub total_index_bytes: i64,
    pub total_entries: i32,
    pub active_entries: i32,
    pub deleted_entries: i32,
    pub utilization: f64,
}

pub struct IndexManager {
    header: IndexHeader,
    header_pos: u64,
    first_data_pos: u64,
    default_page_bytes: i64,
    blocks: [IndexBlock; MAX_INDEX_PAGES],
    pages: Vec<IndexPage>,
    cache: KeyCache,
    /// Хотя бы один ключ страницы не прошёл AEAD при загрузке: читающая
    /// сторона должна отдавать "auth failed" вместо тихого промаха.
    auth_suspect: bool,
    dirty: bool,
}

impl IndexManager {
    /// Новый пустой индекс; первая страница создаётся лениво при первом Put.
    pub fn create(
        file: &mut File,
        header_pos: u64,
        first_data_pos: u64,
        default_page_bytes: i64,
    ) -> Result<Self> {
        let header = IndexHeader::new(first_data_pos);
        let blocks = [IndexBlock::default(); MAX_INDEX_PAGES];
        header.save(file, header_pos, &blocks)?;
        Ok(Self {
            header,
            header_pos,
            first_data_pos,
            default_page_bytes,
            blocks,
            pages: Vec::new(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            auth_suspect: false,
            dirty: false,
        })
    }

    /// Загрузка существующего индекса: заголовок, таблица блоков, страницы,
    /// затем полное восстановление кэша по живым кортежам.
    ///
    /// `reuse_cache` позволяет сохранить общий Arc карты через пересборку
    /// файла (shrink): читатели продолжают видеть ту же карту.
    pub fn load(
        file: &mut File,
        header_pos: u64,
        first_data_pos: u64,
        default_page_bytes: i64,
        codec: &Codec,
        reuse_cache: Option<KeyCache>,
    ) -> Result<Self> {
        let (header, blocks) = IndexHeader::load(file, header_pos)?;

        let mut pages = Vec::with_capacity(header.page_count as usize);
        for i in 0..header.page_count as usize {
            let blk = blocks[i];
            if !blk.is_valid() {
                return Err(anyhow!(
                    "corrupt header: index block {} is empty but page_count is {}",
                    i,
                    header.page_count
                ));
            }
            pages.push(IndexPage::load_from(
                file,
                i as u8,
                blk.page_position,
                blk.page_size as usize,
            )?);
        }

        let mut map: HashMap<String, IndexEntry> = HashMap::new();
        let mut key_auth_failures = 0usize;
        for page in &pages {
            key_auth_failures += page.for_each_active(codec, |plain, _, entry| {
                // Неподтверждённые резервации (упавший Put) не оживляем
                if !entry.is_confirmed() {
                    return;
                }
                if let Ok(key) = String::from_utf8(plain) {
                    map.insert(key, entry);
                }
            })?;
        }

        let cache = match reuse_cache {
            Some(shared) => {
                let mut guard = shared.write();
                *guard = map;
                drop(guard);
                shared
            }
            None => Arc::new(RwLock::new(map)),
        };

        Ok(Self {
            header,
            header_pos,
            first_data_pos,
            default_page_bytes,
            blocks,
            pages,
            cache,
            auth_suspect: key_auth_failures > 0,
            dirty: false,
        })
    }

    // ---------- доступ ----------

    #[inline]
    pub fn cache_handle(&self) -> KeyCache {
        Arc::clone(&self.cache)
    }

    #[inline]
    pub fn auth_suspect(&self) -> bool {
        self.auth_suspect
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn stats(&self) -> IndexStats {
        let total = self.header.total_entries;
        let active = self.header.active_entries;
        IndexStats {
            page_count: self.pages.len() as u8,
            max_pages: MAX_INDEX_PAGES as u8,
            total_index_bytes: self.header.total_index_bytes,
            total_entries: total,
            active_entries: active,
            deleted_entries: self.header.deleted_entries,
            utilization: if total > 0 {
                active as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Снимок живых пар (key, entry) из кэша. Порядок не определён.
    pub fn collect_active(&self) -> Vec<(String, IndexEntry)> {
        self.cache
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect()
    }

    // ---------- reserve → confirm → rollback ----------

    pub fn reserve(&mut self, file: &mut File, key: &str, codec: &Codec) -> Result<Reservation> {
        // Существующий ключ: переиспользуем кортеж и слот значения
        let cached = self.cache.read().get(key).copied();
        if let Some(entry) = cached {
            let page = self.page_mut(entry.page_index)?;
            let (offset, _) = page
                .find(key.as_bytes(), codec)?
                .ok_or_else(|| anyhow!("index cache is out of sync for an existing key"))?;
            return Ok(Reservation {
                key: key.to_string(),
                entry,
                offset,
                fresh: false,
            });
        }

        let processed = if codec.is_active() {
            codec.encode(key.as_bytes())?
        } else {
            key.as_bytes().to_vec()
        };

        let page_idx = self.pick_page(file, processed.len())?;
        let reserved = IndexEntry::reserved(page_idx as u8, processed.len() as i32);
        let outcome =
            self.pages[page_idx].add_or_update(key.as_bytes(), reserved, &processed, codec)?;
        let offset = match outcome {
            AddOutcome::Appended(off) => off,
            AddOutcome::Present => {
                return Err(anyhow!("index cache is out of sync: key already on page"))
            }
            AddOutcome::NoSpace => {
                return Err(anyhow!("index page selection returned a full page"))
            }
        };

        let entry = self.pages[page_idx].entry_at(offset)?;
        self.cache.write().insert(key.to_string(), entry);
        self.header.total_entries += 1;
        self.header.active_entries += 1;
        self.header.updated_ms = now_ms();
        self.dirty = true;

        Ok(Reservation {
            key: key.to_string(),
            entry,
            offset,
            fresh: true,
        })
    }

    /// Перезаписать зарезервированный кортеж реальными координатами слота.
    pub fn confirm(&mut self, res: &Reservation, confirmed: IndexEntry) -> Result<()> {
        let page = self.page_mut(res.entry.page_index)?;
        page.write_entry_at(res.offset, confirmed)?;
        let stored = page.entry_at(res.offset)?;
        self.cache.write().insert(res.key.clone(), stored);
        self.header.updated_ms = now_ms();
        self.dirty = true;
        Ok(())
    }

    /// Откат резервации после ошибки записи значения. Для обновления
    /// существующего ключа кортеж и кэш остаются как были.
    pub fn rollback(&mut self, res: &Reservation) -> Result<()> {
        if !res.fresh {
            return Ok(());
        }
        let page = self.page_mut(res.entry.page_index)?;
        page.rollback_reserved(res.offset)?;
        self.cache.write().remove(&res.key);
        self.header.total_entries -= 1;
        self.header.active_entries -= 1;
        self.header.updated_ms = now_ms();
        self.dirty = true;
        Ok(())
    }

    /// Пометить ключ удалённым. Возвращает прежний дескриптор (слот
    /// значения освобождает вызывающая сторона).
    pub fn remove(&mut self, key: &str, codec: &Codec) -> Result<Option<IndexEntry>> {
        let entry = match self.cache.write().remove(key) {
            Some(e) => e,
            None => return Ok(None),
        };
        let page = self.page_mut(entry.page_index)?;
        page.remove(key.as_bytes(), codec)?;
        // Порог уплотнения страницы: удалённых >= 30% кортежей
        if page.needs_compact() {
            let removed = page.compact()?;
            self.header.total_entries -= removed;
            self.header.deleted_entries -= removed;
        }
        self.header.active_entries -= 1;
        self.header.deleted_entries += 1;
        self.header.updated_ms = now_ms();
        self.dirty = true;
        Ok(Some(entry))
    }

    // ---------- выбор страницы ----------

    fn pick_page(&mut self, file: &mut File, key_len: usize) -> Result<usize> {
        let need = INDEX_ENTRY_SIZE + key_len;

        // (b) страница со свободным местом
        if let Some(i) = self.pages.iter().position(|p| p.has_space(key_len)) {
            return Ok(i);
        }

        // (c) страница, где место появится после уплотнения
        for i in 0..self.pages.len() {
            let (deleted, reclaimable) = self.pages[i].deleted_stats()?;
            if deleted > 0 && (self.pages[i].free_space() + reclaimable) as usize >= need {
                let removed = self.pages[i].compact()?;
                self.header.total_entries -= removed;
                self.header.deleted_entries -= removed;
                self.dirty = true;
                return Ok(i);
            }
        }

        // (d) новая страница
        self.create_new_page(file)
    }

    /// Новая страница: первая — в начале области данных размером из
    /// конфига; каждая следующая — в конце файла, размером
    /// prev_total × 2, с клампом [1 KiB, 2 GiB].
    fn create_new_page(&mut self, file: &mut File) -> Result<usize> {
        if self.pages.len() >= MAX_INDEX_PAGES {
            return Err(anyhow!(
                "index full: all {} index pages are in use",
                MAX_INDEX_PAGES
            ));
        }

        let (position, size) = if self.pages.is_empty() {
            (self.first_data_pos as i64, self.default_page_bytes)
        } else {
            let size = (self.header.total_index_bytes * 2)
                .clamp(MIN_INDEX_PAGE_SIZE, MAX_INDEX_PAGE_SIZE);
            let end = file.seek(SeekFrom::End(0))? as i64;
            (end, size)
        };

        let idx = self.pages.len();
        let mut page = IndexPage::new(idx as u8, position, size as usize);
        page.persist(file)?;

        self.blocks[idx] = IndexBlock {
            page_position: position,
            page_size: size,
        };
        self.pages.push(page);
        self.header.page_count = self.pages.len() as u8;
        self.header.total_index_bytes += size;
        self.header.updated_ms = now_ms();
        self.dirty = true;
        Ok(idx)
    }

    #[inline]
    fn page_mut(&mut self, page_index: u8) -> Result<&mut IndexPage> {
        self.pages
            .get_mut(page_index as usize)
            .ok_or_else(|| anyhow!("index page {} does not exist", page_index))
    }

    // ---------- персист / сброс ----------

    /// Сохранить заголовок, таблицу блоков и все грязные страницы.
    pub fn save(&mut self, file: &mut File) -> Result<()> {
        for page in self.pages.iter_mut().filter(|p| p.is_dirty()) {
            page.persist(file)?;
        }
        if self.dirty {
            self.header.save(file, self.header_pos, &self.blocks)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Полный сброс (clear): страницы выбрасываются, кэш пустеет,
    /// заголовок и таблица блоков перезаписываются нулями.
    pub fn clear(&mut self, file: &mut File) -> Result<()> {
        self.pages.clear();
        self.blocks = [IndexBlock::default(); MAX_INDEX_PAGES];
        self.header.page_count = 0;
        self.header.total_index_bytes = 0;
        self.header.total_entries = 0;
        self.header.active_entries = 0;
        self.header.deleted_entries = 0;
        self.header.updated_ms = now_ms();
        self.cache.write().clear();
        self.header.save(file, self.header_pos, &self.blocks)?;
        self.dirty = false;
        Ok(())
    }
}
