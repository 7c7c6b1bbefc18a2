//! engine/shrink — компактная пересборка файла, устойчивая к сбоям.
//!
//! Последовательность:
//! 1) под write-мьютексом собрать все живые кортежи;
//! 2) в `<path>.tmp` записать свежие заголовки, пустой регион свободных
//!    блоков, единственную консолидированную страницу индекса и плотно
//!    упакованные слоты значений (копируются value_allocated_length байт);
//! 3) fsync tmp, затем rename path → path.bak, rename tmp → path;
//! 4) открыть новый файл, пересобрать компоненты на месте (общая карта
//!    key → entry сохраняет свой Arc), удалить .bak.
//!
//! Любая ошибка до переименований оставляет исходный файл нетронутым и
//! убирает tmp. Сбой второго rename пытается вернуть .bak на место.
//!
//! Та же механика используется при открытии, когда персистентная
//! конфигурация free-space разошлась с конфигом (геометрия файла едет).

use anyhow::{anyhow, Context, Result};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::codec::Codec;
use crate::config::UltraConfig;
use crate::consts::{
    first_index_data_pos, index_header_pos, INDEX_ENTRY_SIZE, INDEX_PAGE_HEADER_SIZE,
    MAX_INDEX_PAGES, MAX_INDEX_PAGE_SIZE,
};
use crate::free::FreeSpace;
use crate::header::DatabaseHeader;
use crate::index::page::AddOutcome;
use crate::index::manager::KeyCache;
use crate::index::{IndexBlock, IndexEntry, IndexHeader, IndexManager, IndexPage};
use crate::metrics;
use crate::util::{kib, now_ms};

use super::core::{Core, Engine, EngineInner};
use super::maintenance;

/// Итог компактации.
#[derive(Debug, Clone)]
pub struct ShrinkResult {
    pub original_size: u64,
    pub new_size: u64,
    pub saved_bytes: i64,
    pub saved_percent: f64,
    pub valid_records: usize,
    pub total_processed: usize,
    pub elapsed_ms: u64,
}

impl ShrinkResult {
    fn skipped(size: u64, started: Instant) -> Self {
        Self {
            original_size: size,
            new_size: size,
            saved_bytes: 0,
            saved_percent: 0.0,
            valid_records: 0,
            total_processed: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub(crate) struct RebuildOutcome {
    pub new_size: u64,
    pub valid_records: usize,
    pub total_processed: usize,
}

impl Engine {
    /// Пересобрать файл. Без force компактация пропускается (нулевой
    /// результат), пока не взведён GC-триггер.
    pub fn shrink(&self, force: bool) -> Result<ShrinkResult> {
        self.inner.shrink_internal(force)
    }
}

impl EngineInner {
    pub(crate) fn shrink_internal(&self, force: bool) -> Result<ShrinkResult> {
        if self.shrink_busy.swap(true, Ordering::AcqRel) {
            return Err(anyhow!("shrink failed: another shrink is already running"));
        }
        let result = self.shrink_guarded(force);
        self.shrink_busy.store(false, Ordering::Release);
        result
    }

    fn shrink_guarded(&self, force: bool) -> Result<ShrinkResult> {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;

        let original_size = core.file_len()?;
        if !force && !maintenance::should_trigger_gc(core) {
            return Ok(ShrinkResult::skipped(original_size, started));
        }

        let mut new_header = core.header.clone();
        new_header.last_gc_ms = now_ms();
        new_header.gc_total_count = new_header.gc_total_count.wrapping_add(1);

        let outcome = rebuild_and_swap(
            core,
            &self.path,
            new_header,
            Some(std::sync::Arc::clone(&self.cache)),
        )?;

        // Memory mode: кэш значений пересобирается пустым вместе с файлом
        if let Some(mv) = &self.mem_values {
            mv.write().clear();
        }

        let saved = original_size as i64 - outcome.new_size as i64;
        metrics::record_gc_run(saved.max(0) as u64);
        Ok(ShrinkResult {
            original_size,
            new_size: outcome.new_size,
            saved_bytes: saved,
            saved_percent: if original_size > 0 {
                saved as f64 * 100.0 / original_size as f64
            } else {
                0.0
            },
            valid_records: outcome.valid_records,
            total_processed: outcome.total_processed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Пересборка при открытии: на диске другая конфигурация free-space.
pub(crate) fn rebuild_for_reopen(
    path: &Path,
    mut file: File,
    old_header: DatabaseHeader,
    config: &UltraConfig,
) -> Result<()> {
    let codec = Codec::new(
        old_header.compression,
        old_header.encryption,
        &config.encryption_key,
    )?;
    let region = old_header.free_region_bytes();
    let data_start = first_index_data_pos(region);

    let free = FreeSpace::load(&mut file, data_start)?;
    let index = IndexManager::load(
        &mut file,
        index_header_pos(region),
        data_start,
        kib(old_header.default_index_page_size_kb) as i64,
        &codec,
        None,
    )?;
    let mut core = Core {
        file,
        header: old_header,
        free,
        index,
        codec,
    };

    let mut new_header = DatabaseHeader::from_config(config);
    new_header.created_ms = core.header.created_ms;
    new_header.last_gc_ms = now_ms();
    new_header.gc_total_count = core.header.gc_total_count.wrapping_add(1);

    rebuild_and_swap(&mut core, path, new_header, None)?;
    Ok(())
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Построить tmp, атомарно подменить файл, пересобрать компоненты core.
pub(crate) fn rebuild_and_swap(
    core: &mut Core,
    path: &Path,
    new_header: DatabaseHeader,
    reuse_cache: Option<KeyCache>,
) -> Result<RebuildOutcome> {
    let tmp_path = sibling_path(path, ".tmp");
    let bak_path = sibling_path(path, ".bak");

    let outcome = match build_tmp(core, &tmp_path, &new_header) {
        Ok(o) => o,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(anyhow!("shrink failed: {:#}", e));
        }
    };

    // Подмена: path -> bak, tmp -> path
    if let Err(e) = fs::rename(path, &bak_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(anyhow!("shrink failed: rename to .bak: {}", e));
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::rename(&bak_path, path);
        let _ = fs::remove_file(&tmp_path);
        return Err(anyhow!("shrink failed: swap in rebuilt file: {}", e));
    }

    // Открыть подменённый файл и пересобрать компоненты на месте
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("reopen rebuilt database {}", path.display()))?;
    let header = DatabaseHeader::load(&mut file)?;
    let region = header.free_region_bytes();
    let data_start = first_index_data_pos(region);
    let free = FreeSpace::load(&mut file, data_start)?;
    let index = IndexManager::load(
        &mut file,
        index_header_pos(region),
        data_start,
        kib(header.default_index_page_size_kb) as i64,
        &core.codec,
        reuse_cache,
    )?;

    core.file = file;
    core.header = header;
    core.free = free;
    core.index = index;

    if let Err(e) = fs::remove_file(&bak_path) {
        log::warn!("leaving stale backup {}: {}", bak_path.display(), e);
    }
    Ok(outcome)
}

/// Записать во временный файл полный образ новой БД: заголовки, пустой
/// регион, консолидированную страницу и плотную кучу значений.
fn build_tmp(
    core: &mut Core,
    tmp_path: &Path,
    new_header: &DatabaseHeader,
) -> Result<RebuildOutcome> {
    let entries = core.index.collect_active();
    let total_processed = entries.len();

    let _ = fs::remove_file(tmp_path);
    let mut tmp = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(tmp_path)
        .with_context(|| format!("create shrink tmp {}", tmp_path.display()))?;

    new_header.save(&mut tmp)?;
    let region = new_header.free_region_bytes();
    let data_start = first_index_data_pos(region);
    let mut free = FreeSpace::new(new_header.free_space_reuse, region, data_start);
    free.save(&mut tmp)?;

    // Кортежи консолидированной страницы: ключи перекодируются заново
    let mut tuples: Vec<(String, IndexEntry, Vec<u8>)> = Vec::with_capacity(entries.len());
    let mut total_size = INDEX_PAGE_HEADER_SIZE as i64;
    for (key, entry) in entries {
        if !entry.is_confirmed() {
            continue;
        }
        let processed = if core.codec.is_active() {
            core.codec.encode(key.as_bytes())?
        } else {
            key.as_bytes().to_vec()
        };
        total_size += (INDEX_ENTRY_SIZE + processed.len()) as i64;
        tuples.push((key, entry, processed));
    }
    if total_size > i32::MAX as i64 {
        return Err(anyhow!(
            "consolidated index page would be {} bytes (limit {})",
            total_size,
            i32::MAX
        ));
    }

    let default_bytes = kib(new_header.default_index_page_size_kb) as i64;
    let page_bytes = round_up_kib(total_size.max(default_bytes)).min(MAX_INDEX_PAGE_SIZE);
    let mut page = IndexPage::new(0, data_start as i64, page_bytes as usize);

    let mut offsets = Vec::with_capacity(tuples.len());
    for (key, _, processed) in &tuples {
        let reserved = IndexEntry::reserved(0, processed.len() as i32);
        match page.add_or_update(key.as_bytes(), reserved, processed, &core.codec)? {
            AddOutcome::Appended(off) => offsets.push(off),
            other => {
                return Err(anyhow!(
                    "consolidated page rejected tuple for '{}': {:?}",
                    key,
                    other
                ))
            }
        }
    }

    // Плотное копирование слотов значений за страницей
    let mut write_pos = data_start + page_bytes as u64;
    tmp.seek(SeekFrom::Start(write_pos))?;
    let buf_cap = kib(new_header.write_buffer_kb).max(4 * 1024) as usize;
    let mut writer = BufWriter::with_capacity(buf_cap, &mut tmp);
    let mut valid = 0usize;

    for ((key, entry, processed), off) in tuples.iter().zip(&offsets) {
        let alloc = entry.value_allocated_length.max(entry.value_length) as usize;
        let mut raw = vec![0u8; alloc];
        core.file.seek(SeekFrom::Start(entry.value_position as u64))?;
        core.file
            .read_exact(&mut raw)
            .with_context(|| format!("copy value slot for '{}'", key))?;
        writer.write_all(&raw)?;

        let confirmed = IndexEntry {
            is_deleted: false,
            page_index: 0,
            key_length: processed.len() as i32,
            value_position: write_pos as i64,
            value_length: entry.value_length,
            value_allocated_length: alloc as i32,
            timestamp: entry.timestamp,
        };
        page.write_entry_at(*off, confirmed)?;
        write_pos += alloc as u64;
        valid += 1;
    }
    writer.flush()?;
    drop(writer);

    page.persist(&mut tmp)?;

    let mut ih = IndexHeader::new(data_start);
    ih.page_count = 1;
    ih.total_index_bytes = page_bytes;
    ih.total_entries = valid as i32;
    ih.active_entries = valid as i32;
    let mut blocks = [IndexBlock::default(); MAX_INDEX_PAGES];
    blocks[0] = IndexBlock {
        page_position: data_start as i64,
        page_size: page_bytes,
    };
    ih.save(&mut tmp, index_header_pos(region), &blocks)?;

    tmp.set_len(write_pos)?;
    tmp.sync_all()?;

    Ok(RebuildOutcome {
        new_size: write_pos,
        valid_records: valid,
        total_processed,
    })
}

#[inline]
fn round_up_kib(n: i64) -> i64 {
    (n + 1023) / 1024 * 1024
}
