//! engine/core — ядро: структура Engine, связка компонентов, статистика.
//!
//! Модель владения: Engine — тонкая ручка над Arc<EngineInner>. Вся
//! мутация файла/аллокатора/индекса сериализуется одним write-мьютексом
//! (core). Карта key → entry живёт в RwLock и читается без core-мьютекса
//! (contains/get_all_keys/stats); пишется только под ним.
//!
//! Drop = dispose: остановка фонового воркера, финальный flush, отметка
//! времени доступа. Ошибки в Drop гасятся.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use anyhow::Result;

use crate::codec::Codec;
use crate::config::UltraConfig;
use crate::consts::first_index_data_pos;
use crate::free::FreeSpace;
use crate::header::DatabaseHeader;
use crate::index::manager::KeyCache;
use crate::index::{IndexManager, IndexStats};
use crate::metrics;
use crate::util::now_ms;

/// Состояние под write-мьютексом: файл и все его владельцы-компоненты.
pub(crate) struct Core {
    pub file: File,
    pub header: DatabaseHeader,
    pub free: FreeSpace,
    pub index: IndexManager,
    pub codec: Codec,
}

impl Core {
    /// Начало области данных (страницы индекса + куча значений).
    #[inline]
    pub fn data_start(&self) -> u64 {
        first_index_data_pos(self.header.free_region_bytes())
    }

    #[inline]
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Разместить need байт: сначала freed-блок (best-fit), иначе рост
    /// файла на need × allocation_factor через set_len.
    pub fn allocate(&mut self, need: i32) -> Result<(i64, i32)> {
        if let Some(block) = self.free.try_reserve(need as i64) {
            metrics::record_free_reuse_hit();
            let granted = block.size.min(i32::MAX as i64) as i32;
            return Ok((block.position, granted));
        }
        metrics::record_free_reuse_miss();

        let end = self.file.seek(SeekFrom::End(0))? as i64;
        let grow = ((need as f64) * self.header.allocation_factor()).ceil() as i64;
        let grow = grow.max(need as i64).min(i32::MAX as i64);
        self.file.set_len((end + grow) as u64)?;
        Ok((end, grow as i32))
    }

    /// Полный flush: грязные страницы индекса, регион свободных блоков,
    /// заголовок БД, затем fsync файла.
    pub fn flush(&mut self) -> Result<()> {
        self.index.save(&mut self.file)?;
        if self.free.is_dirty() {
            self.free.save(&mut self.file)?;
        }
        self.header.save(&mut self.file)?;
        self.file.sync_all()?;
        metrics::record_flush();
        Ok(())
    }
}

pub(crate) struct EngineInner {
    pub path: PathBuf,
    pub config: UltraConfig,
    pub core: Mutex<Core>,
    /// Общая с IndexManager карта key → entry (читается без core-мьютекса).
    pub cache: KeyCache,
    /// Кэш значений для memory mode (None, если режим выключен).
    pub mem_values: Option<RwLock<HashMap<String, Vec<u8>>>>,
    /// Ключи индекса не прошли AEAD при открытии: чтения должны падать
    /// с auth failed, а не возвращать тихий промах.
    pub auth_suspect: bool,
    pub shrink_busy: AtomicBool,
    pub last_auto_shrink_ms: AtomicI64,
    pub gc_stop: Mutex<Option<mpsc::Sender<()>>>,
    pub gc_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Встраиваемый однофайловый движок ключ/значение.
///
/// Потокобезопасен: ручку можно завернуть в Arc и делить между потоками.
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl Engine {
    /// Снимок статистики движка.
    pub fn stats(&self) -> EngineStats {
        let core = self.inner.core.lock();
        let file_size = core.file_len().unwrap_or(0);
        EngineStats {
            record_count: self.inner.cache.read().len(),
            file_size,
            data_start: core.data_start(),
            free_block_count: core.free.block_count(),
            free_bytes: core.free.total_free_bytes(),
            fragmentation: core.free.fragmentation(),
            index: core.index.stats(),
        }
    }

    /// Путь файла БД.
    pub fn path(&self) -> &std::path::Path {
        &self.inner.path
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // 1) Остановить фоновый воркер (закрытие канала + join).
        if let Some(tx) = self.inner.gc_stop.lock().take() {
            drop(tx);
        }
        if let Some(handle) = self.inner.gc_handle.lock().take() {
            let _ = handle.join();
        }

        // 2) Финальный flush + отметка времени доступа (best-effort).
        let _ = (|| -> Result<()> {
            let mut core = self.inner.core.lock();
            core.header.last_access_ms = now_ms();
            core.flush()
        })();
    }
}

/// Сводка состояния движка.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Живые ключи (по кэшу).
    pub record_count: usize,
    pub file_size: u64,
    pub data_start: u64,
    pub free_block_count: usize,
    pub free_bytes: i64,
    /// 1 - largest_block / (total_free / block_count); 0.0 без блоков.
    pub fragmentation: f64,
    pub index: IndexStats,
}

impl EngineStats {
    /// Байты области данных (без заголовков и региона).
    #[inline]
    pub fn data_bytes(&self) -> u64 {
        self.file_size.saturating_sub(self.data_start)
    }
}
