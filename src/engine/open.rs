//! engine/open — создание и открытие файла БД.
//!
//! Открытие существующего файла:
//! - валидация DatabaseHeader (magic/version/checksum) — порча фатальна;
//! - сверка кодека с конфигом ("config mismatch");
//! - дрейф настроек free-space (флаг или размер региона двигают геометрию
//!   файла) — автоматическая пересборка в новую раскладку до открытия;
//! - загрузка региона свободных блоков и всех страниц индекса, полное
//!   восстановление кэша key → entry;
//! - запуск фонового flush/GC-воркера при gc_flush_interval > 0.

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::Arc;

use crate::codec::Codec;
use crate::config::UltraConfig;
use crate::consts::{first_index_data_pos, index_header_pos};
use crate::free::FreeSpace;
use crate::header::DatabaseHeader;
use crate::index::IndexManager;
use crate::util::{kib, now_ms};

use super::core::{Core, Engine, EngineInner};
use super::maintenance;
use super::shrink;

impl Engine {
    /// Открыть движок; файл создаётся, если его нет.
    pub fn open<P: AsRef<Path>>(path: P, config: UltraConfig) -> Result<Engine> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            create_file(&path, &config)?;
        } else {
            prepare_existing(&path, &config)?;
        }

        let engine = open_existing(path, config)?;
        maintenance::spawn_gc_worker(&engine.inner)?;
        Ok(engine)
    }
}

/// Кодек файла фиксирован при создании; расхождение с конфигом — отказ.
fn check_codec_matches(header: &DatabaseHeader, config: &UltraConfig) -> Result<()> {
    if header.compression != config.compression_type || header.encryption != config.encryption_type
    {
        return Err(anyhow!(
            "config mismatch: database codec is {}/{} but config supplies {}/{}",
            header.compression,
            header.encryption,
            config.compression_type,
            config.encryption_type
        ));
    }
    Ok(())
}

/// Новый файл: заголовки + пустой регион + пустой индекс, длина = data_start.
fn create_file(path: &Path, config: &UltraConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create parent dir {}", parent.display()))?;
        }
    }

    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("create database file {}", path.display()))?;

    let header = DatabaseHeader::from_config(config);
    header.save(&mut file)?;

    let region = header.free_region_bytes();
    let data_start = first_index_data_pos(region);

    let mut free = FreeSpace::new(header.free_space_reuse, region, data_start);
    free.save(&mut file)?;

    IndexManager::create(
        &mut file,
        index_header_pos(region),
        data_start,
        kib(header.default_index_page_size_kb) as i64,
    )?;

    file.set_len(data_start)?;
    file.sync_all()?;
    Ok(())
}

/// Предпроверка существующего файла: кодек и дрейф free-space конфига.
fn prepare_existing(path: &Path, config: &UltraConfig) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open database file {}", path.display()))?;
    let header = DatabaseHeader::load(&mut file)?;
    check_codec_matches(&header, config)?;

    let want_reuse = config.free_space_reuse_effective();
    let want_region_kb = if want_reuse {
        config.free_space_region_size_kb
    } else {
        0
    };
    if header.free_space_reuse != want_reuse || header.free_space_region_kb != want_region_kb {
        log::info!(
            "free-space configuration changed (reuse {} -> {}, region {} KiB -> {} KiB), rebuilding {}",
            header.free_space_reuse,
            want_reuse,
            header.free_space_region_kb,
            want_region_kb,
            path.display()
        );
        shrink::rebuild_for_reopen(path, file, header, config)?;
    }
    Ok(())
}

fn open_existing(path: PathBuf, config: UltraConfig) -> Result<Engine> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open database file {}", path.display()))?;

    let mut header = DatabaseHeader::load(&mut file)?;
    check_codec_matches(&header, &config)?;

    // Рантайм-тюнаблы освежаются из конфига; форматные поля (кодек,
    // регион free-space) остаются как записаны при создании.
    header.update_validation = config.enable_update_validation;
    header.memory_mode = config.enable_memory_mode;
    header.allocation_multiplier = config.allocation_multiplier;
    header.write_buffer_kb = config.write_buffer_size_kb;
    header.read_buffer_kb = config.read_buffer_size_kb;
    header.gc_min_file_size_kb = config.gc_min_file_size_kb;
    header.gc_free_space_threshold = config.gc_free_space_threshold;
    header.gc_min_record_count = config.gc_min_record_count;
    header.gc_flush_interval_secs = config.gc_flush_interval;
    header.gc_auto_recycle = config.gc_auto_recycle_enabled;
    header.max_key_length = config.max_key_length;
    header.default_index_page_size_kb = config.default_index_page_size_kb;
    header.last_access_ms = now_ms();

    let codec = Codec::new(header.compression, header.encryption, &config.encryption_key)?;

    let region = header.free_region_bytes();
    let data_start = first_index_data_pos(region);

    let free = FreeSpace::load(&mut file, data_start)?;
    let index = IndexManager::load(
        &mut file,
        index_header_pos(region),
        data_start,
        kib(header.default_index_page_size_kb) as i64,
        &codec,
        None,
    )?;

    let cache = index.cache_handle();
    let auth_suspect = index.auth_suspect();
    if auth_suspect {
        log::warn!(
            "{}: index keys failed AEAD verification; reads will report auth failures",
            path.display()
        );
    }

    let mem_values = if config.enable_memory_mode {
        Some(RwLock::new(HashMap::new()))
    } else {
        None
    };

    let inner = EngineInner {
        path,
        config,
        core: Mutex::new(Core {
            file,
            header,
            free,
            index,
            codec,
        }),
        cache,
        mem_values,
        auth_suspect,
        shrink_busy: AtomicBool::new(false),
        last_auto_shrink_ms: AtomicI64::new(0),
        gc_stop: Mutex::new(None),
        gc_handle: Mutex::new(None),
    };

    Ok(Engine {
        inner: Arc::new(inner),
    })
}
