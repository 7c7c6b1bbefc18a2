//! engine/maintenance — flush и фоновый flush/GC-воркер.
//!
//! Воркер — выделенный поток, слушающий канал тиков: recv_timeout на
//! период gc_flush_interval. Закрытие канала в dispose — сигнал на выход;
//! dispose джойнит поток до закрытия файла. Поток держит Weak на
//! внутренности движка, чтобы не продлевать им жизнь.
//!
//! Ошибки тика логируются и гасятся; авто-shrink — не чаще раза в минуту
//! и только один за раз.

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::util::{kib, now_ms};

use super::core::{Core, Engine, EngineInner};

/// Минимальный интервал между автоматическими shrink, мс.
const AUTO_SHRINK_THROTTLE_MS: i64 = 60_000;

impl Engine {
    /// fsync + персист региона свободных блоков, грязных страниц индекса
    /// и заголовка.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_internal()
    }

    /// Советчик: имеет ли смысл звать shrink() прямо сейчас.
    /// Критерий: free/data > 0.5 и файл больше 1 MiB.
    pub fn should_shrink(&self) -> bool {
        let core = self.inner.core.lock();
        let file_size = match core.file_len() {
            Ok(n) => n,
            Err(_) => return false,
        };
        let data = file_size.saturating_sub(core.data_start());
        if data == 0 || file_size <= 1024 * 1024 {
            return false;
        }
        let free = core.free.total_free_bytes().max(0) as f64;
        free / data as f64 > 0.5
    }
}

impl EngineInner {
    pub(crate) fn flush_internal(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.flush()
    }

    /// Один тик воркера: flush, затем — при взведённом триггере — shrink.
    pub(crate) fn background_tick(&self) {
        if let Err(e) = self.flush_internal() {
            log::warn!("background flush failed: {:#}", e);
        }

        if !self.config.gc_auto_recycle_enabled {
            return;
        }
        if self.shrink_busy.load(Ordering::Acquire) {
            return;
        }
        let now = now_ms();
        if now - self.last_auto_shrink_ms.load(Ordering::Relaxed) < AUTO_SHRINK_THROTTLE_MS {
            return;
        }
        let armed = {
            let core = self.core.lock();
            should_trigger_gc(&core)
        };
        if !armed {
            return;
        }

        self.last_auto_shrink_ms.store(now, Ordering::Relaxed);
        match self.shrink_internal(false) {
            Ok(r) if r.saved_bytes > 0 => {
                log::info!(
                    "auto shrink reclaimed {} bytes ({:.1}%) in {} ms",
                    r.saved_bytes,
                    r.saved_percent,
                    r.elapsed_ms
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("auto shrink failed: {:#}", e),
        }
    }
}

/// Порог запуска GC по заголовку:
/// file_size ≥ gc_min_file_size ∧ active ≥ gc_min_records ∧
/// free/file ≥ threshold%.
pub(crate) fn should_trigger_gc(core: &Core) -> bool {
    let h = &core.header;
    let file_size = match core.file_len() {
        Ok(n) => n,
        Err(_) => return false,
    };
    if file_size < kib(h.gc_min_file_size_kb) {
        return false;
    }
    if (core.index.stats().active_entries as i64) < h.gc_min_record_count as i64 {
        return false;
    }
    if file_size == 0 {
        return false;
    }
    let free = core.free.total_free_bytes().max(0) as f64;
    free / file_size as f64 >= h.gc_free_space_threshold as f64 / 100.0
}

/// Запустить воркер, если период тика ненулевой.
pub(crate) fn spawn_gc_worker(inner: &Arc<EngineInner>) -> Result<()> {
    let secs = inner.config.gc_flush_interval;
    if secs == 0 {
        return Ok(());
    }

    let (tx, rx) = mpsc::channel::<()>();
    let weak = Arc::downgrade(inner);
    let handle = thread::Builder::new()
        .name("ultrakv-gc".to_string())
        .spawn(move || loop {
            match rx.recv_timeout(Duration::from_secs(secs as u64)) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.background_tick();
                }
                // Сообщение или закрытие канала — сигнал на выход
                _ => break,
            }
        })?;

    *inner.gc_stop.lock() = Some(tx);
    *inner.gc_handle.lock() = Some(handle);
    Ok(())
}
