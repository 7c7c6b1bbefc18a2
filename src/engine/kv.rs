//! engine/kv — point-операции движка.
//!
//! Путь записи: ключ валидируется → резервация кортежа в странице →
//! значение кодируется → слот (freed-блок либо рост файла) → запись →
//! confirm кортежа. Ошибка на любом шаге откатывает резервацию, так что
//! contains() после неудачного put() возвращает false.
//!
//! Путь чтения: кэш авторитетен для живости ключа; файл читается под тем
//! же write-мьютексом (одна ручка файла, грубая сериализация — см. §бенчи).
//! Ошибки чтения/декодирования гасятся в None с логом; единственное
//! исключение — AEAD-отказ, он поднимается наружу как auth failed.

use anyhow::{anyhow, Result};

use crate::codec::is_auth_error;
use crate::heap;
use crate::index::{IndexEntry, Reservation};
use crate::metrics;
use crate::util::now_ms;

use super::core::{Core, Engine};

impl Engine {
    /// Записать значение по ключу (вставка или обновление).
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_key(key)?;

        let mut guard = self.inner.core.lock();
        let core = &mut *guard;

        let res = core.index.reserve(&mut core.file, key, &core.codec)?;
        match place_value(core, &res, value) {
            Ok((confirmed, release_old)) => {
                core.index.confirm(&res, confirmed)?;
                // Старый слот отпускается только после подтверждения
                if let Some((pos, len)) = release_old {
                    core.free.release(pos, len);
                }
                if let Some(mv) = &self.inner.mem_values {
                    mv.write().insert(key.to_string(), value.to_vec());
                }
                metrics::record_put();
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = core.index.rollback(&res) {
                    log::warn!("rollback after failed put of '{}': {:#}", key, rb);
                }
                Err(e)
            }
        }
    }

    /// Прочитать значение. None — ключа нет (или запись нечитаема, с логом).
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        metrics::record_get();

        // Оптимистичная проверка живости без write-мьютекса
        if !self.inner.cache.read().contains_key(key) {
            if self.inner.auth_suspect {
                return Err(anyhow!(
                    "auth failed: index keys could not be verified with the configured encryption key"
                ));
            }
            metrics::record_get_miss();
            return Ok(None);
        }

        if let Some(mv) = &self.inner.mem_values {
            if let Some(v) = mv.read().get(key) {
                return Ok(Some(v.clone()));
            }
        }

        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        // Перечитать дескриптор под мьютексом: параллельный put мог
        // передвинуть слот между оптимистичной проверкой и чтением файла
        let entry = match self.inner.cache.read().get(key).copied() {
            Some(e) => e,
            None => {
                metrics::record_get_miss();
                return Ok(None);
            }
        };
        match heap::read_record(
            &mut core.file,
            &core.codec,
            entry.value_position,
            entry.value_length,
        ) {
            Ok(Some(v)) => {
                if let Some(mv) = &self.inner.mem_values {
                    mv.write().insert(key.to_string(), v.clone());
                }
                Ok(Some(v))
            }
            Ok(None) => {
                // Тумбстоун на диске — единственный случай евикции из кэша
                self.inner.cache.write().remove(key);
                metrics::record_get_miss();
                Ok(None)
            }
            Err(e) if is_auth_error(&e) => Err(e),
            Err(e) => {
                log::warn!("get('{}') failed, returning None: {:#}", key, e);
                metrics::record_get_miss();
                Ok(None)
            }
        }
    }

    /// Чистая проверка кэша (кэш авторитетен после загрузки менеджера).
    pub fn contains(&self, key: &str) -> bool {
        self.inner.cache.read().contains_key(key)
    }

    /// Удалить ключ. true, если ключ существовал.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        let existed = delete_locked(core, key)?;
        if existed {
            if let Some(mv) = &self.inner.mem_values {
                mv.write().remove(key);
            }
            metrics::record_delete();
        }
        Ok(existed)
    }

    /// Пакетное удаление в одной критической секции. Возвращает число
    /// реально удалённых ключей.
    pub fn delete_batch<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize> {
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        let mut removed = 0usize;
        for key in keys {
            if delete_locked(core, key.as_ref())? {
                if let Some(mv) = &self.inner.mem_values {
                    mv.write().remove(key.as_ref());
                }
                metrics::record_delete();
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Снимок всех живых ключей (порядок не определён).
    pub fn get_all_keys(&self) -> Vec<String> {
        self.inner.cache.read().keys().cloned().collect()
    }

    /// Опустошить БД: пустой индекс, пустой регион, файл усечён до начала
    /// области данных.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;

        core.index.clear(&mut core.file)?;
        core.free.clear();
        core.free.save(&mut core.file)?;

        let data_start = core.data_start();
        core.file.set_len(data_start)?;
        core.header.last_access_ms = now_ms();
        core.header.save(&mut core.file)?;
        core.file.sync_all()?;

        if let Some(mv) = &self.inner.mem_values {
            mv.write().clear();
        }
        Ok(())
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(anyhow!("bad key: key must not be empty"));
        }
        let max = self.inner.config.max_key_length as usize;
        if key.len() > max {
            return Err(anyhow!(
                "bad key: {} bytes exceeds max_key_length {}",
                key.len(),
                max
            ));
        }
        Ok(())
    }
}

/// Разместить значение для резервации: кортеж с реальными координатами и
/// (для переехавшего обновления) старый слот, который надо отпустить после
/// confirm.
fn place_value(
    core: &mut Core,
    res: &Reservation,
    value: &[u8],
) -> Result<(IndexEntry, Option<(i64, i64)>)> {
    let record = heap::build_record(&core.codec, value)?;
    let need = record.len() as i32;

    // При включённой валидации перезапись на месте запрещена: неудачная
    // проверка не должна затирать прежние байты слота. Обновление идёт в
    // свежий слот, старый отпускается только после confirm.
    let in_place = !core.header.update_validation
        && !res.fresh
        && res.entry.is_confirmed()
        && need <= res.entry.value_allocated_length;

    let (pos, alloc, release_old) = if in_place {
        (
            res.entry.value_position,
            res.entry.value_allocated_length,
            None,
        )
    } else {
        let (pos, alloc) = core.allocate(need)?;
        let old = if !res.fresh && res.entry.is_confirmed() {
            Some((
                res.entry.value_position,
                res.entry.value_allocated_length as i64,
            ))
        } else {
            None
        };
        (pos, alloc, old)
    };

    if let Err(e) = heap::write_record(&mut core.file, pos, &record) {
        if !in_place {
            core.free.release(pos, alloc as i64);
        }
        return Err(e);
    }

    if core.header.update_validation {
        let ok = match heap::read_record(&mut core.file, &core.codec, pos, need) {
            Ok(Some(back)) => back == value,
            _ => false,
        };
        if !ok {
            if !in_place {
                core.free.release(pos, alloc as i64);
            }
            return Err(anyhow!(
                "validation failed: read-back mismatch for key '{}'",
                res.key
            ));
        }
    }

    let confirmed = IndexEntry {
        is_deleted: false,
        page_index: res.entry.page_index,
        key_length: res.entry.key_length,
        value_position: pos,
        value_length: need,
        value_allocated_length: alloc,
        timestamp: now_ms(),
    };
    Ok((confirmed, release_old))
}

/// Удаление под уже взятым write-мьютексом (используется и батчем).
fn delete_locked(core: &mut Core, key: &str) -> Result<bool> {
    let Some(entry) = core.index.remove(key, &core.codec)? else {
        return Ok(false);
    };
    if entry.is_confirmed() {
        heap::mark_deleted(&mut core.file, core.codec.is_active(), entry.value_position)?;
        core.free
            .release(entry.value_position, entry.value_allocated_length as i64);
    }
    Ok(true)
}
