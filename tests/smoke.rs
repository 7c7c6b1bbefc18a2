use anyhow::Result;
use std::path::PathBuf;

use ultrakv::{Engine, UltraConfig};

#[test]
fn smoke_put_get_update_delete() -> Result<()> {
    let path = unique_path("smoke");
    let engine = Engine::open(&path, quiet_config())?;

    // insert → update → get последнего значения
    engine.put("alpha", b"A")?;
    engine.put("alpha", b"AA")?;
    assert_eq!(engine.get("alpha")?.as_deref(), Some(&b"AA"[..]));

    let stats = engine.stats();
    assert_eq!(stats.record_count, 1);
    assert_eq!(stats.index.deleted_entries, 0);
    // Обновление переиспользовало кортеж, а не добавило второй
    assert_eq!(stats.index.total_entries, 1);

    // contains согласован с get
    assert!(engine.contains("alpha"));
    assert_eq!(engine.contains("alpha"), engine.get("alpha")?.is_some());
    assert!(!engine.contains("missing"));
    assert!(engine.get("missing")?.is_none());

    // delete
    assert!(engine.delete("alpha")?);
    assert!(!engine.contains("alpha"));
    assert!(engine.get("alpha")?.is_none());
    assert!(!engine.delete("alpha")?);

    Ok(())
}

#[test]
fn bad_keys_rejected() -> Result<()> {
    let path = unique_path("badkey");
    let engine = Engine::open(&path, quiet_config().with_max_key_length(16))?;

    let err = engine.put("", b"v").unwrap_err();
    assert!(err.to_string().contains("bad key"));

    let long = "k".repeat(17);
    let err = engine.put(&long, b"v").unwrap_err();
    assert!(err.to_string().contains("bad key"));

    // Неудачная запись не оставляет следа
    assert!(!engine.contains(&long));
    Ok(())
}

#[test]
fn get_all_keys_snapshot() -> Result<()> {
    let path = unique_path("allkeys");
    let engine = Engine::open(&path, quiet_config())?;

    for i in 0..20 {
        engine.put(&format!("key_{}", i), format!("value_{}", i).as_bytes())?;
    }
    let mut keys = engine.get_all_keys();
    keys.sort();
    assert_eq!(keys.len(), 20);
    assert_eq!(keys[0], "key_0");

    Ok(())
}

#[test]
fn clear_empties_engine() -> Result<()> {
    let path = unique_path("clear");
    let engine = Engine::open(&path, quiet_config())?;

    for i in 0..100 {
        engine.put(&format!("key_{}", i), b"payload")?;
    }
    let size_before = engine.stats().file_size;
    engine.clear()?;

    assert_eq!(engine.get_all_keys().len(), 0);
    assert!(engine.get("key_5")?.is_none());
    let stats = engine.stats();
    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.free_block_count, 0);
    assert!(stats.file_size < size_before);
    assert_eq!(stats.file_size, stats.data_start);

    // Движок жив после clear
    engine.put("fresh", b"start")?;
    assert_eq!(engine.get("fresh")?.as_deref(), Some(&b"start"[..]));
    Ok(())
}

#[test]
fn update_validation_roundtrip() -> Result<()> {
    let path = unique_path("validate");
    let engine = Engine::open(&path, quiet_config().with_update_validation(true))?;

    engine.put("checked", b"verified payload")?;
    assert_eq!(
        engine.get("checked")?.as_deref(),
        Some(&b"verified payload"[..])
    );
    Ok(())
}

#[test]
fn update_validation_never_overwrites_in_place() -> Result<()> {
    let path = unique_path("validate-slot");
    let engine = Engine::open(
        &path,
        quiet_config()
            .with_update_validation(true)
            .with_allocation_multiplier(0),
    )?;

    engine.put("k", &vec![1u8; 100])?;
    let size_before = engine.stats().file_size;

    // Меньшее значение влезло бы в старый слот, но с валидацией обновление
    // обязано уйти в свежий слот, а старый — в аллокатор
    engine.put("k", &vec![2u8; 50])?;
    let stats = engine.stats();
    assert!(stats.file_size > size_before);
    assert_eq!(stats.free_block_count, 1);
    assert_eq!(engine.get("k")?.as_deref(), Some(&vec![2u8; 50][..]));
    Ok(())
}

#[test]
fn memory_mode_serves_reads() -> Result<()> {
    let path = unique_path("memmode");
    let engine = Engine::open(&path, quiet_config().with_memory_mode(true))?;

    engine.put("cached", b"in memory")?;
    assert_eq!(engine.get("cached")?.as_deref(), Some(&b"in memory"[..]));
    // Повторное чтение идёт из кэша значений
    assert_eq!(engine.get("cached")?.as_deref(), Some(&b"in memory"[..]));

    engine.delete("cached")?;
    assert!(engine.get("cached")?.is_none());
    Ok(())
}

// ---------------- helpers ----------------

fn quiet_config() -> UltraConfig {
    // Без фонового воркера — детерминизм в тестах
    UltraConfig::new()
        .with_gc_flush_interval(0)
        .with_gc_auto_recycle(false)
}

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("ukv-{}-{}-{}.db", prefix, pid, t))
}
