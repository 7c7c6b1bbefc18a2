use anyhow::Result;
use std::path::PathBuf;

use ultrakv::{Engine, UltraConfig};

#[test]
fn thousand_puts_delete_every_even() -> Result<()> {
    let path = unique_path("evens");
    let engine = Engine::open(&path, quiet_config())?;

    for i in 0..1000 {
        engine.put(&format!("key_{}", i), format!("value_{}", i).as_bytes())?;
    }
    for i in (0..1000).step_by(2) {
        assert!(engine.delete(&format!("key_{}", i))?);
    }

    assert_eq!(engine.get_all_keys().len(), 500);
    assert!(engine.contains("key_3"));
    assert!(!engine.contains("key_4"));
    assert_eq!(engine.get("key_3")?.as_deref(), Some(&b"value_3"[..]));
    assert!(engine.get("key_4")?.is_none());

    let stats = engine.stats();
    assert_eq!(stats.record_count, 500);
    assert_eq!(stats.index.active_entries, 500);
    // Удалённые кортежи частично уплотнены; учёт остаётся согласованным
    assert_eq!(
        stats.index.total_entries,
        stats.index.active_entries + stats.index.deleted_entries
    );
    Ok(())
}

#[test]
fn delete_batch_counts_only_existing() -> Result<()> {
    let path = unique_path("batch");
    let engine = Engine::open(&path, quiet_config())?;

    for i in 0..50 {
        engine.put(&format!("key_{}", i), b"payload")?;
    }

    let keys: Vec<String> = (40..60).map(|i| format!("key_{}", i)).collect();
    let removed = engine.delete_batch(&keys)?;
    // key_40..key_49 существуют, key_50..key_59 — нет
    assert_eq!(removed, 10);
    assert_eq!(engine.get_all_keys().len(), 40);

    // Повторный батч ничего не находит
    assert_eq!(engine.delete_batch(&keys)?, 0);
    Ok(())
}

#[test]
fn page_growth_beyond_first_page() -> Result<()> {
    let path = unique_path("growth");
    // Крошечная первая страница: рост до нескольких страниц на сотнях ключей
    let engine = Engine::open(&path, quiet_config().with_default_index_page_size_kb(1))?;

    for i in 0..200 {
        engine.put(&format!("growing_key_{:04}", i), b"v")?;
    }
    let stats = engine.stats();
    assert!(
        stats.index.page_count > 1,
        "expected several index pages, got {}",
        stats.index.page_count
    );
    assert_eq!(stats.index.active_entries, 200);

    for i in 0..200 {
        assert!(engine.contains(&format!("growing_key_{:04}", i)));
    }
    Ok(())
}

// ---------------- helpers ----------------

fn quiet_config() -> UltraConfig {
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
