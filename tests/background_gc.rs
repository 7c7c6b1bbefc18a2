use anyhow::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ultrakv::{Engine, UltraConfig};

#[test]
fn background_worker_runs_and_stops_cleanly() -> Result<()> {
    let path = unique_path("worker");
    let engine = Engine::open(
        &path,
        UltraConfig::new()
            .with_gc_flush_interval(1)
            .with_gc_auto_recycle(false),
    )?;

    for i in 0..200 {
        engine.put(&format!("key_{}", i), b"payload")?;
    }
    // Пара тиков фонового flush
    std::thread::sleep(Duration::from_millis(2300));
    engine.put("after_ticks", b"still alive")?;
    assert_eq!(engine.get("after_ticks")?.as_deref(), Some(&b"still alive"[..]));
    drop(engine); // джойн воркера + финальный flush

    let engine = Engine::open(
        &path,
        UltraConfig::new()
            .with_gc_flush_interval(0)
            .with_gc_auto_recycle(false),
    )?;
    assert_eq!(engine.get_all_keys().len(), 201);
    Ok(())
}

#[test]
fn auto_shrink_fires_when_triggered() -> Result<()> {
    let path = unique_path("autoshrink");

    // Наполнение и удаления — без воркера, чтобы не потратить троттлинг
    // авто-shrink на промежуточное состояние
    {
        let engine = Engine::open(
            &path,
            UltraConfig::new()
                .with_gc_flush_interval(0)
                .with_gc_auto_recycle(false),
        )?;
        for i in 0..2000 {
            engine.put(&format!("key_{:04}", i), &vec![0x55u8; 100])?;
        }
        for i in 0..1200 {
            engine.delete(&format!("key_{:04}", i))?;
        }
    }

    let engine = Engine::open(
        &path,
        UltraConfig::new()
            .with_gc_flush_interval(1)
            .with_gc_auto_recycle(true)
            .with_gc_min_file_size_kb(64)
            .with_gc_min_record_count(10)
            .with_gc_free_space_threshold(20),
    )?;
    let size_before = engine.stats().file_size;

    // Ждём срабатывания фонового shrink (тик раз в секунду)
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut shrunk = false;
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(250));
        if engine.stats().file_size < size_before {
            shrunk = true;
            break;
        }
    }
    assert!(shrunk, "auto shrink did not run within 10s");

    // Данные целы
    assert_eq!(engine.get_all_keys().len(), 800);
    assert_eq!(
        engine.get("key_1999")?.as_deref(),
        Some(&vec![0x55u8; 100][..])
    );
    Ok(())
}

// ---------------- helpers ----------------

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("ukv-{}-{}-{}.db", prefix, pid, t))
}
