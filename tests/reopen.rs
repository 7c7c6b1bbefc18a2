use anyhow::Result;
use std::path::PathBuf;

use ultrakv::{Engine, UltraConfig};

#[test]
fn big_value_survives_reopen() -> Result<()> {
    let path = unique_path("big");

    // 5 MiB с паттерном, чтобы ловить любое смещение
    let big = build_pattern(5 * 1024 * 1024);
    {
        let engine = Engine::open(&path, quiet_config())?;
        engine.put("big", &big)?;
        engine.put("small", b"beside it")?;
    } // drop = финальный flush

    {
        let engine = Engine::open(&path, quiet_config())?;
        let got = engine.get("big")?.expect("big must survive reopen");
        assert_eq!(got.len(), big.len());
        assert_eq!(got, big);
        assert_eq!(engine.get("small")?.as_deref(), Some(&b"beside it"[..]));
    }
    Ok(())
}

#[test]
fn many_records_survive_reopen() -> Result<()> {
    let path = unique_path("many");

    {
        let engine = Engine::open(&path, quiet_config())?;
        for i in 0..500 {
            engine.put(&format!("key_{}", i), format!("value_{}", i).as_bytes())?;
        }
        for i in 0..100 {
            engine.delete(&format!("key_{}", i))?;
        }
    }

    {
        let engine = Engine::open(&path, quiet_config())?;
        assert_eq!(engine.get_all_keys().len(), 400);
        assert!(engine.get("key_50")?.is_none());
        assert_eq!(
            engine.get("key_450")?.as_deref(),
            Some(&b"value_450"[..])
        );
        // Свободные блоки удалённых записей пережили переоткрытие
        assert!(engine.stats().free_block_count > 0);
    }
    Ok(())
}

#[test]
fn deleted_key_can_be_reinserted_after_reopen() -> Result<()> {
    let path = unique_path("reinsert");

    {
        let engine = Engine::open(&path, quiet_config())?;
        engine.put("phoenix", b"first life")?;
        engine.delete("phoenix")?;
    }
    {
        let engine = Engine::open(&path, quiet_config())?;
        assert!(!engine.contains("phoenix"));
        engine.put("phoenix", b"second life")?;
        assert_eq!(engine.get("phoenix")?.as_deref(), Some(&b"second life"[..]));
    }
    Ok(())
}

#[test]
fn truncated_header_is_fatal() -> Result<()> {
    let path = unique_path("corrupt");
    {
        let engine = Engine::open(&path, quiet_config())?;
        engine.put("doomed", b"value")?;
    }

    // Порча первых байт заголовка
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&[0xDE, 0xAD, 0xBE, 0xEF])?;
    }

    let err = Engine::open(&path, quiet_config()).unwrap_err();
    assert!(err.to_string().contains("corrupt header"));
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

fn build_pattern(len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    for (i, b) in v.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    v
}
