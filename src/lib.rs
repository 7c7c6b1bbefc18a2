//! UltraKV — встраиваемый однофайловый движок ключ/значение.
//!
//! Один файл на движок: фиксированный DatabaseHeader, персистентный регион
//! свободных блоков, страничный первичный индекс (до 32 страниц) и куча
//! значений. Point-операции, перечисление ключей, компактная пересборка
//! (shrink) и опциональные пер-записьные сжатие + AEAD.
//!
//! ```no_run
//! use ultrakv::{Engine, UltraConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = Engine::open("app.ukv", UltraConfig::default())?;
//! engine.put("alpha", b"value")?;
//! assert_eq!(engine.get("alpha")?.as_deref(), Some(&b"value"[..]));
//! assert!(engine.delete("alpha")?);
//! # Ok(())
//! # }
//! ```

// Базовые модули
pub mod config;
pub mod consts;
pub mod hash;
pub mod metrics;
pub mod util;

// Форматы и компоненты
pub mod codec; // src/codec/mod.rs
pub mod engine; // src/engine/{mod,core,open,kv,maintenance,shrink}.rs
pub mod free; // src/free/mod.rs
pub mod header;
pub mod heap;
pub mod index; // src/index/{mod,entry,page,manager}.rs

// Удобные реэкспорты
pub use codec::{Codec, CompressionKind, EncryptionKind};
pub use config::UltraConfig;
pub use engine::{Engine, EngineStats, ShrinkResult};
pub use header::DatabaseHeader;
pub use index::{IndexEntry, IndexStats};
