//! engine — публичный фасад движка.
//!
//! Модули: core (структуры и связка компонентов), open (создание/открытие
//! файла), kv (point-операции), maintenance (flush + фоновый GC),
//! shrink (компактная пересборка файла).

mod core;
mod kv;
mod maintenance;
mod open;
mod shrink;

pub use self::core::{Engine, EngineStats};
pub use self::shrink::ShrinkResult;
