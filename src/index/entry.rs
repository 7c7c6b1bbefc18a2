//! index/entry — 32-байтный дескриптор записи.
//!
//! Формат (LE):
//! [is_deleted u8][page_index u8][key_length i32][value_position i64]
//! [value_length i32][value_allocated_length i32][timestamp i64][reserved u16]
//!
//! value_position = -1 — резервация (значение ещё не размещено).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::INDEX_ENTRY_SIZE;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub is_deleted: bool,
    pub page_index: u8,
    pub key_length: i32,
    pub value_position: i64,
    pub value_length: i32,
    pub value_allocated_length: i32,
    pub timestamp: i64,
}

impl IndexEntry {
    /// Резервация: позиция значения ещё не известна.
    pub fn reserved(page_index: u8, key_length: i32) -> Self {
        Self {
            is_deleted: false,
            page_index,
            key_length,
            value_position: -1,
            value_length: 0,
            value_allocated_length: 0,
            timestamp: now_ms(),
        }
    }

    /// true после confirm: слот значения известен и согласован.
    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.value_position >= 0 && self.value_length <= self.value_allocated_length
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < INDEX_ENTRY_SIZE {
            return Err(anyhow!("buffer too small for index entry"));
        }
        buf[0] = self.is_deleted as u8;
        buf[1] = self.page_index;
        LittleEndian::write_i32(&mut buf[2..6], self.key_length);
        LittleEndian::write_i64(&mut buf[6..14], self.value_position);
        LittleEndian::write_i32(&mut buf[14..18], self.value_length);
        LittleEndian::write_i32(&mut buf[18..22], self.value_allocated_length);
        LittleEndian::write_i64(&mut buf[22..30], self.timestamp);
        // [30..32] reserved
        buf[30] = 0;
        buf[31] = 0;
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < INDEX_ENTRY_SIZE {
            return Err(anyhow!("buffer too small for index entry"));
        }
        Ok(Self {
            is_deleted: buf[0] != 0,
            page_index: buf[1],
            key_length: LittleEndian::read_i32(&buf[2..6]),
            value_position: LittleEndian::read_i64(&buf[6..14]),
            value_length: LittleEndian::read_i32(&buf[14..18]),
            value_allocated_length: LittleEndian::read_i32(&buf[18..22]),
            timestamp: LittleEndian::read_i64(&buf[22..30]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let mut e = IndexEntry::reserved(5, 12);
        assert!(!e.is_confirmed());
        assert_eq!(e.value_position, -1);

        e.value_position = 4096;
        e.value_length = 100;
        e.value_allocated_length = 128;
        assert!(e.is_confirmed());

        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        e.write_to(&mut buf).unwrap();
        let e2 = IndexEntry::read_from(&buf).unwrap();
        assert_eq!(e, e2);
    }
}
