//! heap — куча значений: упаковка/чтение записей, тумбстоуны.
//!
//! Формат записи (LE), адресация через IndexEntry (value_position /
//! value_length / value_allocated_length — единственный источник истины,
//! ключ в записи не дублируется):
//! - Кодек выключен, RecordHeader (17 B):
//!   [key_length u32 = 0][value_length u32][timestamp i64][is_deleted u8 @16]
//!   ‖ value_bytes
//! - Кодек включён, EncryptedDataHeader (12 B):
//!   [original_size u32][encrypted_size u32][is_deleted u8 @8][reserved 3]
//!   ‖ codec_output
//!
//! Удаление выставляет байт is_deleted по фиксированному смещению, не
//! трогая полезную нагрузку.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::codec::Codec;
use crate::consts::{
    ENC_HEADER_SIZE, ENC_OFF_IS_DELETED, RECORD_HEADER_SIZE, RECORD_OFF_IS_DELETED,
};
use crate::util::now_ms;

/// Верхний предел значения: влезает в i32-поля дескриптора.
pub const MAX_VALUE_BYTES: usize = i32::MAX as usize - 64;

/// Собрать байты записи (заголовок + полезная нагрузка) для сырого значения.
pub fn build_record(codec: &Codec, raw_value: &[u8]) -> Result<Vec<u8>> {
    if raw_value.len() > MAX_VALUE_BYTES {
        return Err(anyhow!(
            "value too large: {} bytes (max {})",
            raw_value.len(),
            MAX_VALUE_BYTES
        ));
    }

    if !codec.is_active() {
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + raw_value.len());
        let mut hdr = [0u8; RECORD_HEADER_SIZE];
        LittleEndian::write_u32(&mut hdr[0..4], 0); // ключ живёт в странице индекса
        LittleEndian::write_u32(&mut hdr[4..8], raw_value.len() as u32);
        LittleEndian::write_i64(&mut hdr[8..16], now_ms());
        hdr[16] = 0;
        out.extend_from_slice(&hdr);
        out.extend_from_slice(raw_value);
        return Ok(out);
    }

    let encoded = codec.encode(raw_value)?;
    if encoded.len() > MAX_VALUE_BYTES {
        return Err(anyhow!(
            "encoded value too large: {} bytes (max {})",
            encoded.len(),
            MAX_VALUE_BYTES
        ));
    }
    let mut out = Vec::with_capacity(ENC_HEADER_SIZE + encoded.len());
    let mut hdr = [0u8; ENC_HEADER_SIZE];
    LittleEndian::write_u32(&mut hdr[0..4], raw_value.len() as u32);
    LittleEndian::write_u32(&mut hdr[4..8], encoded.len() as u32);
    hdr[8] = 0;
    // [9..12] reserved
    out.extend_from_slice(&hdr);
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Записать готовую запись по позиции слота.
pub fn write_record(file: &mut File, position: i64, record: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(position as u64))?;
    file.write_all(record)?;
    Ok(())
}

/// Прочитать value_length байт по value_position и раскодировать.
/// Ok(None) — запись помечена удалённой.
pub fn read_record(
    file: &mut File,
    codec: &Codec,
    position: i64,
    length: i32,
) -> Result<Option<Vec<u8>>> {
    if position < 0 || length <= 0 {
        return Err(anyhow!("record slot is not confirmed"));
    }
    let mut raw = vec![0u8; length as usize];
    file.seek(SeekFrom::Start(position as u64))?;
    file.read_exact(&mut raw)
        .map_err(|e| anyhow!("short read of value record at {}: {}", position, e))?;
    parse_record(codec, &raw).map_err(|e| e.context(format!("value record at {}", position)))
}

/// Разобрать байты записи (заголовок + нагрузка).
pub fn parse_record(codec: &Codec, raw: &[u8]) -> Result<Option<Vec<u8>>> {
    if !codec.is_active() {
        if raw.len() < RECORD_HEADER_SIZE {
            return Err(anyhow!("record shorter than header: {} bytes", raw.len()));
        }
        if raw[RECORD_OFF_IS_DELETED as usize] != 0 {
            return Ok(None);
        }
        let key_len = LittleEndian::read_u32(&raw[0..4]) as usize;
        let value_len = LittleEndian::read_u32(&raw[4..8]) as usize;
        let start = RECORD_HEADER_SIZE + key_len;
        if start + value_len > raw.len() {
            return Err(anyhow!(
                "record length mismatch: header wants {} value bytes, record has {}",
                value_len,
                raw.len().saturating_sub(start)
            ));
        }
        return Ok(Some(raw[start..start + value_len].to_vec()));
    }

    if raw.len() < ENC_HEADER_SIZE {
        return Err(anyhow!("record shorter than header: {} bytes", raw.len()));
    }
    if raw[ENC_OFF_IS_DELETED as usize] != 0 {
        return Ok(None);
    }
    let original = LittleEndian::read_u32(&raw[0..4]) as usize;
    let encrypted = LittleEndian::read_u32(&raw[4..8]) as usize;
    if ENC_HEADER_SIZE + encrypted > raw.len() {
        return Err(anyhow!(
            "record length mismatch: header wants {} codec bytes, record has {}",
            encrypted,
            raw.len() - ENC_HEADER_SIZE
        ));
    }
    let decoded = codec.decode(&raw[ENC_HEADER_SIZE..ENC_HEADER_SIZE + encrypted])?;
    if decoded.len() != original {
        return Err(anyhow!(
            "record original size mismatch: header says {}, decoded {}",
            original,
            decoded.len()
        ));
    }
    Ok(Some(decoded))
}

/// Выставить тумбстоун записи: один байт по фиксированному смещению.
pub fn mark_deleted(file: &mut File, codec_active: bool, position: i64) -> Result<()> {
    let off = if codec_active {
        ENC_OFF_IS_DELETED
    } else {
        RECORD_OFF_IS_DELETED
    };
    file.seek(SeekFrom::Start(position as u64 + off))?;
    file.write_all(&[1u8])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CompressionKind, EncryptionKind};

    fn plain() -> Codec {
        Codec::new(CompressionKind::None, EncryptionKind::None, "").unwrap()
    }

    fn zstd() -> Codec {
        Codec::new(CompressionKind::Zstd, EncryptionKind::None, "").unwrap()
    }

    #[test]
    fn plain_record_roundtrip() {
        let codec = plain();
        let record = build_record(&codec, b"hello heap").unwrap();
        assert_eq!(record.len(), RECORD_HEADER_SIZE + 10);
        let got = parse_record(&codec, &record).unwrap().unwrap();
        assert_eq!(got, b"hello heap");
    }

    #[test]
    fn codec_record_roundtrip() {
        let codec = zstd();
        let value = vec![0x42u8; 64 * 1024];
        let record = build_record(&codec, &value).unwrap();
        // Сжимаемое значение даёт запись заметно короче исходника
        assert!(record.len() < value.len() / 2);
        let got = parse_record(&codec, &record).unwrap().unwrap();
        assert_eq!(got, value);
    }

    #[test]
    fn tombstone_byte_hides_record() {
        let codec = plain();
        let mut record = build_record(&codec, b"soon gone").unwrap();
        record[RECORD_OFF_IS_DELETED as usize] = 1;
        assert!(parse_record(&codec, &record).unwrap().is_none());

        let codec = zstd();
        let mut record = build_record(&codec, b"soon gone").unwrap();
        record[ENC_OFF_IS_DELETED as usize] = 1;
        assert!(parse_record(&codec, &record).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let codec = plain();
        let record = build_record(&codec, b"0123456789").unwrap();
        let err = parse_record(&codec, &record[..record.len() - 3]).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }
}
