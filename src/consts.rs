//! Общие константы формата единого файла БД (header, free space, index, heap).

// -------- DatabaseHeader --------
pub const DB_MAGIC: u32 = 0x554B_5644; // "UKVD"
pub const DB_VERSION: u8 = 1;
pub const DB_HEADER_SIZE: usize = 128;
pub const DB_HEADER_POS: u64 = 0;

// -------- FreeSpaceHeader / регион свободных блоков --------
pub const FREE_MAGIC: u32 = 0x4653_5053; // "FSPS"
pub const FREE_VERSION: u8 = 1;
pub const FREE_HEADER_SIZE: usize = 64;
pub const FREE_HEADER_POS: u64 = 128;

// Регион блоков начинается с фиксированного смещения 1024 (не сразу за
// заголовком — между ними зарезервированная прокладка [192, 1024)).
pub const FREE_REGION_POS: u64 = 1024;

/// Одна запись региона: {position i64, size i64}.
pub const FREE_BLOCK_SIZE: usize = 16;

// -------- Index --------
pub const INDEX_MAGIC: u32 = 0x4944_5848; // "IDXH"
pub const INDEX_PAGE_MAGIC: u32 = 0x4944_5850; // "IDXP"
pub const INDEX_VERSION: u8 = 1;

pub const INDEX_HEADER_SIZE: usize = 64;
pub const INDEX_PAGE_HEADER_SIZE: usize = 32;
pub const INDEX_ENTRY_SIZE: usize = 32;

/// Максимум индексных страниц на движок; столько же слотов в таблице блоков.
pub const MAX_INDEX_PAGES: usize = 32;
/// Слот таблицы блоков: {page_position i64, page_size i64}.
pub const INDEX_BLOCK_SIZE: usize = 16;
pub const INDEX_BLOCKS_SIZE: usize = MAX_INDEX_PAGES * INDEX_BLOCK_SIZE; // 512

/// Пределы размера индексной страницы.
pub const MIN_INDEX_PAGE_SIZE: i64 = 1024; // 1 KiB
pub const MAX_INDEX_PAGE_SIZE: i64 = 2 * 1024 * 1024 * 1024; // 2 GiB

// -------- Value heap --------
/// RecordHeader: [key_length u32][value_length u32][timestamp i64][is_deleted u8].
pub const RECORD_HEADER_SIZE: usize = 17;
pub const RECORD_OFF_IS_DELETED: u64 = 16;

/// EncryptedDataHeader: [original u32][encrypted u32][is_deleted u8][reserved 3].
pub const ENC_HEADER_SIZE: usize = 12;
pub const ENC_OFF_IS_DELETED: u64 = 8;

// -------- Расположение регионов --------

/// Смещение IndexHeader: сразу за регионом свободных блоков.
#[inline]
pub fn index_header_pos(free_region_bytes: u64) -> u64 {
    FREE_REGION_POS + free_region_bytes
}

/// Начало области данных (страницы индекса + записи значений).
#[inline]
pub fn first_index_data_pos(free_region_bytes: u64) -> u64 {
    index_header_pos(free_region_bytes) + INDEX_HEADER_SIZE as u64 + INDEX_BLOCKS_SIZE as u64
}
