//! Persistent settings: the stored query table and the two configuration
//! records, kept at fixed offsets of a flat byte-addressed storage.
//!
//! | offset | size | content |
//! |---|---|---|
//! | 4 | 60 × 24 | query records |
//! | 1444 | 3 | line settings: baud index, parity index, reserved |
//! | 1447 | 5 | reporting: reply timeout ms, inter-query delay ms (LE), continuous flag |
//!
//! Erased storage reads as 0xFF. A query record whose id is 0xFF is an empty
//! slot; an erased configuration record is replaced by its defaults, which
//! are written back.
use heapless::Vec;
use log::{info, warn};

use crate::error::{Error, StorageError};
use crate::protocol::{DeviceDetail, FunctionCode, MasterQuery, QueryId, QUERY_ID_EMPTY};

pub const QUERY_RECORDS_OFFSET: usize = 4;
pub const QUERY_RECORD_SIZE: usize = 24;
pub const MAX_QUERY_RECORDS: usize = 60;
pub const UART_RECORD_OFFSET: usize = QUERY_RECORDS_OFFSET + MAX_QUERY_RECORDS * QUERY_RECORD_SIZE;
pub const UART_RECORD_SIZE: usize = 3;
pub const REPORTING_RECORD_OFFSET: usize = UART_RECORD_OFFSET + UART_RECORD_SIZE;
pub const REPORTING_RECORD_SIZE: usize = 5;
pub const STORAGE_SIZE: usize = REPORTING_RECORD_OFFSET + REPORTING_RECORD_SIZE;

const ERASED: u8 = 0xFF;

/// Flat byte-range persistence.
pub trait Storage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        (**self).write(offset, data)
    }
}

/// Storage image held in memory, erased on creation.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bytes: [u8; STORAGE_SIZE],
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub const fn new() -> Self {
        Self {
            bytes: [ERASED; STORAGE_SIZE],
        }
    }

    /// Builds an image from previously saved bytes; missing bytes read as
    /// erased.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut storage = Self::new();
        let len = data.len().min(STORAGE_SIZE);
        storage.bytes[..len].copy_from_slice(&data[..len]);
        storage
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Storage for MemoryStorage {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let src = self
            .bytes
            .get(offset..offset + buf.len())
            .ok_or(StorageError::Read {
                offset,
                len: buf.len(),
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let dst = self
            .bytes
            .get_mut(offset..offset + data.len())
            .ok_or(StorageError::Write {
                offset,
                len: data.len(),
            })?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

/// Packs `query` into its 24-byte record.
pub fn encode_query(query: &MasterQuery) -> Result<[u8; QUERY_RECORD_SIZE], StorageError> {
    let count = u8::try_from(query.count).map_err(|_| StorageError::CountTooLarge(query.count))?;
    let mut record = [0u8; QUERY_RECORD_SIZE];
    record[0] = query.id.get();
    record[1] = query.slave_id;
    record[2] = query.device.device_id;
    record[3] = query.device.status as u8;
    record[4..6].copy_from_slice(&query.device.attribute_id.to_le_bytes());
    record[6] = query.function.code();
    record[7..9].copy_from_slice(&query.address.to_le_bytes());
    record[9] = count;
    record[10..12].copy_from_slice(&query.interval.to_le_bytes());
    record[12] = query.one_shot as u8;
    record[13] = 1;
    record[14] = query.is_write() as u8;
    record[15] = query.write_data.len() as u8;
    record[16..16 + query.write_data.len()].copy_from_slice(&query.write_data);
    Ok(record)
}

/// Unpacks a query record. `Ok(None)` for an empty or disabled slot.
pub fn decode_query(record: &[u8; QUERY_RECORD_SIZE]) -> Result<Option<MasterQuery>, Error> {
    if record[0] == QUERY_ID_EMPTY || record[13] == 0 {
        return Ok(None);
    }
    let word = |i: usize| u16::from_le_bytes([record[i], record[i + 1]]);
    let data_len = (record[15] as usize).min(QUERY_RECORD_SIZE - 16);
    let mut query = MasterQuery::new(
        QueryId::try_from(record[0])?,
        record[1],
        FunctionCode::try_from(record[6])?,
        word(7),
        record[9] as u16,
    )
    .with_device(DeviceDetail {
        device_id: record[2],
        status: record[3] as i8,
        attribute_id: word(4),
    })
    .with_interval(word(10))
    .with_write_data(&record[16..16 + data_len])?;
    query.one_shot = record[12] == 1;
    Ok(Some(query))
}

fn record_offset(slot: usize) -> usize {
    QUERY_RECORDS_OFFSET + slot * QUERY_RECORD_SIZE
}

/// The persisted query table. Slots are tracked in memory after [`load`].
///
/// [`load`]: QueryStore::load
pub struct QueryStore<S> {
    storage: S,
    slots: [Option<QueryId>; MAX_QUERY_RECORDS],
}

impl<S: Storage> QueryStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            slots: [None; MAX_QUERY_RECORDS],
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Reads every record; unreadable records are skipped with a warning.
    pub fn load(&mut self) -> Result<Vec<MasterQuery, MAX_QUERY_RECORDS>, StorageError> {
        let mut table = [0u8; MAX_QUERY_RECORDS * QUERY_RECORD_SIZE];
        self.storage.read(QUERY_RECORDS_OFFSET, &mut table)?;
        let mut queries = Vec::new();
        for (slot, chunk) in table.chunks_exact(QUERY_RECORD_SIZE).enumerate() {
            let mut record = [0u8; QUERY_RECORD_SIZE];
            record.copy_from_slice(chunk);
            self.slots[slot] = match decode_query(&record) {
                Ok(Some(query)) => {
                    let id = query.id;
                    // one query per slot, the table cannot overflow
                    let _ = queries.push(query);
                    Some(id)
                }
                Ok(None) => None,
                Err(err) => {
                    warn!("skipping stored query in slot {slot}: {err}");
                    None
                }
            };
        }
        info!("loaded {} stored queries", queries.len());
        Ok(queries)
    }

    /// Stores `query`, replacing a record with the same id.
    pub fn save(&mut self, query: &MasterQuery) -> Result<(), StorageError> {
        let record = encode_query(query)?;
        let slot = self
            .position(query.id)
            .or_else(|| self.slots.iter().position(Option::is_none))
            .ok_or(StorageError::Full)?;
        self.storage.write(record_offset(slot), &record)?;
        self.slots[slot] = Some(query.id);
        Ok(())
    }

    /// Erases the record of `id`. Returns false if there was none.
    pub fn remove(&mut self, id: QueryId) -> Result<bool, StorageError> {
        let Some(slot) = self.position(id) else {
            return Ok(false);
        };
        self.storage
            .write(record_offset(slot), &[ERASED; QUERY_RECORD_SIZE])?;
        self.slots[slot] = None;
        Ok(true)
    }

    pub fn remove_all(&mut self) -> Result<(), StorageError> {
        self.storage.write(
            QUERY_RECORDS_OFFSET,
            &[ERASED; MAX_QUERY_RECORDS * QUERY_RECORD_SIZE],
        )?;
        self.slots = [None; MAX_QUERY_RECORDS];
        Ok(())
    }

    /// Reads the stored record of `id`.
    pub fn get(&mut self, id: QueryId) -> Result<Option<MasterQuery>, StorageError> {
        let Some(slot) = self.position(id) else {
            return Ok(None);
        };
        let mut record = [0u8; QUERY_RECORD_SIZE];
        self.storage.read(record_offset(slot), &mut record)?;
        Ok(decode_query(&record).ok().flatten())
    }

    pub fn ids(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.slots.iter().flatten().copied()
    }

    fn position(&self, id: QueryId) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(id))
    }
}

/// Line settings by persisted index; see [`crate::protocol::BaudRate::from_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UartRecord {
    pub baud_index: u8,
    pub parity_index: u8,
}

impl UartRecord {
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, StorageError> {
        let mut bytes = [0u8; UART_RECORD_SIZE];
        storage.read(UART_RECORD_OFFSET, &mut bytes)?;
        if bytes.iter().all(|byte| *byte == ERASED) {
            let record = Self::default();
            info!("line settings never written, storing defaults");
            record.store(storage)?;
            return Ok(record);
        }
        Ok(Self {
            baud_index: bytes[0],
            parity_index: bytes[1],
        })
    }

    pub fn store<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<(), StorageError> {
        storage.write(
            UART_RECORD_OFFSET,
            &[self.baud_index, self.parity_index, 0],
        )
    }
}

/// Reply timeout, pause between queries and reporting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingRecord {
    pub reply_timeout_ms: u16,
    pub inter_query_delay_ms: u16,
    pub continuous: bool,
}

impl Default for ReportingRecord {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 1000,
            inter_query_delay_ms: 400,
            continuous: false,
        }
    }
}

impl ReportingRecord {
    pub fn load<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, StorageError> {
        let mut bytes = [0u8; REPORTING_RECORD_SIZE];
        storage.read(REPORTING_RECORD_OFFSET, &mut bytes)?;
        if bytes[0] == ERASED && bytes[1] == ERASED {
            let record = Self::default();
            info!("reporting settings never written, storing defaults");
            record.store(storage)?;
            return Ok(record);
        }
        Ok(Self {
            reply_timeout_ms: u16::from_le_bytes([bytes[0], bytes[1]]),
            inter_query_delay_ms: u16::from_le_bytes([bytes[2], bytes[3]]),
            continuous: bytes[4] == 1,
        })
    }

    pub fn store<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<(), StorageError> {
        let [timeout_lo, timeout_hi] = self.reply_timeout_ms.to_le_bytes();
        let [delay_lo, delay_hi] = self.inter_query_delay_ms.to_le_bytes();
        storage.write(
            REPORTING_RECORD_OFFSET,
            &[timeout_lo, timeout_hi, delay_lo, delay_hi, self.continuous as u8],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn id(value: u8) -> QueryId {
        QueryId::try_from(value).unwrap()
    }

    fn sample(query_id: u8) -> MasterQuery {
        MasterQuery::new(id(query_id), 17, FunctionCode::WriteMultipleRegisters, 0x0102, 2)
            .with_device(DeviceDetail {
                device_id: 4,
                status: -1,
                attribute_id: 0xBEEF,
            })
            .with_interval(30)
            .with_write_data(&[1, 2, 3, 4])
            .unwrap()
    }

    #[test]
    fn layout() {
        assert_eq!(UART_RECORD_OFFSET, 1444);
        assert_eq!(REPORTING_RECORD_OFFSET, 1447);
        assert_eq!(STORAGE_SIZE, 1452);
    }

    #[test]
    fn record_encoding() {
        let record = encode_query(&sample(3)).unwrap();
        assert_eq!(
            record,
            [
                3, 17, 4, 0xFF, 0xEF, 0xBE, 0x10, 0x02, 0x01, 2, 30, 0, 0, 1, 1, 4, 1, 2, 3, 4,
                0, 0, 0, 0
            ]
        );
        assert_eq!(decode_query(&record).unwrap(), Some(sample(3)));
        assert_matches!(decode_query(&[ERASED; QUERY_RECORD_SIZE]), Ok(None));

        let mut bad = record;
        bad[6] = 0x2B;
        assert_matches!(decode_query(&bad), Err(Error::IllegalFunction(0x2B)));

        let mut wide = sample(3);
        wide.count = 300;
        assert_matches!(encode_query(&wide), Err(StorageError::CountTooLarge(300)));
    }

    #[test]
    fn store_round_trip() {
        let mut store = QueryStore::new(MemoryStorage::new());
        assert!(store.load().unwrap().is_empty());
        store.save(&sample(1)).unwrap();
        store.save(&sample(2)).unwrap();
        store.save(&sample(1).with_interval(60)).unwrap();
        assert_eq!(store.ids().count(), 2);
        assert_eq!(store.get(id(1)).unwrap().unwrap().interval, 60);

        assert!(store.remove(id(1)).unwrap());
        assert!(!store.remove(id(1)).unwrap());
        assert_eq!(store.get(id(1)).unwrap(), None);

        // a fresh store over the same bytes sees what was saved
        let image = MemoryStorage::from_bytes(store.storage().as_bytes());
        let mut reloaded = QueryStore::new(image);
        let queries = reloaded.load().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0], sample(2));

        // freed slot is reused
        reloaded.save(&sample(9)).unwrap();
        assert_eq!(reloaded.ids().collect::<std::vec::Vec<_>>(), vec![id(9), id(2)]);
    }

    #[test]
    fn full_store() {
        let mut store = QueryStore::new(MemoryStorage::new());
        for query_id in 0..MAX_QUERY_RECORDS as u8 {
            store.save(&sample(query_id)).unwrap();
        }
        assert_matches!(store.save(&sample(100)), Err(StorageError::Full));
        store.remove_all().unwrap();
        assert_eq!(store.ids().count(), 0);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn erased_records_get_defaults() {
        let mut storage = MemoryStorage::new();
        assert_eq!(UartRecord::load(&mut storage).unwrap(), UartRecord::default());
        assert_eq!(&storage.as_bytes()[1444..1447], &[0, 0, 0]);

        let reporting = ReportingRecord::load(&mut storage).unwrap();
        assert_eq!(reporting, ReportingRecord::default());
        assert_eq!(&storage.as_bytes()[1447..1452], &[0xE8, 0x03, 0x90, 0x01, 0]);

        let custom = ReportingRecord {
            reply_timeout_ms: 250,
            inter_query_delay_ms: 0,
            continuous: true,
        };
        custom.store(&mut storage).unwrap();
        assert_eq!(ReportingRecord::load(&mut storage).unwrap(), custom);

        UartRecord {
            baud_index: 4,
            parity_index: 2,
        }
        .store(&mut storage)
        .unwrap();
        assert_eq!(UartRecord::load(&mut storage).unwrap().baud_index, 4);
    }

    #[test]
    fn out_of_range_access() {
        let mut storage = MemoryStorage::new();
        assert_matches!(
            storage.write(STORAGE_SIZE - 1, &[0, 0]),
            Err(StorageError::Write { .. })
        );
        let mut buf = [0u8; 4];
        assert_matches!(
            storage.read(STORAGE_SIZE, &mut buf),
            Err(StorageError::Read { .. })
        );
    }
}
