/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The write-ahead log: the durability layer that makes crash recovery safe.
//!
//! Every consensus input (message or timeout expiry) is appended to the WAL before the state
//! machine acts on it, so that a replica restarting after a crash can replay the log and arrive
//! at exactly the state it held when it went down. A replica that skipped this discipline could
//! forget a precommit it broadcast and sign a conflicting one after restart, which is
//! equivocation.
//!
//! [FileWal] frames each record as a little-endian length, a truncated Sha256 checksum, and the
//! record's canonical encoding. A torn write at the tail (the expected result of a crash mid
//! append) is detected by the checksum and truncated away on open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

use crate::error::WalError;
use crate::messages::ConsensusMessage;
use crate::round_state::Step;
use crate::timeout::TimeoutInfo;
use crate::types::{BlockHeight, CryptoHasher, Round};

/// Something the consensus state machine is about to act on, or a marker recording that it acted.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum WalEntry {
    /// A consensus message, logged before processing.
    Message(ConsensusMessage),
    /// A timeout expiry, logged before processing.
    Timeout(TimeoutInfo),
    /// The state machine moved to a new (height, round, step). Lets replay cross-check its
    /// position against the positions recorded before the crash.
    NewStep {
        height: BlockHeight,
        round: Round,
        step: Step,
    },
    /// A height was finalized and handed to the application. Marks where in the log each height
    /// ended, for operators reading it; replay re-applies finalized blocks through the
    /// application's per-height idempotency instead of consulting this marker.
    EndHeight(BlockHeight),
}

/// A [WalEntry] with the wall-clock time it was appended, for operators reading the log.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct WalRecord {
    pub time_millis: u64,
    pub entry: WalEntry,
}

/// The storage backing the write-ahead log.
///
/// `append` followed by `flush` must make the record durable: once `flush` returns, the record
/// must survive a crash. `records` returns every durable record in append order.
pub trait WalStore: Send + 'static {
    fn append(&mut self, record: &WalRecord) -> Result<(), WalError>;

    fn flush(&mut self) -> Result<(), WalError>;

    fn records(&mut self) -> Result<Vec<WalRecord>, WalError>;
}

// Record framing: payload length (u32 LE), then the first 4 bytes of the payload's Sha256 digest,
// then the borsh-encoded payload.
const FRAME_HEADER_SIZE: u64 = 8;

fn checksum(payload: &[u8]) -> [u8; 4] {
    let mut hasher = CryptoHasher::new();
    hasher.update(payload);
    let digest: [u8; 32] = hasher.finalize().into();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A [WalStore] over a single file.
///
/// On open, the file is scanned record by record. The first record that fails its length or
/// checksum is taken to be a torn tail write, and the file is truncated to the last valid
/// record. Corruption that is *followed* by further valid records is not a torn tail and is
/// reported as [WalError::Corrupt] instead.
pub struct FileWal {
    file: File,
}

impl FileWal {
    pub fn open(path: &Path) -> Result<FileWal, WalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let valid_len = Self::scan(&mut file)?;
        if valid_len < file.metadata()?.len() {
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(FileWal { file })
    }

    // Returns the length of the valid prefix of the file. Errors with [WalError::Corrupt] only
    // when a bad record is followed by a good one.
    fn scan(file: &mut File) -> Result<u64, WalError> {
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut valid_len = 0u64;
        let mut torn_at: Option<u64> = None;

        while offset + FRAME_HEADER_SIZE <= file_len {
            let mut header = [0u8; FRAME_HEADER_SIZE as usize];
            file.read_exact(&mut header)?;
            let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let expected_checksum = [header[4], header[5], header[6], header[7]];

            let record_end = offset + FRAME_HEADER_SIZE + payload_len;
            if record_end > file_len {
                // A record extending past the end of the file is a torn tail.
                break;
            }

            let mut payload = vec![0u8; payload_len as usize];
            file.read_exact(&mut payload)?;

            let intact = checksum(&payload) == expected_checksum
                && WalRecord::try_from_slice(&payload).is_ok();
            if intact {
                if torn_at.is_some() {
                    // A valid record after a bad one: the bad record was not a torn tail.
                    return Err(WalError::Corrupt {
                        offset: torn_at.unwrap(),
                    });
                }
                valid_len = record_end;
            } else {
                torn_at = torn_at.or(Some(offset));
            }
            offset = record_end;
        }

        // Trailing bytes shorter than a header are a torn write too.
        Ok(valid_len)
    }
}

impl WalStore for FileWal {
    fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let payload = record.try_to_vec()?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&payload));
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WalError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn records(&mut self) -> Result<Vec<WalRecord>, WalError> {
        let end = Self::scan(&mut self.file)?;
        self.file.seek(SeekFrom::Start(0))?;

        let mut records = Vec::new();
        let mut offset = 0u64;
        while offset < end {
            let mut header = [0u8; FRAME_HEADER_SIZE as usize];
            self.file.read_exact(&mut header)?;
            let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;

            let mut payload = vec![0u8; payload_len as usize];
            self.file.read_exact(&mut payload)?;
            records.push(WalRecord::try_from_slice(&payload).map_err(|_| WalError::Corrupt { offset })?);

            offset += FRAME_HEADER_SIZE + payload_len;
        }

        self.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }
}

/// An in-memory [WalStore] for tests and for replicas that explicitly opt out of durability.
#[derive(Default)]
pub struct MemWal {
    records: Vec<WalRecord>,
}

impl MemWal {
    pub fn new() -> MemWal {
        MemWal::default()
    }
}

impl WalStore for MemWal {
    fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn records(&mut self) -> Result<Vec<WalRecord>, WalError> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(height: BlockHeight) -> WalRecord {
        WalRecord {
            time_millis: height * 1000,
            entry: WalEntry::EndHeight(height),
        }
    }

    fn temp_wal_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tenderbft_wal_test_{}_{}", std::process::id(), name));
        path
    }

    #[test]
    fn appended_records_are_read_back_in_order() {
        let path = temp_wal_path("order");
        let _ = std::fs::remove_file(&path);

        let mut wal = FileWal::open(&path).unwrap();
        for height in 1..=3 {
            wal.append(&record(height)).unwrap();
        }
        wal.flush().unwrap();
        assert_eq!(wal.records().unwrap(), vec![record(1), record(2), record(3)]);

        // Reopening sees the same records.
        drop(wal);
        let mut wal = FileWal::open(&path).unwrap();
        assert_eq!(wal.records().unwrap().len(), 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn torn_tail_write_is_truncated_on_open() {
        let path = temp_wal_path("torn");
        let _ = std::fs::remove_file(&path);

        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.append(&record(1)).unwrap();
            wal.append(&record(2)).unwrap();
            wal.flush().unwrap();
        }

        // Simulate a crash mid-append: half a frame at the tail.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x55, 0x01, 0x00, 0x00, 0xde]).unwrap();
        }

        let mut wal = FileWal::open(&path).unwrap();
        assert_eq!(wal.records().unwrap(), vec![record(1), record(2)]);

        // The log accepts appends again after truncation.
        wal.append(&record(3)).unwrap();
        wal.flush().unwrap();
        assert_eq!(wal.records().unwrap().len(), 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_last_record_followed_by_torn_bytes_is_truncated() {
        let path = temp_wal_path("tail_corrupt");
        let _ = std::fs::remove_file(&path);

        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.append(&record(1)).unwrap();
            wal.append(&record(2)).unwrap();
            wal.flush().unwrap();
        }

        // Corrupt the last record's payload and leave a partial frame behind it. With no valid
        // record after the corruption, the whole tail counts as torn and is truncated.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::End(-1)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::End(-1)).unwrap();
            file.write_all(&[byte[0] ^ 0xff]).unwrap();
            file.seek(SeekFrom::End(0)).unwrap();
            file.write_all(&[0x13, 0x00, 0x00]).unwrap();
        }

        let mut wal = FileWal::open(&path).unwrap();
        assert_eq!(wal.records().unwrap(), vec![record(1)]);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corruption_before_valid_records_is_an_error() {
        let path = temp_wal_path("mid_corrupt");
        let _ = std::fs::remove_file(&path);

        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.append(&record(1)).unwrap();
            wal.append(&record(2)).unwrap();
            wal.flush().unwrap();
        }

        // Flip a payload byte of the first record. The second record is still valid, so this is
        // not a torn tail.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(FRAME_HEADER_SIZE + 2)).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            file.seek(SeekFrom::Start(FRAME_HEADER_SIZE + 2)).unwrap();
            file.write_all(&[byte[0] ^ 0xff]).unwrap();
        }

        assert!(matches!(
            FileWal::open(&path),
            Err(WalError::Corrupt { offset: 0 })
        ));

        std::fs::remove_file(&path).unwrap();
    }
}
