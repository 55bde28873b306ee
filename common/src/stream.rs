use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::{
    error::StreamError,
    partition::{Partition, PartitionInfo, WRITE_GRANULARITY},
};

/// Fill byte for the unused tail of a final partial word. Matches the erased
/// state of NOR flash, so padding never needs a read-modify-write.
pub const PAD_BYTE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Closed,
    Abandoned,
}

/// Sequential writer for one partition.
///
/// Incoming bytes collect in a word-sized buffer; every full word is flushed as
/// exactly one aligned program operation. Sectors are erased lazily right
/// before the first word lands in them.
#[derive(Debug)]
pub struct PartitionWriteStream<P: Partition> {
    partition: P,
    info: PartitionInfo,
    sector_size: u32,
    buffer: [u8; WRITE_GRANULARITY],
    pending: usize,
    offset: u32,
    erased_end: u32,
    total_written: u64,
    hasher: Sha256,
    state: StreamState,
}

impl<P: Partition> PartitionWriteStream<P> {
    pub fn new(partition: P, running: &PartitionInfo) -> Result<Self, StreamError> {
        let info = partition.info();
        if info.overlaps(running) {
            return Err(StreamError::TargetsRunning(info));
        }

        let sector_size = partition.sector_size();
        if !info.is_aligned()
            || sector_size == 0
            || info.address % sector_size != 0
            || info.size % sector_size != 0
        {
            return Err(StreamError::Misaligned(info));
        }

        Ok(Self {
            partition,
            info,
            sector_size,
            buffer: [PAD_BYTE; WRITE_GRANULARITY],
            pending: 0,
            offset: 0,
            erased_end: 0,
            total_written: 0,
            hasher: Sha256::new(),
            state: StreamState::Open,
        })
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Absolute device address of the next word to be flushed.
    pub fn current_address(&self) -> u32 {
        self.info.address + self.offset
    }

    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.state != StreamState::Open {
            return Err(StreamError::Closed);
        }

        let attempted = self.total_written + data.len() as u64;
        if attempted > self.info.size as u64 {
            return Err(StreamError::OverCapacity {
                capacity: self.info.size,
                attempted,
            });
        }

        self.hasher.update(data);

        let mut rest = data;
        while !rest.is_empty() {
            let take = (WRITE_GRANULARITY - self.pending).min(rest.len());
            self.buffer[self.pending..self.pending + take].copy_from_slice(&rest[..take]);
            self.pending += take;
            self.total_written += take as u64;
            rest = &rest[take..];

            if self.pending == WRITE_GRANULARITY {
                self.flush_word()?;
            }
        }

        Ok(())
    }

    /// Flushes the trailing partial word padded with [`PAD_BYTE`], syncs the
    /// partition and returns the number of payload bytes written.
    pub fn close(&mut self) -> Result<u64, StreamError> {
        if self.state != StreamState::Open {
            return Err(StreamError::Closed);
        }
        self.state = StreamState::Closed;

        if self.pending > 0 {
            self.buffer[self.pending..].fill(PAD_BYTE);
            self.flush_word()?;
        }
        self.partition.sync()?;

        Ok(self.total_written)
    }

    /// Terminates the stream without flushing the buffered partial word.
    pub fn abandon(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Abandoned;
            self.pending = 0;
            self.buffer = [PAD_BYTE; WRITE_GRANULARITY];
        }
    }

    pub fn digest_hex(&self) -> String {
        let digest = self.hasher.clone().finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(&mut hex, "{byte:02x}");
        }
        hex
    }

    fn flush_word(&mut self) -> Result<(), StreamError> {
        if self.offset >= self.erased_end {
            self.partition.erase(self.erased_end)?;
            self.erased_end += self.sector_size;
        }

        self.partition.write(self.offset, &self.buffer)?;
        self.offset += WRITE_GRANULARITY as u32;
        self.pending = 0;
        self.buffer = [PAD_BYTE; WRITE_GRANULARITY];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        error::StorageError,
        flash::{FlashOp, MemoryFlash},
    };

    const TARGET: u32 = 0x2000;
    const TARGET_SIZE: u32 = 0x2000;

    fn running() -> PartitionInfo {
        PartitionInfo::new("rom0", 0x8000, 0x1000)
    }

    fn setup() -> (MemoryFlash, PartitionWriteStream<crate::flash::MemoryPartition>) {
        let flash = MemoryFlash::new(0x10000);
        let part = flash
            .partition(PartitionInfo::new("rom1", TARGET, TARGET_SIZE))
            .unwrap();
        let stream = PartitionWriteStream::new(part, &running()).unwrap();
        (flash, stream)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn buffers_partial_words_until_full() {
        let (flash, mut stream) = setup();

        stream.write(&[1, 2, 3]).unwrap();
        assert_eq!(stream.pending_len(), 3);
        assert_eq!(stream.current_address(), TARGET);
        assert!(!flash
            .ops()
            .iter()
            .any(|op| matches!(op, FlashOp::Write { .. })));

        stream.write(&[4, 5]).unwrap();
        assert_eq!(stream.pending_len(), 1);
        assert_eq!(stream.current_address(), TARGET + 4);
        assert_eq!(flash.read_range(TARGET, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn close_pads_final_word_with_erased_bytes() {
        let (flash, mut stream) = setup();

        stream.write(&[9, 8, 7, 6, 5, 4]).unwrap();
        assert_eq!(stream.close().unwrap(), 6);

        assert_eq!(
            flash.read_range(TARGET, 8),
            vec![9, 8, 7, 6, 5, 4, 0xFF, 0xFF]
        );
        assert_eq!(flash.ops().last(), Some(&FlashOp::Sync));
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let (_flash, mut stream) = setup();
        stream.write(&[1, 2, 3, 4]).unwrap();
        stream.close().unwrap();

        assert_eq!(stream.write(&[5]), Err(StreamError::Closed));
        assert_eq!(stream.close(), Err(StreamError::Closed));
    }

    #[test]
    fn over_capacity_leaves_flushed_bytes_untouched() {
        let (flash, mut stream) = setup();
        let head = pattern(TARGET_SIZE as usize - 2);
        stream.write(&head).unwrap();
        let ops_before = flash.ops();

        let err = stream.write(&[0; 3]).unwrap_err();
        assert_eq!(
            err,
            StreamError::OverCapacity {
                capacity: TARGET_SIZE,
                attempted: TARGET_SIZE as u64 + 1,
            }
        );
        assert_eq!(flash.ops(), ops_before);
        assert_eq!(stream.pending_len(), 2);

        stream.write(&[0xAA, 0xBB]).unwrap();
        stream.close().unwrap();
        let mut expected = head;
        expected.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(flash.read_range(TARGET, TARGET_SIZE as usize), expected);
    }

    #[test]
    fn erases_each_sector_once_before_first_write() {
        let (flash, mut stream) = setup();
        stream.write(&pattern(4096 + 8)).unwrap();

        let erases: Vec<_> = flash
            .ops()
            .into_iter()
            .filter(|op| matches!(op, FlashOp::Erase { .. }))
            .collect();
        assert_eq!(
            erases,
            vec![
                FlashOp::Erase { address: TARGET },
                FlashOp::Erase {
                    address: TARGET + 4096
                },
            ]
        );
    }

    #[test]
    fn rejects_running_partition() {
        let flash = MemoryFlash::new(0x10000);
        let part = flash.partition(running()).unwrap();

        assert_eq!(
            PartitionWriteStream::new(part, &running()).unwrap_err(),
            StreamError::TargetsRunning(running())
        );
    }

    #[test]
    fn rejects_partition_not_on_sector_boundary() {
        let flash = MemoryFlash::new(0x10000);
        let part = flash
            .partition(PartitionInfo::new("odd", 0x2100, 0x1000))
            .unwrap();

        assert!(matches!(
            PartitionWriteStream::new(part, &running()),
            Err(StreamError::Misaligned(_))
        ));
    }

    #[test]
    fn storage_failure_propagates_as_write_error() {
        let (flash, mut stream) = setup();
        stream.write(&[0; 8]).unwrap();
        flash.inject_fault(TARGET + 8);

        let err = stream.write(&[0; 4]).unwrap_err();
        assert!(matches!(err, StreamError::Write(StorageError::Device(_))));
    }

    #[test]
    fn abandon_drops_partial_word() {
        let (flash, mut stream) = setup();
        stream.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        stream.abandon();

        assert!(!stream.is_open());
        assert_eq!(stream.write(&[7]), Err(StreamError::Closed));
        assert_eq!(
            flash.read_range(TARGET, 8),
            vec![1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn digest_covers_accepted_bytes() {
        let (_flash, mut stream) = setup();
        stream.write(b"ab").unwrap();
        stream.write(b"c").unwrap();

        assert_eq!(
            stream.digest_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    fn write_in_chunks(data: &[u8], chunk: usize) -> (Vec<u8>, Vec<FlashOp>) {
        let (flash, mut stream) = setup();
        for piece in data.chunks(chunk) {
            stream.write(piece).unwrap();
        }
        stream.close().unwrap();
        (flash.read_range(0, 0x10000), flash.ops())
    }

    proptest! {
        #[test]
        fn chunk_size_does_not_change_contents(
            data in proptest::collection::vec(any::<u8>(), 0..3000),
            chunk in 1usize..700,
        ) {
            let (bytewise, _) = write_in_chunks(&data, 1);
            let (chunked, _) = write_in_chunks(&data, chunk);
            let whole = write_in_chunks(&data, data.len().max(1)).0;

            prop_assert_eq!(&bytewise, &chunked);
            prop_assert_eq!(&bytewise, &whole);
        }

        #[test]
        fn flushes_are_single_words_inside_partition(
            data in proptest::collection::vec(any::<u8>(), 0..(TARGET_SIZE as usize)),
            chunk in 1usize..512,
        ) {
            let (_, ops) = write_in_chunks(&data, chunk);
            for op in ops {
                if let FlashOp::Write { address, len } = op {
                    prop_assert_eq!(len, WRITE_GRANULARITY);
                    prop_assert_eq!(address as usize % WRITE_GRANULARITY, 0);
                    prop_assert!(address >= TARGET);
                    prop_assert!(address as u64 + len as u64 <= (TARGET + TARGET_SIZE) as u64);
                }
            }
        }
    }
}
