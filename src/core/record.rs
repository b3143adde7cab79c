// Owned record type and the per-producer pending buffer that assembles them.
use bstr::ByteSlice;

/// Byte that terminates every complete record on the wire and in the log.
pub const DELIMITER: u8 = b'\n';

/// One delimiter-terminated byte span. Ownership moves into the command log
/// on append; a zero-length record is valid and distinct from "no record".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    bytes: Vec<u8>,
}

impl Record {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for Record {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for Record {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Record {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Accumulates inbound bytes for one producer until a delimiter completes a
/// record. Bytes after the delimiter stay buffered for the next record.
#[derive(Debug, Default)]
pub struct PendingRecord {
    buf: Vec<u8>,
}

impl PendingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drains and returns the prefix up to and including the first delimiter,
    /// or `None` while no complete record is buffered.
    pub fn next_complete(&mut self) -> Option<Record> {
        let pos = self.buf.find_byte(DELIMITER)?;
        let rest = self.buf.split_off(pos + 1);
        let complete = std::mem::replace(&mut self.buf, rest);
        Some(Record::new(complete))
    }
}
