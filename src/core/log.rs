// Fixed-capacity ring of variable-length records with byte-offset addressing.
//
// Callers serialize all access with one exclusive lock around the whole
// instance; the log itself knows nothing about threads or sockets.
use crate::core::record::Record;

/// Default number of record slots retained before eviction begins.
pub const DEFAULT_CAPACITY: usize = 10;

/// Bounded command log. Slots hold zero or one record each; an unoccupied
/// slot is distinct from an occupied zero-length record. Once every slot is
/// occupied, each insert evicts the oldest record.
#[derive(Debug)]
pub struct CommandLog {
    slots: Box<[Option<Record>]>,
    write_index: usize,
    read_index: usize,
    full: bool,
}

impl CommandLog {
    /// Fresh log with `capacity` empty slots. Never fails; the slot array is
    /// allocated once and never grows.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "command log capacity must be nonzero");
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            write_index: 0,
            read_index: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        if self.full {
            self.capacity()
        } else {
            (self.write_index + self.capacity() - self.read_index) % self.capacity()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.write_index == self.read_index
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Inserts `record` as the newest command. When the log is full the
    /// oldest record is released first; the eviction is atomic with the
    /// insert that caused it. Returns the evicted record, if any.
    pub fn add_entry(&mut self, record: Record) -> Option<Record> {
        let evicted = if self.full {
            let evicted = self.slots[self.read_index].take();
            self.read_index = (self.read_index + 1) % self.capacity();
            evicted
        } else {
            None
        };

        self.slots[self.write_index] = Some(record);
        self.write_index = (self.write_index + 1) % self.capacity();
        self.full = self.write_index == self.read_index;

        evicted
    }

    /// Occupied records, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        let capacity = self.capacity();
        (0..self.len()).map(move |step| {
            let slot = (self.read_index + step) % capacity;
            self.slots[slot]
                .as_ref()
                .expect("slot within occupied range holds a record")
        })
    }

    /// Sum of all occupied record lengths.
    pub fn total_size(&self) -> usize {
        self.iter().map(Record::len).sum()
    }

    /// Resolves a global byte offset (as if all occupied records were
    /// concatenated oldest to newest) to the record containing it and the
    /// byte offset within that record. `None` when the offset is at or past
    /// the end of the addressable bytes; offsets into evicted records are
    /// unaddressable. An offset landing exactly on a record boundary belongs
    /// to the following record.
    pub fn find_entry_for_offset(&self, char_offset: usize) -> Option<(&Record, usize)> {
        let mut running = 0usize;
        for record in self.iter() {
            if running + record.len() > char_offset {
                return Some((record, char_offset - running));
            }
            running += record.len();
        }
        None
    }

    /// Global byte offset of byte `intra_offset` within the occupied record
    /// at `command_index` (0-based, oldest first). `None` when the index is
    /// not occupied or the intra-offset is at or past the record's length.
    pub fn offset_for_command(&self, command_index: usize, intra_offset: usize) -> Option<usize> {
        if command_index >= self.len() {
            return None;
        }
        let mut global = 0usize;
        for (index, record) in self.iter().enumerate() {
            if index == command_index {
                if intra_offset >= record.len() {
                    return None;
                }
                return Some(global + intra_offset);
            }
            global += record.len();
        }
        None
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
