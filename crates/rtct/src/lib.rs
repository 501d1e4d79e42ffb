//! Real-Time Configuration Table (RTCT) binary format structures and
//! parsing utilities.
//!
//! The RTCT is an ACPI table published by firmware on platforms with
//! cache-reservation support. It describes the reserved pseudo-SRAM
//! regions and the measured latencies of the memory hierarchy. This crate
//! parses the raw table bytes, as obtained from the kernel driver or from
//! `/sys/firmware/acpi/tables`, without copying them.
//!
//! # Table layout
//!
//! A 36-byte fixed ACPI header is followed by a contiguous sequence of
//! variable-length entries. Each entry starts with an [`EntryHeader`]
//! giving its total size in bytes, a format version, and a type
//! discriminator; the payload layout depends on the type. All fields are
//! little-endian.
//!
//! Only the [`MemoryHierarchyLatency`](EntryType::MemoryHierarchyLatency)
//! entries are interpreted here; everything else is surfaced as an opaque
//! [`Entry`] and skipped over by its declared size.
//!
//! # Hardened iteration
//!
//! Firmware tables are external input. An entry declaring `size == 0`
//! would make size-based advancement loop forever, so it is reported as a
//! hard [`ParseError::MalformedEntry`]; an entry whose declared size runs
//! past the end of the table terminates iteration at the table end.

use dataview::{DataView, Pod};
use snafu::{Snafu, ensure};

/// Byte offset of the first entry: the size of the fixed ACPI table header.
pub const ENTRIES_OFFSET: usize = 36;

/// Errors that can occur while parsing an RTCT blob.
#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("RTCT table of {len} bytes is too small to hold any entry"))]
    TableTooSmall {
        len: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("malformed RTCT entry at offset {offset}"))]
    MalformedEntry {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Common header starting every RTCT entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct EntryHeader {
    /// Total entry size in bytes, header included.
    pub size: u16,
    /// Format version of the entry payload.
    pub format: u16,
    /// Type discriminator, see [`EntryType`].
    pub type_: u32,
}

/// Entry type discriminators defined by the RTCT format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EntryType {
    RtcdLimits = 0x1,
    RtcmBinary = 0x2,
    WrcL3WayMasks = 0x3,
    GtL3WayMasks = 0x4,
    PseudoSram = 0x5,
    StreamDataPath = 0x6,
    TimeAwareSubSystems = 0x7,
    RealTimeIommu = 0x8,
    MemoryHierarchyLatency = 0x9,
}

impl EntryType {
    /// Maps a raw discriminator to a known entry type.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        let ty = match raw {
            0x1 => Self::RtcdLimits,
            0x2 => Self::RtcmBinary,
            0x3 => Self::WrcL3WayMasks,
            0x4 => Self::GtL3WayMasks,
            0x5 => Self::PseudoSram,
            0x6 => Self::StreamDataPath,
            0x7 => Self::TimeAwareSubSystems,
            0x8 => Self::RealTimeIommu,
            0x9 => Self::MemoryHierarchyLatency,
            _ => return None,
        };
        Some(ty)
    }
}

/// Level of the memory hierarchy a latency entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryHierarchy {
    L2 = 0x2,
    L3 = 0x3,
    Dram = 0x100,
}

/// Payload of a [`EntryType::MemoryHierarchyLatency`] entry.
///
/// The fixed part below may be followed by a list of APIC IDs; the tail is
/// not interpreted here.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct MemoryHierarchyLatency {
    pub header: EntryHeader,
    /// Raw hierarchy level, see [`MemoryHierarchy`].
    pub hierarchy: u32,
    /// Worst-case access latency in CPU clock cycles.
    pub clock_cycles_latency: u32,
}

/// The entry range of an RTCT table, borrowed from the raw table bytes.
#[derive(Clone, Copy)]
pub struct Entries<'tbl> {
    view: &'tbl DataView,
    begin: usize,
    end: usize,
}

impl<'tbl> Entries<'tbl> {
    /// Locates the entry range inside a raw RTCT blob.
    ///
    /// A table consisting of exactly the fixed header is valid and holds no
    /// entries.
    ///
    /// # Errors
    ///
    /// Fails with [`ParseError::TableTooSmall`] when the blob cannot hold
    /// the fixed header plus at least one entry header.
    pub fn new(table: &'tbl [u8]) -> Result<Self, ParseError> {
        let len = table.len();
        let view = DataView::from(table);
        if len == ENTRIES_OFFSET {
            return Ok(Self {
                view,
                begin: len,
                end: len,
            });
        }
        ensure!(
            len >= ENTRIES_OFFSET + size_of::<EntryHeader>(),
            TableTooSmallSnafu { len }
        );
        Ok(Self {
            view,
            begin: ENTRIES_OFFSET,
            end: len,
        })
    }

    /// Byte offset one past the last entry. Serves as the cursor's
    /// exhausted position.
    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Returns the entry starting at `offset`, or `None` at the table end.
    ///
    /// # Errors
    ///
    /// Fails when the remaining bytes cannot hold an entry header.
    pub fn entry_at(&self, offset: usize) -> Result<Option<Entry<'tbl>>, ParseError> {
        if offset >= self.end {
            return Ok(None);
        }
        // Entries are read by unaligned copy; the blob may sit in a buffer
        // without any particular alignment.
        let Some(header) = self.view.try_read::<EntryHeader>(offset) else {
            return MalformedEntrySnafu { offset }.fail();
        };
        Ok(Some(Entry {
            view: self.view,
            offset,
            header,
        }))
    }

    /// Advances the cursor by the current entry's declared size.
    ///
    /// `None` positions the cursor at the first entry. A cursor at the
    /// table end stays there; a size stepping past the end clamps to it.
    ///
    /// # Errors
    ///
    /// Fails with [`ParseError::MalformedEntry`] for an entry declaring
    /// `size == 0`, which could never advance.
    pub fn next_entry(&self, current: Option<usize>) -> Result<usize, ParseError> {
        let Some(current) = current else {
            return Ok(self.begin);
        };
        if current >= self.end {
            log::debug!("end of RTCT entry range");
            return Ok(self.end);
        }
        let Some(entry) = self.entry_at(current)? else {
            return Ok(self.end);
        };
        let size = usize::from(entry.header.size);
        ensure!(size != 0, MalformedEntrySnafu { offset: current });
        Ok(usize::min(current + size, self.end))
    }

    /// Iterates over all entries in table order.
    #[must_use]
    pub fn iter(&self) -> EntryIter<'tbl> {
        EntryIter {
            entries: *self,
            cursor: None,
            failed: false,
        }
    }

    /// Looks up the first latency entry for the given hierarchy level and
    /// returns its latency in clock cycles, or `None` when the table has no
    /// such entry.
    ///
    /// # Errors
    ///
    /// Propagates iteration failures over malformed tables.
    pub fn latency_clk(&self, level: MemoryHierarchy) -> Result<Option<u32>, ParseError> {
        for entry in self.iter() {
            let entry = entry?;
            let Some(mhl) = entry.as_memory_hierarchy_latency() else {
                continue;
            };
            if mhl.hierarchy == level as u32 {
                return Ok(Some(mhl.clock_cycles_latency));
            }
        }
        log::warn!("no latency entry for {level:?} in RTCT table");
        Ok(None)
    }

    /// Shorthand for [`latency_clk`](Self::latency_clk) on the DRAM level,
    /// the value the region managers need for their DRAM fallback slot.
    ///
    /// # Errors
    ///
    /// Propagates iteration failures over malformed tables.
    pub fn dram_latency_clk(&self) -> Result<Option<u32>, ParseError> {
        self.latency_clk(MemoryHierarchy::Dram)
    }
}

impl<'tbl> IntoIterator for &Entries<'tbl> {
    type Item = Result<Entry<'tbl>, ParseError>;
    type IntoIter = EntryIter<'tbl>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One entry of the table: its header plus access to the typed payload.
#[derive(Clone, Copy)]
pub struct Entry<'tbl> {
    view: &'tbl DataView,
    offset: usize,
    header: EntryHeader,
}

impl Entry<'_> {
    /// Byte offset of this entry inside the table.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn header(&self) -> EntryHeader {
        self.header
    }

    /// The entry's type, or `None` for a discriminator this crate does not
    /// know.
    #[must_use]
    pub fn entry_type(&self) -> Option<EntryType> {
        EntryType::from_raw(self.header.type_)
    }

    /// Reads the entry as a memory hierarchy latency record. Returns `None`
    /// when the type does not match or the payload is truncated.
    #[must_use]
    pub fn as_memory_hierarchy_latency(&self) -> Option<MemoryHierarchyLatency> {
        if self.entry_type() != Some(EntryType::MemoryHierarchyLatency) {
            return None;
        }
        self.view.try_read::<MemoryHierarchyLatency>(self.offset)
    }
}

/// Iterator over table entries, yielding a hard error once on a malformed
/// entry and ending afterwards.
pub struct EntryIter<'tbl> {
    entries: Entries<'tbl>,
    cursor: Option<usize>,
    failed: bool,
}

impl<'tbl> Iterator for EntryIter<'tbl> {
    type Item = Result<Entry<'tbl>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let offset = match self.entries.next_entry(self.cursor) {
            Ok(offset) => offset,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        self.cursor = Some(offset);
        match self.entries.entry_at(offset) {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a table: 36 zero bytes of header, then the given entries.
    fn table(entries: &[(u16, u32, &[u8])]) -> Vec<u8> {
        let mut bytes = vec![0_u8; ENTRIES_OFFSET];
        for &(size, type_, payload) in entries {
            bytes.extend_from_slice(&size.to_le_bytes());
            bytes.extend_from_slice(&1_u16.to_le_bytes());
            bytes.extend_from_slice(&type_.to_le_bytes());
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    fn latency_payload(hierarchy: u32, clk: u32) -> Vec<u8> {
        let mut payload = hierarchy.to_le_bytes().to_vec();
        payload.extend_from_slice(&clk.to_le_bytes());
        payload
    }

    #[test]
    fn rejects_truncated_table() {
        assert!(matches!(
            Entries::new(&[]),
            Err(ParseError::TableTooSmall { .. })
        ));
        assert!(matches!(
            Entries::new(&[0; ENTRIES_OFFSET - 1]),
            Err(ParseError::TableTooSmall { .. })
        ));
        assert!(matches!(
            Entries::new(&[0; ENTRIES_OFFSET + 7]),
            Err(ParseError::TableTooSmall { .. })
        ));
    }

    #[test]
    fn header_only_table_has_no_entries() {
        let entries = Entries::new(&[0; ENTRIES_OFFSET]).unwrap();
        assert_eq!(entries.iter().count(), 0);
    }

    #[test]
    fn iterates_entries_in_order() {
        let bytes = table(&[
            (12, 0x5, &[0xaa; 4]),
            (16, 0x9, &latency_payload(0x2, 100)),
            (12, 0x1, &[0xbb; 4]),
        ]);
        let entries = Entries::new(&bytes).unwrap();
        let types: Vec<_> = entries
            .iter()
            .map(|entry| entry.unwrap().entry_type())
            .collect();
        assert_eq!(
            types,
            [
                Some(EntryType::PseudoSram),
                Some(EntryType::MemoryHierarchyLatency),
                Some(EntryType::RtcdLimits),
            ]
        );
    }

    #[test]
    fn zero_size_entry_is_a_hard_error() {
        let bytes = table(&[(12, 0x5, &[0; 4]), (0, 0x9, &[0; 8])]);
        let entries = Entries::new(&bytes).unwrap();
        let mut iter = entries.iter();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().unwrap().entry_type().is_some());
        assert!(matches!(
            iter.next(),
            Some(Err(ParseError::MalformedEntry { .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn oversize_entry_clamps_to_table_end() {
        let bytes = table(&[(12, 0x5, &[0; 4]), (0x4000, 0x1, &[0; 4])]);
        let entries = Entries::new(&bytes).unwrap();
        let collected: Vec<_> = entries.iter().collect();
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(Result::is_ok));
    }

    #[test]
    fn cursor_is_idempotent_at_end() {
        let bytes = table(&[(12, 0x5, &[0; 4])]);
        let entries = Entries::new(&bytes).unwrap();
        let first = entries.next_entry(None).unwrap();
        let end = entries.next_entry(Some(first)).unwrap();
        assert_eq!(end, entries.end());
        assert_eq!(entries.next_entry(Some(end)).unwrap(), end);
        assert!(entries.entry_at(end).unwrap().is_none());
    }

    #[test]
    fn finds_dram_latency_among_other_entries() {
        let bytes = table(&[
            (12, 0x2, &[0xff; 4]),
            (16, 0x9, &latency_payload(0x2, 50)),
            (16, 0x9, &latency_payload(0x100, 12000)),
        ]);
        let entries = Entries::new(&bytes).unwrap();
        assert_eq!(entries.dram_latency_clk().unwrap(), Some(12000));
        assert_eq!(
            entries.latency_clk(MemoryHierarchy::L2).unwrap(),
            Some(50)
        );
        assert_eq!(entries.latency_clk(MemoryHierarchy::L3).unwrap(), None);
    }

    #[test]
    fn missing_dram_latency_is_none() {
        let bytes = table(&[(16, 0x9, &latency_payload(0x3, 80))]);
        let entries = Entries::new(&bytes).unwrap();
        assert_eq!(entries.dram_latency_clk().unwrap(), None);
    }

    #[test]
    fn garbage_payload_on_non_latency_entry_is_ignored() {
        // A pseudo-SRAM entry whose payload happens to contain the DRAM
        // hierarchy value must not be taken for a latency record.
        let bytes = table(&[(16, 0x5, &latency_payload(0x100, 1))]);
        let entries = Entries::new(&bytes).unwrap();
        assert_eq!(entries.dram_latency_clk().unwrap(), None);
    }

    #[test]
    fn truncated_latency_payload_is_skipped() {
        let bytes = table(&[(12, 0x9, &[0x00, 0x01, 0x00, 0x00])]);
        let entries = Entries::new(&bytes).unwrap();
        assert_eq!(entries.dram_latency_clk().unwrap(), None);
    }
}
