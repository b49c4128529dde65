//! Narrow interface to the transaction log, plus the recovery verbs the
//! disk allocator emits.
//!
//! The log manager proper (append buffering, group commit, media recovery)
//! lives outside this crate; the storage core only needs to append typed
//! records and to replay postponed deallocations at transaction end.

use std::sync::Mutex;

use crate::types::{Lsa, PageId, PageType, VolId, Vpid};

/// Recovery verbs emitted by the disk allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryVerb {
    /// Undo: full volume path. Redo: full header.
    Format,
    /// Redo: number of pre-set bits of a fresh bitmap page.
    InitMap,
    /// Undo: sector delta. Redo: negated delta.
    VhdrScalloc,
    /// Undo/redo: `{bit, num, kind, ptype}` applied to the header counters.
    VhdrPgalloc,
    /// Undo/redo: a bit range of an allocation table page.
    IdAlloc,
    /// Postpone: clear a bit range and the header counters in one replay.
    IdDeallocWithVolheader,
    /// Bitmap half of a replayed postponed deallocation.
    IdDeallocBitmapOnly,
    /// Header half of a replayed postponed deallocation.
    IdDeallocVhdrOnly,
    /// Out-of-data-page redo: recreate the volume file.
    NewVol,
    /// Undo: previous next-volid. Redo: new next-volid.
    LinkPermVolext,
    /// Redo: `{volid, start, npages}` of freshly added pages.
    InitPages,
}

/// Which allocation table a bit-range record addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Sector,
    Page,
}

/// Bit-range payload of `IdAlloc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MtabBits {
    pub start_bit: u32,
    pub num: i32,
}

/// Bit-range payload carrying the deallocation kind and page type, used by
/// the verbs that also maintain the volume header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MtabBitsWith {
    pub start_bit: u32,
    pub num: i32,
    pub kind: AllocKind,
    pub ptype: PageType,
}

/// Payload of `InitPages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitPagesInfo {
    pub volid: VolId,
    pub start_pageid: PageId,
    pub npages: i32,
}

/// Typed record payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum LogData {
    None,
    Bits(MtabBits),
    BitsWith(MtabBitsWith),
    InitPages(InitPagesInfo),
    Path(String),
    HeaderBlob(Vec<u8>),
    Sects(i32),
    VolId(VolId),
}

/// Address of the data a record applies to: a page plus a byte offset into
/// its data area. Out-of-data-page records carry no address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogAddr {
    pub vpid: Vpid,
    pub offset: i32,
}

impl LogAddr {
    pub fn new(vpid: Vpid, offset: i32) -> Self {
        Self { vpid, offset }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Undo,
    Redo,
    UndoRedo,
    DbOutsideRedo,
    Postpone,
    RunPostpone,
}

/// One appended record, as the storage core sees it.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub lsa: Lsa,
    pub kind: RecordKind,
    pub verb: RecoveryVerb,
    pub addr: Option<LogAddr>,
    pub undo: LogData,
    pub redo: LogData,
}

/// The append interface the allocator drives. Appends happen while the
/// volume header latch is held, which serializes persistent state against
/// other transactions.
pub trait LogManager: Send + Sync {
    fn append_undo(&self, verb: RecoveryVerb, addr: Option<LogAddr>, undo: LogData) -> Lsa;
    fn append_redo(&self, verb: RecoveryVerb, addr: Option<LogAddr>, redo: LogData) -> Lsa;
    fn append_undoredo(
        &self,
        verb: RecoveryVerb,
        addr: LogAddr,
        undo: LogData,
        redo: LogData,
    ) -> Lsa;
    fn append_dboutside_redo(&self, verb: RecoveryVerb, redo: LogData) -> Lsa;
    fn append_postpone(&self, verb: RecoveryVerb, addr: LogAddr, data: LogData) -> Lsa;
    fn append_run_postpone(&self, verb: RecoveryVerb, addr: LogAddr, data: LogData, ref_lsa: Lsa)
        -> Lsa;
    /// Force everything appended so far to stable storage.
    fn flush(&self);
}

/// An in-memory log: records everything appended, hands out monotonically
/// increasing LSAs. Serves recovery tests and embedded use.
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn push(
        &self,
        kind: RecordKind,
        verb: RecoveryVerb,
        addr: Option<LogAddr>,
        undo: LogData,
        redo: LogData,
    ) -> Lsa {
        let mut records = self.records.lock().unwrap();
        let lsa = Lsa::new(records.len() as i64, 0);
        records.push(LogRecord {
            lsa,
            kind,
            verb,
            addr,
            undo,
            redo,
        });
        lsa
    }
}

impl LogManager for MemoryLog {
    fn append_undo(&self, verb: RecoveryVerb, addr: Option<LogAddr>, undo: LogData) -> Lsa {
        self.push(RecordKind::Undo, verb, addr, undo, LogData::None)
    }

    fn append_redo(&self, verb: RecoveryVerb, addr: Option<LogAddr>, redo: LogData) -> Lsa {
        self.push(RecordKind::Redo, verb, addr, LogData::None, redo)
    }

    fn append_undoredo(
        &self,
        verb: RecoveryVerb,
        addr: LogAddr,
        undo: LogData,
        redo: LogData,
    ) -> Lsa {
        self.push(RecordKind::UndoRedo, verb, Some(addr), undo, redo)
    }

    fn append_dboutside_redo(&self, verb: RecoveryVerb, redo: LogData) -> Lsa {
        self.push(RecordKind::DbOutsideRedo, verb, None, LogData::None, redo)
    }

    fn append_postpone(&self, verb: RecoveryVerb, addr: LogAddr, data: LogData) -> Lsa {
        self.push(RecordKind::Postpone, verb, Some(addr), LogData::None, data)
    }

    fn append_run_postpone(
        &self,
        verb: RecoveryVerb,
        addr: LogAddr,
        data: LogData,
        _ref_lsa: Lsa,
    ) -> Lsa {
        self.push(RecordKind::RunPostpone, verb, Some(addr), LogData::None, data)
    }

    fn flush(&self) {}
}

/// A postponed deallocation: applied only at transaction commit, so a
/// rolled-back transaction never exposes its pages as free.
#[derive(Clone, Debug)]
pub struct PostponedDealloc {
    pub addr: LogAddr,
    pub bits: MtabBitsWith,
    /// LSA of the postpone record, referenced by the run-postpone pair
    /// appended at commit.
    pub ref_lsa: Lsa,
}

/// Minimal transaction context: the queue of postponed operations this
/// transaction has accumulated. The full transaction table lives with the
/// log/recovery manager.
#[derive(Default)]
pub struct Txn {
    postponed: Vec<PostponedDealloc>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_postponed(&mut self, addr: LogAddr, bits: MtabBitsWith, ref_lsa: Lsa) {
        self.postponed.push(PostponedDealloc {
            addr,
            bits,
            ref_lsa,
        });
    }

    /// Drain the postponed queue for commit-time replay.
    pub fn take_postponed(&mut self) -> Vec<PostponedDealloc> {
        std::mem::take(&mut self.postponed)
    }

    pub fn postponed_len(&self) -> usize {
        self.postponed.len()
    }
}
