//! Identifier types and shared scalars used across the storage and query
//! layers.

use std::time::Duration;

/// Volume identifier. Negative values are sentinels.
pub type VolId = i16;
/// Page identifier within a volume.
pub type PageId = i32;
/// Sector identifier within a volume.
pub type SectId = i32;

pub const NULL_VOLID: VolId = -1;
pub const NULL_PAGEID: PageId = -1;
pub const NULL_SECTID: SectId = -1;

/// Size of one I/O page, including the recovery prolog.
pub const IO_PAGESIZE: usize = 16 * 1024;
/// Bytes of the per-page recovery prolog (the page LSA).
pub const PAGE_PROLOG_SIZE: usize = 16;
/// Usable data bytes per page.
pub const DB_PAGESIZE: usize = IO_PAGESIZE - PAGE_PROLOG_SIZE;
/// Allocation-table bits held by one bitmap page.
pub const PAGE_BIT: i32 = (DB_PAGESIZE * 8) as i32;

/// Pages per sector, the unit of coarse allocation.
pub const SECTOR_NPAGES: i32 = 10;
/// Page 0 of every volume holds the header.
pub const VOLHEADER_PAGE: PageId = 0;
/// Sector allocation hints start a little away from the volume top so that
/// special-sector allocations find nearby pages.
pub const HINT_START_SECT: SectId = 4;
/// The special sector: permitted to take pages from any free range of the
/// volume. It is never deallocated.
pub const SECTOR_WITH_ALL_PAGES: SectId = 0;

/// A volume-qualified page identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vpid {
    pub volid: VolId,
    pub pageid: PageId,
}

impl Vpid {
    pub fn new(volid: VolId, pageid: PageId) -> Self {
        Self { volid, pageid }
    }
}

/// Log sequence address: log page plus offset within it.
///
/// Two sentinels exist: the null LSA (nothing logged yet) and the temporary
/// LSA that marks pages of temporary volumes, which must never be logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct Lsa {
    pub pageid: i64,
    pub offset: i32,
    _resv: i32,
}

impl Lsa {
    pub const NULL: Lsa = Lsa {
        pageid: NULL_PAGEID as i64,
        offset: -1,
        _resv: 0,
    };
    /// Sentinel stamped on pages of temporary volumes.
    pub const INIT_TEMP: Lsa = Lsa {
        pageid: (NULL_PAGEID as i64) - 1,
        offset: -2,
        _resv: 0,
    };

    pub fn new(pageid: i64, offset: i32) -> Self {
        Self {
            pageid,
            offset,
            _resv: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.pageid == NULL_PAGEID as i64
    }

    pub fn is_temporary(&self) -> bool {
        *self == Self::INIT_TEMP
    }
}

/// Storage purpose of a volume. The discriminants are externally visible:
/// they appear in volume headers and in the admin protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum Purpose {
    PermData = 0,
    PermIndex = 1,
    PermGeneric = 2,
    PermTemp = 3,
    TempTemp = 4,
    EitherTemp = 5,
    Unknown = 6,
}

impl Purpose {
    pub fn from_i32(v: i32) -> Option<Purpose> {
        match v {
            0 => Some(Purpose::PermData),
            1 => Some(Purpose::PermIndex),
            2 => Some(Purpose::PermGeneric),
            3 => Some(Purpose::PermTemp),
            4 => Some(Purpose::TempTemp),
            5 => Some(Purpose::EitherTemp),
            6 => Some(Purpose::Unknown),
            _ => None,
        }
    }

    /// True for the purposes whose pages are never logged.
    pub fn is_temporary(self) -> bool {
        matches!(self, Purpose::PermTemp | Purpose::TempTemp)
    }

    pub fn to_string_label(self) -> &'static str {
        match self {
            Purpose::PermData => "Permanent data purpose",
            Purpose::PermIndex => "Permanent index purpose",
            Purpose::PermGeneric => "Permanent generic purpose",
            Purpose::PermTemp => "Permanent temp purpose",
            Purpose::TempTemp => "Temporary temp purpose",
            Purpose::EitherTemp => "Either temp purpose",
            Purpose::Unknown => "Unknown purpose",
        }
    }
}

/// Page-type tag carried by allocation requests, used for the per-purpose
/// used-page accounting of DATA/INDEX/GENERIC volumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum PageType {
    Unknown = 0,
    Data = 1,
    Index = 2,
    Temp = 3,
}

impl PageType {
    pub fn from_i32(v: i32) -> Option<PageType> {
        match v {
            0 => Some(PageType::Unknown),
            1 => Some(PageType::Data),
            2 => Some(PageType::Index),
            3 => Some(PageType::Temp),
            _ => None,
        }
    }
}

/// Result of a page/sector validity probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskIsValid {
    Valid,
    Invalid,
    Error,
}

/// How a set of requested pages may be laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetPageMode {
    /// All pages in one contiguous run.
    Contiguous,
    /// Any layout, but within a single volume.
    NoncontiguousSameVol,
    /// Any layout, spanning volumes if needed.
    NoncontiguousSpanVols,
}

/// File identifier: the volume holding the file header plus its id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Vfid {
    pub volid: VolId,
    pub fileid: i32,
}

/// Heap file identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hfid {
    pub vfid: Vfid,
    pub hpgid: PageId,
}

/// Object identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid {
    pub volid: VolId,
    pub pageid: PageId,
    pub slotid: i16,
}

impl Oid {
    pub const NULL: Oid = Oid {
        volid: NULL_VOLID,
        pageid: NULL_PAGEID,
        slotid: -1,
    };

    pub fn is_null(&self) -> bool {
        self.pageid == NULL_PAGEID
    }
}

/// System parameters consumed by the storage and query core. The full
/// parameter table lives with the boot manager; only the knobs this crate
/// reads are carried here.
#[derive(Clone, Debug)]
pub struct SysParams {
    /// Bound on predicate-tree recursion depth.
    pub max_sql_depth: u32,
    /// When the aggregate free space of GENERIC volumes drops below this
    /// many bytes, the router is asked to grow a volume.
    pub generic_vol_prealloc_bytes: u64,
    /// Size of automatically added volumes.
    pub db_volume_bytes: u64,
    /// Growth step for temporary volumes, in pages.
    pub temp_expand_increment: i32,
    /// How long a single page-latch acquisition may wait.
    pub latch_timeout: Duration,
    /// How many timed-out acquisitions are retried before aborting.
    pub latch_retries: u32,
}

impl Default for SysParams {
    fn default() -> Self {
        Self {
            max_sql_depth: 400,
            generic_vol_prealloc_bytes: 1024 * 1024,
            db_volume_bytes: 512 * 1024 * 1024,
            temp_expand_increment: 1000,
            latch_timeout: Duration::from_secs(10),
            latch_retries: 10,
        }
    }
}

impl SysParams {
    /// The GENERIC shortage threshold expressed in pages.
    pub fn generic_prealloc_pages(&self) -> i32 {
        (self.generic_vol_prealloc_bytes / IO_PAGESIZE as u64) as i32
    }

    /// The auto-added volume size expressed in pages.
    pub fn db_volume_pages(&self) -> i32 {
        (self.db_volume_bytes / IO_PAGESIZE as u64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsa_sentinels_are_distinct() {
        assert!(Lsa::NULL.is_null());
        assert!(!Lsa::NULL.is_temporary());
        assert!(Lsa::INIT_TEMP.is_temporary());
        assert!(!Lsa::INIT_TEMP.is_null());
    }

    #[test]
    fn purpose_roundtrip() {
        for v in 0..=6 {
            let p = Purpose::from_i32(v).unwrap();
            assert_eq!(p as i32, v);
        }
        assert!(Purpose::from_i32(7).is_none());
        assert!(Purpose::PermTemp.is_temporary());
        assert!(Purpose::TempTemp.is_temporary());
        assert!(!Purpose::PermGeneric.is_temporary());
    }
}
