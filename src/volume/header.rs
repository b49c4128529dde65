//! The on-disk volume header, stored at byte 0 of page 0's data area.

use crate::error::StorageError;
use crate::types::{
    Lsa, PageId, Purpose, SectId, VolId, NULL_VOLID, PAGE_BIT, SECTOR_NPAGES, VOLHEADER_PAGE,
};

/// Identifies a Rye data volume.
pub const RYE_MAGIC: [u8; 16] = *b"RYE/Volume\0\0\0\0\0\0";

/// Fixed-layout header. The volume full name follows the struct in the
/// header page's data area, length-prefixed.
#[derive(Clone, Copy, Debug, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct VolHeader {
    pub magic: [u8; 16],
    /// xxh3 of the header with this field zeroed; sealed after mutation.
    pub checksum: u64,
    pub iopagesize: i32,
    pub volid: VolId,
    pub next_volid: VolId,
    pub purpose: i32,
    /// Pages per sector; a fixed constant for the whole database.
    pub sect_npgs: i32,
    pub total_sects: i32,
    pub free_sects: i32,
    /// Hint of the next sector to allocate. Never logged; fixed up by use.
    pub hint_allocsect: SectId,
    pub total_pages: i32,
    pub free_pages: i32,
    pub sect_alloctb_npages: i32,
    pub sect_alloctb_page1: PageId,
    pub page_alloctb_npages: i32,
    pub page_alloctb_page1: PageId,
    pub sys_lastpage: PageId,
    pub max_npages: i32,
    pub used_data_npages: i32,
    pub used_index_npages: i32,
    pub fullname_len: u16,
    _resv: u16,
    pub db_creation: i64,
    pub chkpt_lsa: Lsa,
}

pub const VOLHEADER_SIZE: usize = std::mem::size_of::<VolHeader>();

/// Geometry of the allocation tables, derived from `max_npages` so that
/// the tables can cover a GENERIC volume fully grown.
#[derive(Clone, Copy, Debug)]
pub struct AllocTables {
    pub sect_alloctb_npages: i32,
    pub sect_alloctb_page1: PageId,
    pub page_alloctb_npages: i32,
    pub page_alloctb_page1: PageId,
    pub sys_lastpage: PageId,
}

fn ceil_div(a: i32, b: i32) -> i32 {
    (a + b - 1) / b
}

/// Size the SAT and PAT for a volume that may hold up to `max_npages`.
pub fn set_alloctables(max_npages: i32) -> AllocTables {
    let max_sects = ceil_div(max_npages, SECTOR_NPAGES);
    let sect_alloctb_npages = ceil_div(max_sects, PAGE_BIT).max(1);
    let page_alloctb_npages = ceil_div(max_npages, PAGE_BIT).max(1);
    let sect_alloctb_page1 = VOLHEADER_PAGE + 1;
    let page_alloctb_page1 = sect_alloctb_page1 + sect_alloctb_npages;
    AllocTables {
        sect_alloctb_npages,
        sect_alloctb_page1,
        page_alloctb_npages,
        page_alloctb_page1,
        sys_lastpage: page_alloctb_page1 + page_alloctb_npages - 1,
    }
}

impl VolHeader {
    /// View the header within a header page's data area.
    pub fn view(data: &[u8]) -> &VolHeader {
        bytemuck::from_bytes(&data[..VOLHEADER_SIZE])
    }

    pub fn view_mut(data: &mut [u8]) -> &mut VolHeader {
        bytemuck::from_bytes_mut(&mut data[..VOLHEADER_SIZE])
    }

    pub fn purpose(&self) -> Purpose {
        Purpose::from_i32(self.purpose).unwrap_or(Purpose::Unknown)
    }

    /// Recompute and store the integrity checksum.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = xxhash_rust::xxh3::xxh3_64(bytemuck::bytes_of(self));
    }

    pub fn checksum_ok(&self) -> bool {
        let mut copy = *self;
        copy.checksum = 0;
        xxhash_rust::xxh3::xxh3_64(bytemuck::bytes_of(&copy)) == self.checksum
    }

    /// Check every structural invariant of the header.
    pub fn verify(&self) -> Result<(), StorageError> {
        let bad = || StorageError::BadVolumeHeader(self.volid);
        if self.magic != RYE_MAGIC {
            return Err(bad());
        }
        let purpose = Purpose::from_i32(self.purpose).ok_or_else(bad)?;
        if self.total_pages <= 0
            || self.free_pages < 0
            || self.free_pages > self.total_pages
            || self.total_sects <= 0
            || self.free_sects < 0
            || self.free_sects > self.total_sects
        {
            return Err(bad());
        }
        if self.sect_npgs != SECTOR_NPAGES
            || self.total_sects != ceil_div(self.total_pages, self.sect_npgs)
            || self.sect_alloctb_page1 != VOLHEADER_PAGE + 1
            || self.page_alloctb_page1 != self.sect_alloctb_page1 + self.sect_alloctb_npages
            || self.sys_lastpage != self.page_alloctb_page1 + self.page_alloctb_npages - 1
        {
            return Err(bad());
        }
        if purpose != Purpose::TempTemp {
            if self.sect_alloctb_npages < ceil_div(self.total_sects, PAGE_BIT)
                || self.page_alloctb_npages < ceil_div(self.total_pages, PAGE_BIT)
            {
                return Err(bad());
            }
        }
        if purpose != Purpose::PermGeneric
            && purpose != Purpose::TempTemp
            && self.total_pages != self.max_npages
        {
            return Err(bad());
        }
        Ok(())
    }

    /// Initialize a fresh header. The caller fills in the free counters and
    /// the hint after the allocation tables exist.
    pub fn init(
        volid: VolId,
        purpose: Purpose,
        total_pages: i32,
        max_npages: i32,
        db_creation: i64,
        chkpt_lsa: Lsa,
    ) -> VolHeader {
        let tables = set_alloctables(max_npages);
        VolHeader {
            magic: RYE_MAGIC,
            checksum: 0,
            iopagesize: crate::types::IO_PAGESIZE as i32,
            volid,
            next_volid: NULL_VOLID,
            purpose: purpose as i32,
            sect_npgs: SECTOR_NPAGES,
            total_sects: ceil_div(total_pages, SECTOR_NPAGES),
            free_sects: 0,
            hint_allocsect: 0,
            total_pages,
            free_pages: 0,
            sect_alloctb_npages: tables.sect_alloctb_npages,
            sect_alloctb_page1: tables.sect_alloctb_page1,
            page_alloctb_npages: tables.page_alloctb_npages,
            page_alloctb_page1: tables.page_alloctb_page1,
            sys_lastpage: tables.sys_lastpage,
            max_npages,
            used_data_npages: 0,
            used_index_npages: 0,
            fullname_len: 0,
            _resv: 0,
            db_creation,
            chkpt_lsa,
        }
    }

    /// First and last page of a sector, clipped to the volume.
    pub fn sector_page_range(&self, sectid: SectId) -> (PageId, PageId) {
        let first = sectid * self.sect_npgs;
        let last = if sectid + 1 >= self.total_sects {
            self.total_pages - 1
        } else {
            first + self.sect_npgs - 1
        };
        (first, last)
    }
}

/// Read the volume full name stored after the header.
pub fn read_fullname(data: &[u8]) -> String {
    let hdr = VolHeader::view(data);
    let start = VOLHEADER_SIZE;
    let end = start + hdr.fullname_len as usize;
    String::from_utf8_lossy(&data[start..end]).into_owned()
}

/// Store the volume full name after the header; updates `fullname_len`.
pub fn write_fullname(data: &mut [u8], fullname: &str) {
    let bytes = fullname.as_bytes();
    let start = VOLHEADER_SIZE;
    data[start..start + bytes.len()].copy_from_slice(bytes);
    VolHeader::view_mut(data).fullname_len = bytes.len() as u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(total: i32, max: i32, purpose: Purpose) -> VolHeader {
        let mut hdr = VolHeader::init(7, purpose, total, max, 0, Lsa::NULL);
        hdr.free_pages = total - hdr.sys_lastpage - 1;
        hdr.free_sects =
            hdr.total_sects - (hdr.sys_lastpage + 1 + SECTOR_NPAGES - 1) / SECTOR_NPAGES;
        hdr.hint_allocsect = hdr.total_sects - 1;
        hdr
    }

    #[test]
    fn header_size_is_stable() {
        // The on-disk layout: any change here is a format change.
        assert_eq!(VOLHEADER_SIZE, 120);
    }

    #[test]
    fn fresh_header_verifies() {
        let hdr = fresh(1024, 1024, Purpose::PermData);
        hdr.verify().unwrap();
    }

    #[test]
    fn generic_may_be_smaller_than_max() {
        let hdr = fresh(512, 4096, Purpose::PermGeneric);
        hdr.verify().unwrap();

        let hdr = fresh(512, 4096, Purpose::PermData);
        assert!(hdr.verify().is_err());
    }

    #[test]
    fn tables_cover_max_npages() {
        let t = set_alloctables(PAGE_BIT * 3 + 1);
        assert_eq!(t.page_alloctb_npages, 4);
        assert_eq!(t.sect_alloctb_npages, 1);
        assert_eq!(t.sect_alloctb_page1, 1);
        assert_eq!(t.page_alloctb_page1, 2);
        assert_eq!(t.sys_lastpage, 5);
    }

    #[test]
    fn seal_and_checksum() {
        let mut hdr = fresh(1024, 1024, Purpose::PermData);
        hdr.seal();
        assert!(hdr.checksum_ok());
        hdr.free_pages -= 1;
        assert!(!hdr.checksum_ok());
        hdr.seal();
        assert!(hdr.checksum_ok());
    }

    #[test]
    fn fullname_roundtrip() {
        let mut data = vec![0u8; 4096];
        let hdr = fresh(1024, 1024, Purpose::PermData);
        *VolHeader::view_mut(&mut data) = hdr;
        write_fullname(&mut data, "/data/rye/vol0007");
        assert_eq!(read_fullname(&data), "/data/rye/vol0007");
    }
}
