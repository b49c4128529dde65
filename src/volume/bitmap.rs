//! Operations on the sector and page allocation tables (SAT/PAT).
//!
//! Each bit maps one sector or page: 1 = allocated, 0 = free. Identifier
//! `id` lives in allocation-table page `id / PAGE_BIT + at_pg1`, at byte
//! `(id % PAGE_BIT) / 8`, bit `id % 8`.
//!
//! Callers hold the volume header latch for the whole operation; bitmap
//! pages are latched underneath it (header before bitmap, never the
//! reverse).

use crate::error::StorageError;
use crate::pgbuf::PageBuf;
use crate::types::{
    DiskIsValid, PageId, Purpose, VolId, Vpid, PAGE_BIT, SECTOR_WITH_ALL_PAGES,
};
use crate::wal::{AllocKind, LogAddr, LogData, LogManager, MtabBits, RecoveryVerb};

use super::header::VolHeader;

pub(crate) fn bit_set(byte: &mut u8, n: u32) {
    *byte |= 1 << n;
}

pub(crate) fn bit_clear(byte: &mut u8, n: u32) {
    *byte &= !(1 << n);
}

pub(crate) fn bit_is_set(byte: u8, n: u32) -> bool {
    byte & (1 << n) != 0
}

/// Scan `[low, high]` of an allocation table for `nalloc` contiguous free
/// bits, then set them, logging one bit-range undo/redo per touched bitmap
/// page. Returns the first allocated id, or `None` if no run exists.
///
/// `skip_id` is excluded from any run even when its bit reads free; it is
/// the near-page the caller just used, skipped to avoid re-allocation
/// collisions. When allocating a single sector and `exp_npages > 0`, the
/// sector's underlying page range must also hold that many contiguous free
/// pages.
#[allow(clippy::too_many_arguments)]
pub(crate) fn id_alloc(
    pgbuf: &PageBuf,
    log: &dyn LogManager,
    volid: VolId,
    vhdr: &VolHeader,
    nalloc: i32,
    low_allid: i32,
    high_allid: i32,
    kind: AllocKind,
    exp_npages: i32,
    skip_id: i32,
) -> Result<Option<i32>, StorageError> {
    if nalloc <= 0 {
        return Ok(None);
    }
    let at_pg1 = match kind {
        AllocKind::Sector => vhdr.sect_alloctb_page1,
        AllocKind::Page => vhdr.page_alloctb_page1,
    };

    let mut low = low_allid;
    let mut nfound = 0i32;
    let mut allid: Option<i32> = None;
    let mut at_pageid = low / PAGE_BIT + at_pg1;

    while nfound < nalloc && low <= high_allid {
        let page = pgbuf.fix_read(Vpid::new(volid, at_pageid))?;
        let data = page.data();
        let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;

        while low <= high_allid && nfound < nalloc && low < page_first_id + PAGE_BIT {
            let byte = data[((low - page_first_id) / 8) as usize];
            if !bit_is_set(byte, (low % 8) as u32) && low != skip_id {
                if allid.is_none() {
                    allid = Some(low);
                }
                nfound += 1;

                // A single-sector request may demand that the sector can
                // actually supply the expected pages.
                if kind == AllocKind::Sector
                    && nalloc == 1
                    && nfound == 1
                    && exp_npages > 0
                    && allid.unwrap() > SECTOR_WITH_ALL_PAGES
                {
                    let (fpageid, lpageid) = vhdr.sector_page_range(allid.unwrap());
                    if !check_sector_has_npages(
                        pgbuf,
                        volid,
                        vhdr.page_alloctb_page1,
                        fpageid,
                        lpageid,
                        exp_npages,
                    )? {
                        nfound = 0;
                        allid = None;
                    }
                }
            } else {
                nfound = 0;
                allid = None;
            }
            low += 1;
        }
        drop(page);
        at_pageid += 1;
    }

    if nfound < nalloc {
        return Ok(None);
    }
    let allid = allid.expect("found a run");

    // Set the bits of the run, one bitmap page at a time. Logged by bits,
    // not bytes: neighboring bits belong to concurrent transactions, so
    // undo/redo must be a logical operation.
    let mut low = allid;
    let mut at_pageid = low / PAGE_BIT + at_pg1;
    while low < allid + nalloc {
        let mut page = pgbuf.fix_write(Vpid::new(volid, at_pageid))?;
        let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;
        let byte_offset = ((low - page_first_id) / 8) as i32;
        let start_bit = (low % 8) as u32;
        let mut num = 0i32;

        let data = page.data_mut();
        while low < allid + nalloc && low < page_first_id + PAGE_BIT {
            bit_set(&mut data[((low - page_first_id) / 8) as usize], (low % 8) as u32);
            num += 1;
            low += 1;
        }

        let recv = MtabBits { start_bit, num };
        log.append_undoredo(
            RecoveryVerb::IdAlloc,
            LogAddr::new(page.vpid(), byte_offset),
            LogData::Bits(recv),
            LogData::Bits(recv),
        );
        page.mark_dirty();
        drop(page);
        at_pageid += 1;
    }

    Ok(Some(allid))
}

/// Whether `[low, high]` of the page table holds `exp_npages` contiguous
/// free pages.
pub(crate) fn check_sector_has_npages(
    pgbuf: &PageBuf,
    volid: VolId,
    at_pg1: PageId,
    low_allid: i32,
    high_allid: i32,
    exp_npages: i32,
) -> Result<bool, StorageError> {
    let mut low = low_allid;
    let mut nfound = 0i32;
    let mut at_pageid = low / PAGE_BIT + at_pg1;

    while nfound < exp_npages && low <= high_allid {
        let page = pgbuf.fix_read(Vpid::new(volid, at_pageid))?;
        let data = page.data();
        let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;
        while low <= high_allid && nfound < exp_npages && low < page_first_id + PAGE_BIT {
            if !bit_is_set(data[((low - page_first_id) / 8) as usize], (low % 8) as u32) {
                nfound += 1;
            } else {
                nfound = 0;
            }
            low += 1;
        }
        drop(page);
        at_pageid += 1;
    }
    Ok(nfound >= exp_npages)
}

/// One contiguous run of allocated bits awaiting postponed deallocation.
pub(crate) struct DeallocRun {
    pub addr: LogAddr,
    pub start_bit: u32,
    pub num: i32,
}

/// Find the runs of currently allocated bits inside
/// `[deallid, deallid+ndealloc)`.
///
/// Nothing is cleared here: for each run of set bits one postpone payload
/// is produced; the caller logs it and queues it on the transaction, and
/// the bits are cleared when the transaction commits. Clear bits inside
/// the range are reported (somebody deallocated twice) and skipped.
/// Returns the number of ids found allocated alongside the runs.
pub(crate) fn id_dealloc_runs(
    pgbuf: &PageBuf,
    volid: VolId,
    at_pg1: PageId,
    deallid: i32,
    ndealloc: i32,
    kind: AllocKind,
) -> Result<(i32, Vec<DeallocRun>), StorageError> {
    let mut runs = Vec::new();
    let mut nfound = 0i32;
    let mut id = deallid;
    let end = deallid + ndealloc;
    let mut at_pageid = id / PAGE_BIT + at_pg1;

    while id < end {
        let page = pgbuf.fix_write_with_retry(Vpid::new(volid, at_pageid))?;
        let data = page.data();
        let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;

        let mut run_start = id;
        let mut run_num = 0i32;
        while id < end && id < page_first_id + PAGE_BIT {
            if bit_is_set(data[((id - page_first_id) / 8) as usize], (id % 8) as u32) {
                if run_num == 0 {
                    run_start = id;
                }
                run_num += 1;
                nfound += 1;
            } else {
                match kind {
                    AllocKind::Sector => log::warn!("sector {} of volume {} is not allocated", id, volid),
                    AllocKind::Page => log::warn!("page {} of volume {} is not allocated", id, volid),
                }
                if run_num > 0 {
                    runs.push(DeallocRun {
                        addr: LogAddr::new(
                            page.vpid(),
                            (run_start - page_first_id) / 8,
                        ),
                        start_bit: (run_start % 8) as u32,
                        num: run_num,
                    });
                    run_num = 0;
                }
            }
            id += 1;
        }
        if run_num > 0 {
            runs.push(DeallocRun {
                addr: LogAddr::new(page.vpid(), (run_start - page_first_id) / 8),
                start_bit: (run_start % 8) as u32,
                num: run_num,
            });
        }
        drop(page);
        at_pageid += 1;
    }

    Ok((nfound, runs))
}

/// Longest run of free bits in `[low, high]`, capped at `nunits_quit`.
pub(crate) fn id_get_max_contiguous(
    pgbuf: &PageBuf,
    volid: VolId,
    at_pg1: PageId,
    low_allid: i32,
    high_allid: i32,
    nunits_quit: i32,
) -> Result<i32, StorageError> {
    let mut best = 0i32;
    let mut nfound = 0i32;
    let mut low = low_allid;
    let mut at_pageid = low / PAGE_BIT + at_pg1;

    while nfound < nunits_quit && low <= high_allid {
        let page = pgbuf.fix_read(Vpid::new(volid, at_pageid))?;
        let data = page.data();
        let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;
        while low <= high_allid && nfound < nunits_quit && low < page_first_id + PAGE_BIT {
            if !bit_is_set(data[((low - page_first_id) / 8) as usize], (low % 8) as u32) {
                nfound += 1;
            } else {
                best = best.max(nfound);
                nfound = 0;
            }
            low += 1;
        }
        drop(page);
        at_pageid += 1;
    }

    Ok(best.max(nfound))
}

/// Count the free bits in `[low, high]`. Used by the consistency check.
pub(crate) fn id_count_free(
    pgbuf: &PageBuf,
    volid: VolId,
    at_pg1: PageId,
    low_allid: i32,
    high_allid: i32,
) -> Result<i32, StorageError> {
    let mut count = 0i32;
    let mut low = low_allid;
    let mut at_pageid = low / PAGE_BIT + at_pg1;

    while low <= high_allid {
        let page = pgbuf.fix_read(Vpid::new(volid, at_pageid))?;
        let data = page.data();
        let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;
        while low <= high_allid && low < page_first_id + PAGE_BIT {
            if !bit_is_set(data[((low - page_first_id) / 8) as usize], (low % 8) as u32) {
                count += 1;
            }
            low += 1;
        }
        drop(page);
        at_pageid += 1;
    }
    Ok(count)
}

/// Whether `allid` is marked allocated.
pub(crate) fn id_isvalid(
    pgbuf: &PageBuf,
    volid: VolId,
    at_pg1: PageId,
    allid: i32,
) -> DiskIsValid {
    let at_pageid = allid / PAGE_BIT + at_pg1;
    match pgbuf.fix_read(Vpid::new(volid, at_pageid)) {
        Ok(page) => {
            let page_first_id = (at_pageid - at_pg1) * PAGE_BIT;
            let byte = page.data()[((allid - page_first_id) / 8) as usize];
            if bit_is_set(byte, (allid % 8) as u32) {
                DiskIsValid::Valid
            } else {
                DiskIsValid::Invalid
            }
        }
        Err(_) => DiskIsValid::Error,
    }
}

/// Initialize the allocation-table pages `[at_fpageid, at_lpageid]`: zero
/// them and pre-set the first `nalloc_bits` bits (the system pages). Pages
/// of temporary volumes are stamped with the temporary LSA and the redo is
/// skipped; everything else gets an `InitMap` redo. Undo is not needed:
/// rolling back volume creation removes the whole volume.
pub(crate) fn map_init(
    pgbuf: &PageBuf,
    log: &dyn LogManager,
    volid: VolId,
    at_fpageid: PageId,
    at_lpageid: PageId,
    mut nalloc_bits: i32,
    purpose: Purpose,
) -> Result<(), StorageError> {
    for at_pageid in at_fpageid..=at_lpageid {
        let mut page = pgbuf.fix_write(Vpid::new(volid, at_pageid))?;
        page.zero();
        if purpose.is_temporary() {
            page.set_lsa_as_temporary();
        }

        let mut set_here = 0i32;
        let data = page.data_mut();
        let mut i = 0usize;
        while nalloc_bits > 0 && i < data.len() {
            let mut bit = 0u32;
            while nalloc_bits > 0 && bit < 8 {
                bit_set(&mut data[i], bit);
                bit += 1;
                nalloc_bits -= 1;
                set_here += 1;
            }
            i += 1;
        }

        if !purpose.is_temporary() {
            log.append_redo(
                RecoveryVerb::InitMap,
                Some(LogAddr::new(page.vpid(), 0)),
                LogData::Bits(MtabBits {
                    start_bit: 0,
                    num: set_here,
                }),
            );
        }
        page.mark_dirty();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_ops() {
        let mut b = 0u8;
        bit_set(&mut b, 0);
        bit_set(&mut b, 7);
        assert_eq!(b, 0x81);
        assert!(bit_is_set(b, 0));
        assert!(bit_is_set(b, 7));
        assert!(!bit_is_set(b, 3));
        bit_clear(&mut b, 0);
        assert_eq!(b, 0x80);
    }
}
