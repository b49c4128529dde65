//! The volume manager: on-disk volume layout, sector and page allocation,
//! deferred deallocation, expansion, and recovery replay.
//!
//! Every mutating operation runs under an exclusive latch on the volume
//! header page; the header is the single serialization point for the
//! volume-wide counters. Bitmap pages are latched while the header latch
//! is held, never the other way around. Log records are appended before
//! the header latch is released.

pub mod bitmap;
pub mod header;

use std::path::Path;
use std::sync::Arc;

use crate::cache::DiskCache;
use crate::error::StorageError;
use crate::pgbuf::PageBuf;
use crate::types::{
    DiskIsValid, Lsa, PageId, PageType, Purpose, SectId, SysParams, VolId, Vpid, DB_PAGESIZE,
    HINT_START_SECT, NULL_PAGEID, SECTOR_NPAGES, SECTOR_WITH_ALL_PAGES, VOLHEADER_PAGE,
};
use crate::wal::{
    AllocKind, LogAddr, LogData, LogManager, MtabBitsWith, RecoveryVerb, Txn,
};

use header::{read_fullname, write_fullname, VolHeader, VOLHEADER_SIZE};

/// Longest path accepted for a volume file.
const MAX_PATH_LENGTH: usize = 4096;

/// Growth step for temporary volume expansion.
const EXPAND_TMPVOL_INCREMENTS: i32 = 1000;

fn ceil_div(a: i32, b: i32) -> i32 {
    (a + b - 1) / b
}

/// Inputs of the format operation.
#[derive(Clone, Debug)]
pub struct FormatArgs<'a> {
    pub volid: VolId,
    pub fullname: &'a Path,
    pub purpose: Purpose,
    pub max_npages: i32,
    pub extend_npages: i32,
    /// Optional cap on the initial fill rate, in KiB per second.
    pub max_writesize_in_sec: Option<u32>,
}

/// Outcome of a page allocation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageAlloc {
    /// First page of the allocated contiguous run.
    Pages(PageId),
    /// The sector has no such run, but the volume as a whole holds enough
    /// free pages; the caller may retry with another sector.
    NotInSector,
    /// The volume cannot satisfy the request at all.
    NoSpace,
}

/// Space accounting of one volume.
#[derive(Clone, Copy, Debug)]
pub struct VolSpaceInfo {
    pub purpose: Purpose,
    pub total_pages: i32,
    pub free_pages: i32,
    pub max_npages: i32,
    pub used_data_npages: i32,
    pub used_index_npages: i32,
    pub used_temp_npages: i32,
}

pub struct VolumeManager {
    pgbuf: Arc<PageBuf>,
    cache: Arc<DiskCache>,
    log: Arc<dyn LogManager>,
    params: SysParams,
    db_creation: i64,
}

impl VolumeManager {
    pub fn new(
        pgbuf: Arc<PageBuf>,
        cache: Arc<DiskCache>,
        log: Arc<dyn LogManager>,
        params: SysParams,
        db_creation: i64,
    ) -> Self {
        Self {
            pgbuf,
            cache,
            log,
            params,
            db_creation,
        }
    }

    pub fn pgbuf(&self) -> &Arc<PageBuf> {
        &self.pgbuf
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    pub fn params(&self) -> &SysParams {
        &self.params
    }

    // -----------------------------------------------------------------
    // Format / mount
    // -----------------------------------------------------------------

    /// Create and initialize a new volume.
    ///
    /// The volume file is created at `extend_npages` pages (`max_npages`
    /// for TEMP_TEMP volumes, which are pre-sized), the header is written
    /// under exclusive latch, and both allocation tables are initialized
    /// with the system pages pre-allocated. Permanent volumes log an
    /// out-of-data-page redo so that crash recovery recreates the file;
    /// temporary volumes are stamped with the temporary LSA and emit no
    /// log at all.
    pub fn format(&self, args: &FormatArgs<'_>) -> Result<VolId, StorageError> {
        let volid = args.volid;
        let fullname = args.fullname.to_string_lossy().into_owned();

        if matches!(args.purpose, Purpose::EitherTemp | Purpose::Unknown) {
            return Err(StorageError::FormatBadParams {
                volid,
                reason: "unknown storage purpose",
            });
        }
        if args.purpose != Purpose::PermGeneric && args.max_npages != args.extend_npages {
            return Err(StorageError::FormatBadParams {
                volid,
                reason: "only generic volumes may be formatted below max size",
            });
        }
        if args.extend_npages <= 0 || args.max_npages < args.extend_npages {
            return Err(StorageError::FormatBadParams {
                volid,
                reason: "bad page counts",
            });
        }
        if fullname.len() + 1 > MAX_PATH_LENGTH
            || VOLHEADER_SIZE + fullname.len() + 1 > DB_PAGESIZE
        {
            return Err(StorageError::FormatBadParams {
                volid,
                reason: "volume path is too long",
            });
        }

        // The undo is logical: rolling back volume creation removes the
        // file. It must be on stable storage before the file exists.
        self.log
            .append_undo(RecoveryVerb::Format, None, LogData::Path(fullname.clone()));
        self.log.flush();

        let file_npages = if args.purpose == Purpose::TempTemp {
            args.max_npages
        } else {
            args.extend_npages
        };
        self.pgbuf.mount_new(
            volid,
            args.fullname,
            file_npages as usize,
            args.max_writesize_in_sec,
        )?;

        let result = self.format_header_and_maps(args, &fullname);
        match result {
            Ok(()) => Ok(volid),
            Err(e) => {
                let _ = self.pgbuf.invalidate_all(volid);
                let _ = self.pgbuf.dismount_and_destroy(volid);
                Err(e)
            }
        }
    }

    fn format_header_and_maps(
        &self,
        args: &FormatArgs<'_>,
        fullname: &str,
    ) -> Result<(), StorageError> {
        let volid = args.volid;
        let mut page = self
            .pgbuf
            .fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        page.zero();

        let mut hdr = VolHeader::init(
            volid,
            args.purpose,
            args.extend_npages,
            args.max_npages,
            self.db_creation,
            Lsa::NULL,
        );

        if hdr.sys_lastpage >= args.extend_npages {
            return Err(StorageError::FormatBadParams {
                volid,
                reason: "volume too small for its system pages",
            });
        }

        hdr.free_pages = hdr.total_pages - hdr.sys_lastpage - 1;
        hdr.free_sects = hdr.total_sects - ceil_div(hdr.sys_lastpage + 1, SECTOR_NPAGES);

        // Start the sector hint a little away from the volume top so that
        // special-sector allocations find pages close to the system area.
        // The skipped sectors are used once the hint wraps.
        hdr.hint_allocsect = if args.purpose != Purpose::TempTemp
            && hdr.total_sects > HINT_START_SECT
            && (hdr.total_sects - hdr.free_sects) < HINT_START_SECT
        {
            HINT_START_SECT
        } else {
            hdr.total_sects - 1
        };

        let data = page.data_mut();
        *VolHeader::view_mut(data) = hdr;
        write_fullname(data, fullname);
        VolHeader::view_mut(data).seal();

        let header_blob = Self::header_blob(data);
        if args.purpose != Purpose::TempTemp {
            // In a crash before commit, the recovery pass must be able to
            // recreate the OS file before any header redo applies.
            self.log
                .append_dboutside_redo(RecoveryVerb::NewVol, LogData::HeaderBlob(header_blob.clone()));
            self.log.append_redo(
                RecoveryVerb::Format,
                Some(LogAddr::new(page.vpid(), 0)),
                LogData::HeaderBlob(header_blob.clone()),
            );
        }

        let hdr = *VolHeader::view(page.data());
        bitmap::map_init(
            &self.pgbuf,
            self.log.as_ref(),
            volid,
            hdr.sect_alloctb_page1,
            hdr.sect_alloctb_page1 + hdr.sect_alloctb_npages - 1,
            hdr.total_sects - hdr.free_sects,
            args.purpose,
        )?;
        bitmap::map_init(
            &self.pgbuf,
            self.log.as_ref(),
            volid,
            hdr.page_alloctb_page1,
            hdr.page_alloctb_page1 + hdr.page_alloctb_npages - 1,
            hdr.sys_lastpage + 1,
            args.purpose,
        )?;

        if args.purpose != Purpose::TempTemp
            && volid > 0
            && self.pgbuf.is_mounted(volid - 1)
        {
            self.set_link(volid - 1, volid)?;
        }

        if args.purpose != Purpose::TempTemp {
            // The header page is logged once more so that the redo carries
            // the final state, volume link included.
            self.log.append_redo(
                RecoveryVerb::Format,
                Some(LogAddr::new(page.vpid(), 0)),
                LogData::HeaderBlob(Self::header_blob(page.data())),
            );
        }

        if args.purpose.is_temporary() {
            page.set_lsa_as_temporary();
        }
        VolHeader::view(page.data()).verify()?;
        page.mark_dirty();

        if args.purpose.is_temporary() {
            // Stamp every system page so that no changes to this volume
            // are ever logged.
            let sys_lastpage = hdr.sys_lastpage;
            drop(page);
            for pageid in (VOLHEADER_PAGE + 1)..=sys_lastpage {
                let mut sys_page = self.pgbuf.fix_write(Vpid::new(volid, pageid))?;
                sys_page.set_lsa_as_temporary();
                sys_page.mark_dirty();
            }
        } else {
            drop(page);
        }

        self.pgbuf.flush_all(volid)?;
        Ok(())
    }

    fn header_blob(data: &[u8]) -> Vec<u8> {
        let hdr = VolHeader::view(data);
        data[..VOLHEADER_SIZE + hdr.fullname_len as usize].to_vec()
    }

    /// Mount an existing volume file and verify its header.
    pub fn mount(&self, volid: VolId, path: &Path) -> Result<(), StorageError> {
        self.pgbuf.mount(volid, path)?;
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = VolHeader::view(page.data());
        if !hdr.checksum_ok() {
            return Err(StorageError::BadVolumeHeader(volid));
        }
        hdr.verify()
    }

    pub fn dismount(&self, volid: VolId) -> Result<(), StorageError> {
        self.pgbuf.dismount(volid)
    }

    /// Destroy a volume: dismount it and remove its file.
    pub fn unformat(&self, volid: VolId) -> Result<(), StorageError> {
        self.pgbuf.dismount_and_destroy(volid)
    }

    // -----------------------------------------------------------------
    // Sector allocation
    // -----------------------------------------------------------------

    /// Allocate `nsects` contiguous sectors.
    ///
    /// Returns the special sector when the volume is too depleted for a
    /// regular sector, when no contiguous run exists, or when the header
    /// cannot be latched: the special sector may take pages from any free
    /// range and so always remains usable. With `exp_npages > 0` a
    /// single-sector request only accepts sectors whose page range holds
    /// that many contiguous free pages.
    pub fn alloc_sector(
        &self,
        volid: VolId,
        nsects: i32,
        exp_npages: i32,
    ) -> Result<SectId, StorageError> {
        let Ok(mut page) = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE)) else {
            return Ok(SECTOR_WITH_ALL_PAGES);
        };
        let hdr = *VolHeader::view(page.data());
        debug_assert!(hdr.verify().is_ok());

        if hdr.free_sects < nsects || hdr.free_pages < hdr.sect_npgs {
            return Ok(SECTOR_WITH_ALL_PAGES);
        }

        let mut alloc_sect = bitmap::id_alloc(
            &self.pgbuf,
            self.log.as_ref(),
            volid,
            &hdr,
            nsects,
            hdr.hint_allocsect,
            hdr.total_sects - 1,
            AllocKind::Sector,
            exp_npages,
            NULL_PAGEID,
        )?;
        if alloc_sect.is_none() {
            alloc_sect = bitmap::id_alloc(
                &self.pgbuf,
                self.log.as_ref(),
                volid,
                &hdr,
                nsects,
                1,
                hdr.hint_allocsect - 1,
                AllocKind::Sector,
                exp_npages,
                NULL_PAGEID,
            )?;
        }

        let Some(alloc_sect) = alloc_sect else {
            return Ok(SECTOR_WITH_ALL_PAGES);
        };

        let vpid = page.vpid();
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.hint_allocsect = if alloc_sect + nsects >= vhdr.total_sects {
            1
        } else {
            alloc_sect + nsects
        };
        vhdr.free_sects -= nsects;

        // The hint is not logged: it is repaired by use. free_sects is
        // modified concurrently by other transactions, so undo/redo is a
        // logical delta, not a byte image.
        self.log.append_undoredo(
            RecoveryVerb::VhdrScalloc,
            LogAddr::new(vpid, 0),
            LogData::Sects(nsects),
            LogData::Sects(-nsects),
        );
        vhdr.seal();
        debug_assert!(vhdr.verify().is_ok());
        page.mark_dirty();

        Ok(alloc_sect)
    }

    // -----------------------------------------------------------------
    // Page allocation
    // -----------------------------------------------------------------

    /// Allocate `npages` contiguous pages inside the given sector, as
    /// close to `near_pageid` as possible.
    ///
    /// The special sector searches the whole non-system page range. The
    /// near page itself is skipped even if its bit reads free, to avoid
    /// re-allocation collisions after an allocation-set mismatch.
    pub fn alloc_page(
        &self,
        volid: VolId,
        mut sectid: SectId,
        npages: i32,
        near_pageid: PageId,
        page_type: PageType,
    ) -> Result<PageAlloc, StorageError> {
        debug_assert!(npages > 0);
        let mut page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        debug_assert!(hdr.verify().is_ok());
        let purpose = hdr.purpose();

        if !(0..=hdr.total_sects).contains(&sectid) {
            log::warn!(
                "unknown sector {} on volume {}; assuming the special sector",
                sectid,
                volid
            );
            sectid = SECTOR_WITH_ALL_PAGES;
        }

        // Not enough pages in this volume: let the caller pick another
        // volume or add one, then retry.
        if hdr.free_pages < npages {
            return Ok(PageAlloc::NoSpace);
        }

        let (fpageid, lpageid) = if sectid == SECTOR_WITH_ALL_PAGES {
            (hdr.sys_lastpage + 1, hdr.total_pages - 1)
        } else {
            hdr.sector_page_range(sectid)
        };

        let skip_pageid = near_pageid;
        let mut near_pageid = near_pageid;
        if sectid == SECTOR_WITH_ALL_PAGES && near_pageid == NULL_PAGEID {
            near_pageid = HINT_START_SECT * SECTOR_NPAGES;
            // Without a better estimate, assume allocated pages sit at the
            // front of the volume.
            if near_pageid < hdr.total_pages - hdr.free_pages {
                near_pageid = hdr.total_pages - hdr.free_pages - 1;
            }
        }
        if near_pageid == NULL_PAGEID
            || near_pageid < fpageid
            || near_pageid + npages > lpageid
        {
            near_pageid = fpageid;
        }

        let mut new_pageid = bitmap::id_alloc(
            &self.pgbuf,
            self.log.as_ref(),
            volid,
            &hdr,
            npages,
            near_pageid,
            lpageid,
            AllocKind::Page,
            -1,
            skip_pageid,
        )?;

        if new_pageid.is_none() && near_pageid != fpageid {
            // Second leg from the sector start, this time including the
            // near page in the range.
            let lpageid = near_pageid + npages - 2;
            new_pageid = bitmap::id_alloc(
                &self.pgbuf,
                self.log.as_ref(),
                volid,
                &hdr,
                npages,
                fpageid,
                lpageid,
                AllocKind::Page,
                -1,
                NULL_PAGEID,
            )?;
        }

        let Some(new_pageid) = new_pageid else {
            return Ok(if sectid == SECTOR_WITH_ALL_PAGES {
                PageAlloc::NoSpace
            } else {
                PageAlloc::NotInSector
            });
        };

        let vpid = page.vpid();
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.free_pages -= npages;
        match purpose {
            Purpose::PermGeneric => match page_type {
                PageType::Data => vhdr.used_data_npages += npages,
                PageType::Index => vhdr.used_index_npages += npages,
                _ => debug_assert!(false, "generic allocation without a page type"),
            },
            Purpose::PermData => {
                debug_assert_eq!(page_type, PageType::Data);
                vhdr.used_data_npages += npages;
            }
            Purpose::PermIndex => {
                debug_assert_eq!(page_type, PageType::Index);
                vhdr.used_index_npages += npages;
            }
            _ => {}
        }

        if sectid == SECTOR_WITH_ALL_PAGES
            && vhdr.hint_allocsect >= new_pageid / vhdr.sect_npgs
            && vhdr.hint_allocsect <= (new_pageid + npages) / vhdr.sect_npgs
        {
            // The special sector stole pages from the hinted sector; steer
            // the hint past it.
            vhdr.hint_allocsect = (new_pageid + npages) / vhdr.sect_npgs + 1;
            if vhdr.hint_allocsect > vhdr.total_sects {
                vhdr.hint_allocsect = 1;
            }
        }

        let undo = MtabBitsWith {
            start_bit: 0,
            num: npages,
            kind: AllocKind::Page,
            ptype: page_type,
        };
        let redo = MtabBitsWith {
            num: -npages,
            ..undo
        };
        self.log.append_undoredo(
            RecoveryVerb::VhdrPgalloc,
            LogAddr::new(vpid, 0),
            LogData::BitsWith(undo),
            LogData::BitsWith(redo),
        );
        vhdr.seal();
        debug_assert!(vhdr.verify().is_ok());
        page.mark_dirty();
        drop(page);

        // The cache is only touched after the header is unlatched; its
        // counters are hints and never block allocation.
        self.cache.update(volid, purpose, -npages, false);

        Ok(PageAlloc::Pages(new_pageid))
    }

    // -----------------------------------------------------------------
    // Deallocation (postponed to transaction end)
    // -----------------------------------------------------------------

    /// Deallocate `npages` contiguous pages starting at `pageid`.
    ///
    /// Nothing is freed now: one postpone record per contiguous allocated
    /// run is logged and queued on the transaction, and the bitmap and
    /// header are updated together when the transaction commits. A rolled
    /// back transaction therefore never has its pages visible as free.
    pub fn dealloc_page(
        &self,
        txn: &mut Txn,
        volid: VolId,
        pageid: PageId,
        npages: i32,
        page_type: PageType,
    ) -> Result<(), StorageError> {
        let page = self
            .pgbuf
            .fix_write_with_retry(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        debug_assert!(hdr.verify().is_ok());

        if pageid <= hdr.sys_lastpage && pageid >= VOLHEADER_PAGE {
            return Err(StorageError::SystemPage { volid, pageid });
        }
        if pageid < VOLHEADER_PAGE || pageid >= hdr.total_pages {
            return Err(StorageError::UnknownPage { volid, pageid });
        }

        let (nfound, runs) = bitmap::id_dealloc_runs(
            &self.pgbuf,
            volid,
            hdr.page_alloctb_page1,
            pageid,
            npages,
            AllocKind::Page,
        )?;
        for run in runs {
            let bits = MtabBitsWith {
                start_bit: run.start_bit,
                num: run.num,
                kind: AllocKind::Page,
                ptype: page_type,
            };
            let lsa = self.log.append_postpone(
                RecoveryVerb::IdDeallocWithVolheader,
                run.addr,
                LogData::BitsWith(bits),
            );
            txn.add_postponed(run.addr, bits, lsa);
        }

        if nfound > 0 {
            Ok(())
        } else {
            Err(StorageError::UnknownPage { volid, pageid })
        }
    }

    /// Deallocate `nsects` contiguous sectors starting at `sectid`.
    ///
    /// The pages of these sectors are not deallocated automatically; they
    /// may have been stolen by the special sector. The special sector
    /// itself is never deallocated.
    pub fn dealloc_sector(
        &self,
        txn: &mut Txn,
        volid: VolId,
        mut sectid: SectId,
        mut nsects: i32,
    ) -> Result<(), StorageError> {
        if sectid == SECTOR_WITH_ALL_PAGES {
            if nsects > 1 {
                sectid += 1;
                nsects -= 1;
            } else {
                return Ok(());
            }
        }

        let page = self
            .pgbuf
            .fix_write_with_retry(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        debug_assert!(hdr.verify().is_ok());

        while sectid < 0 && nsects > 0 {
            log::warn!("unknown sector {} on volume {}", sectid, volid);
            sectid += 1;
            nsects -= 1;
        }
        if sectid + nsects > hdr.total_sects {
            nsects = hdr.total_sects - sectid;
        }
        if nsects <= 0 {
            return Err(StorageError::UnknownSector { volid, sectid });
        }

        let (nfound, runs) = bitmap::id_dealloc_runs(
            &self.pgbuf,
            volid,
            hdr.sect_alloctb_page1,
            sectid,
            nsects,
            AllocKind::Sector,
        )?;
        for run in runs {
            let bits = MtabBitsWith {
                start_bit: run.start_bit,
                num: run.num,
                kind: AllocKind::Sector,
                ptype: PageType::Unknown,
            };
            let lsa = self.log.append_postpone(
                RecoveryVerb::IdDeallocWithVolheader,
                run.addr,
                LogData::BitsWith(bits),
            );
            txn.add_postponed(run.addr, bits, lsa);
        }

        if nfound > 0 {
            Ok(())
        } else {
            Err(StorageError::UnknownSector { volid, sectid })
        }
    }

    /// Commit a transaction: replay its postponed deallocations. Each one
    /// is applied as a single atomic update of the bitmap and the header.
    pub fn commit(&self, txn: &mut Txn) -> Result<(), StorageError> {
        for p in txn.take_postponed() {
            self.rv_alloctable_with_volheader(p.addr, p.bits, Some(p.ref_lsa))?;
        }
        Ok(())
    }

    /// Abort a transaction: its postponed deallocations are dropped, so
    /// the pages stay allocated. Undoing the transaction's allocations is
    /// the log manager's job, through the logged undo records.
    pub fn abort(&self, txn: &mut Txn) {
        let dropped = txn.take_postponed();
        if !dropped.is_empty() {
            log::debug!("dropping {} postponed deallocations on abort", dropped.len());
        }
    }

    // -----------------------------------------------------------------
    // Expansion
    // -----------------------------------------------------------------

    /// Grow a TEMP_TEMP volume by at least `min_pages`, at most
    /// `max_pages`, bounded by what the pre-sized allocation tables can
    /// cover. Returns the number of pages added.
    pub fn expand_tmp(
        &self,
        volid: VolId,
        min_pages: i32,
        mut max_pages: i32,
    ) -> Result<i32, StorageError> {
        if min_pages < EXPAND_TMPVOL_INCREMENTS && max_pages > EXPAND_TMPVOL_INCREMENTS {
            max_pages = EXPAND_TMPVOL_INCREMENTS;
        }

        let mut page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        debug_assert!(hdr.verify().is_ok());

        if hdr.purpose() != Purpose::TempTemp {
            return Err(StorageError::CannotExpandPermVols {
                volid,
                purpose: hdr.purpose,
            });
        }

        let mut npages_toadd =
            (hdr.sys_lastpage - hdr.page_alloctb_page1 + 1) * crate::types::PAGE_BIT
                - hdr.total_pages;
        if npages_toadd < min_pages {
            return Err(StorageError::UnableToExpand {
                volid,
                npages: min_pages,
            });
        }
        if npages_toadd > max_pages {
            npages_toadd = max_pages;
        }

        let file_npages = self.pgbuf.npages(volid)? as i32;
        if hdr.total_pages + npages_toadd > file_npages {
            self.pgbuf
                .extend(volid, (hdr.total_pages + npages_toadd - file_npages) as usize)?;
        }

        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.total_pages += npages_toadd;
        vhdr.free_pages += npages_toadd;

        // Cover the new pages with sectors, but never grow the sector
        // table past its own pages.
        let mut nsects_toadd = ceil_div(vhdr.total_pages, SECTOR_NPAGES);
        if nsects_toadd <= vhdr.sect_alloctb_npages * crate::types::PAGE_BIT {
            nsects_toadd -= vhdr.total_sects;
        } else {
            nsects_toadd = vhdr.sect_alloctb_npages * crate::types::PAGE_BIT - vhdr.total_sects;
        }
        vhdr.total_sects += nsects_toadd;
        vhdr.free_sects += nsects_toadd;

        vhdr.seal();
        debug_assert!(vhdr.verify().is_ok());
        page.mark_dirty();
        drop(page);

        self.cache
            .update(volid, Purpose::TempTemp, npages_toadd, true);
        Ok(npages_toadd)
    }

    /// Grow a GENERIC volume by `npages`, capped at its `max_npages`.
    ///
    /// The header latch is released while the file grows; the counters
    /// are applied after re-latching. When the volume reaches its maximum
    /// the auto-extend registration is cleared so the router creates a
    /// fresh GENERIC volume on the next shortage.
    pub fn expand_perm(&self, volid: VolId, mut npages: i32) -> Result<i32, StorageError> {
        let page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        debug_assert!(hdr.verify().is_ok());

        if hdr.purpose() != Purpose::PermGeneric {
            return Err(StorageError::CannotExpandPermVols {
                volid,
                purpose: hdr.purpose,
            });
        }
        if hdr.max_npages - hdr.total_pages < npages {
            npages = hdr.max_npages - hdr.total_pages;
        }
        if npages <= 0 {
            return Ok(0);
        }
        let log_data = crate::wal::InitPagesInfo {
            volid,
            start_pageid: hdr.total_pages,
            npages,
        };
        drop(page);

        self.pgbuf.extend(volid, npages as usize)?;
        self.log
            .append_dboutside_redo(RecoveryVerb::InitPages, LogData::InitPages(log_data));

        let mut page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.total_pages += npages;
        vhdr.free_pages += npages;

        let mut nsects_toadd = ceil_div(vhdr.total_pages, SECTOR_NPAGES);
        if nsects_toadd <= vhdr.sect_alloctb_npages * crate::types::PAGE_BIT {
            nsects_toadd -= vhdr.total_sects;
        } else {
            nsects_toadd = vhdr.sect_alloctb_npages * crate::types::PAGE_BIT - vhdr.total_sects;
        }
        vhdr.total_sects += nsects_toadd;
        vhdr.free_sects += nsects_toadd;
        vhdr.seal();
        debug_assert!(vhdr.verify().is_ok());

        let save_total = vhdr.total_pages;
        let save_max = vhdr.max_npages;
        self.log.append_redo(
            RecoveryVerb::Format,
            Some(LogAddr::new(page.vpid(), 0)),
            LogData::HeaderBlob(Self::header_blob(page.data())),
        );
        page.mark_dirty();
        drop(page);

        self.cache.update(volid, Purpose::PermGeneric, npages, true);
        if save_total >= save_max {
            self.cache.set_auto_extend_volid(None);
        }
        Ok(npages)
    }

    /// Reinitialize every mounted temporary volume: all their pages and
    /// sectors become deallocated again. Run at restart.
    pub fn reinit_all_tmp(&self) -> Result<(), StorageError> {
        for volid in self.pgbuf.mounted_volids() {
            self.reinit(volid)?;
        }
        Ok(())
    }

    fn reinit(&self, volid: VolId) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        if !hdr.purpose().is_temporary() {
            return Ok(());
        }
        let purpose = hdr.purpose();

        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.free_pages = vhdr.total_pages - vhdr.sys_lastpage - 1;
        vhdr.free_sects = vhdr.total_sects - ceil_div(vhdr.sys_lastpage + 1, SECTOR_NPAGES);
        vhdr.hint_allocsect = if vhdr.total_sects > HINT_START_SECT {
            HINT_START_SECT
        } else {
            vhdr.total_sects - 1
        };
        vhdr.used_data_npages = 0;
        vhdr.used_index_npages = 0;
        vhdr.seal();
        let hdr = *vhdr;
        page.mark_dirty();

        bitmap::map_init(
            &self.pgbuf,
            self.log.as_ref(),
            volid,
            hdr.sect_alloctb_page1,
            hdr.sect_alloctb_page1 + hdr.sect_alloctb_npages - 1,
            hdr.total_sects - hdr.free_sects,
            purpose,
        )?;
        bitmap::map_init(
            &self.pgbuf,
            self.log.as_ref(),
            volid,
            hdr.page_alloctb_page1,
            hdr.page_alloctb_page1 + hdr.page_alloctb_npages - 1,
            hdr.sys_lastpage + 1,
            purpose,
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Lookup operations
    // -----------------------------------------------------------------

    /// Whether `pageid` is allocated on `volid`.
    pub fn isvalid_page(&self, volid: VolId, pageid: PageId) -> DiskIsValid {
        if pageid < 0 || !self.pgbuf.is_mounted(volid) {
            return DiskIsValid::Invalid;
        }
        if pageid == VOLHEADER_PAGE {
            return DiskIsValid::Valid;
        }
        let Ok(page) = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE)) else {
            return DiskIsValid::Error;
        };
        let hdr = VolHeader::view(page.data());
        if pageid <= hdr.sys_lastpage {
            DiskIsValid::Valid
        } else if pageid > hdr.total_pages {
            DiskIsValid::Invalid
        } else {
            bitmap::id_isvalid(&self.pgbuf, volid, hdr.page_alloctb_page1, pageid)
        }
    }

    /// The longest run of contiguous free pages, capped at `max_npages`.
    /// An approximation: the header latch is not kept, so another
    /// transaction may take from the run afterwards.
    pub fn max_contiguous_pages(&self, volid: VolId, max_npages: i32) -> Result<i32, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        let cap = max_npages.min(hdr.free_pages);
        if cap <= 0 {
            return Ok(0);
        }
        bitmap::id_get_max_contiguous(
            &self.pgbuf,
            volid,
            hdr.page_alloctb_page1,
            hdr.sys_lastpage + 1,
            hdr.total_pages - 1,
            cap,
        )
    }

    /// Whether the volume can supply `exp_npages` contiguously; also
    /// returns the authoritative free-page count for hint refresh.
    pub fn hint_contiguous_free_npages(
        &self,
        volid: VolId,
        exp_npages: i32,
    ) -> Result<(bool, i32), StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        if hdr.free_pages < exp_npages {
            return Ok((false, hdr.free_pages));
        }
        if exp_npages <= 1 {
            return Ok((true, hdr.free_pages));
        }
        drop(page);
        let run = self.max_contiguous_pages(volid, exp_npages)?;
        Ok((run >= exp_npages, hdr.free_pages))
    }

    /// Purpose plus the space accounting of a volume.
    pub fn purpose_and_space_info(&self, volid: VolId) -> Result<VolSpaceInfo, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = VolHeader::view(page.data());
        let purpose = hdr.purpose();
        Ok(VolSpaceInfo {
            purpose,
            total_pages: hdr.total_pages,
            free_pages: hdr.free_pages,
            max_npages: hdr.max_npages,
            used_data_npages: hdr.used_data_npages,
            used_index_npages: hdr.used_index_npages,
            used_temp_npages: if purpose.is_temporary() {
                hdr.total_pages - hdr.free_pages
            } else {
                0
            },
        })
    }

    pub fn purpose(&self, volid: VolId) -> Result<Purpose, StorageError> {
        Ok(self.purpose_and_space_info(volid)?.purpose)
    }

    pub fn purpose_and_sys_lastpage(
        &self,
        volid: VolId,
    ) -> Result<(Purpose, PageId), StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = VolHeader::view(page.data());
        Ok((hdr.purpose(), hdr.sys_lastpage))
    }

    pub fn total_pages(&self, volid: VolId) -> Result<i32, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        Ok(VolHeader::view(page.data()).total_pages)
    }

    pub fn total_sects(&self, volid: VolId) -> Result<i32, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        Ok(VolHeader::view(page.data()).total_sects)
    }

    /// A copy of the volume header, for diagnostics and tests.
    pub fn header_snapshot(&self, volid: VolId) -> Result<VolHeader, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        Ok(*VolHeader::view(page.data()))
    }

    pub fn fullname(&self, volid: VolId) -> Result<String, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        Ok(read_fullname(page.data()))
    }

    /// Link `volid` to its successor volume.
    pub fn set_link(&self, volid: VolId, next_volid: VolId) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let vhdr = VolHeader::view_mut(page.data_mut());
        let prev = vhdr.next_volid;
        self.log.append_undoredo(
            RecoveryVerb::LinkPermVolext,
            LogAddr::new(page.vpid(), 0),
            LogData::VolId(prev),
            LogData::VolId(next_volid),
        );
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.next_volid = next_volid;
        vhdr.seal();
        page.mark_dirty();
        Ok(())
    }

    pub fn get_link(&self, volid: VolId) -> Result<VolId, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        Ok(VolHeader::view(page.data()).next_volid)
    }

    /// Reset the recovery checkpoint of a volume. Dirty pages are not
    /// forced; the caller guarantees pages below the checkpoint are
    /// already on disk.
    pub fn set_checkpoint(&self, volid: VolId, chkpt_lsa: Lsa) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write(Vpid::new(volid, VOLHEADER_PAGE))?;
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.chkpt_lsa = chkpt_lsa;
        vhdr.seal();
        page.mark_dirty();
        Ok(())
    }

    pub fn get_checkpoint(&self, volid: VolId) -> Result<Lsa, StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        Ok(VolHeader::view(page.data()).chkpt_lsa)
    }

    /// Consistency check: the header counters must match a recount of the
    /// allocation tables, and every sizing invariant must hold.
    pub fn check(&self, volid: VolId) -> Result<(), StorageError> {
        let page = self.pgbuf.fix_read(Vpid::new(volid, VOLHEADER_PAGE))?;
        let hdr = *VolHeader::view(page.data());
        drop(page);
        hdr.verify()?;

        let nfree_pages = bitmap::id_count_free(
            &self.pgbuf,
            volid,
            hdr.page_alloctb_page1,
            hdr.sys_lastpage + 1,
            hdr.total_pages - 1,
        )?;
        if nfree_pages != hdr.free_pages {
            log::error!(
                "volume {}: header says {} free pages, bitmap says {}",
                volid,
                hdr.free_pages,
                nfree_pages
            );
            return Err(StorageError::BadVolumeHeader(volid));
        }

        let nfree_sects = bitmap::id_count_free(
            &self.pgbuf,
            volid,
            hdr.sect_alloctb_page1,
            1,
            hdr.total_sects - 1,
        )?;
        if nfree_sects != hdr.free_sects {
            log::error!(
                "volume {}: header says {} free sectors, bitmap says {}",
                volid,
                hdr.free_sects,
                nfree_sects
            );
            return Err(StorageError::BadVolumeHeader(volid));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cache maintenance
    // -----------------------------------------------------------------

    /// Rebuild the free-space cache from every mounted volume.
    pub fn refresh_cache(&self) -> Result<(), StorageError> {
        let mut entries = Vec::new();
        for volid in self.pgbuf.mounted_volids() {
            let info = self.purpose_and_space_info(volid)?;
            entries.push((volid, info.purpose, info.total_pages, info.free_pages));
        }
        self.cache.refresh(entries);
        Ok(())
    }

    /// Register one newly formatted volume in the cache.
    pub fn register_in_cache(&self, volid: VolId) -> Result<(), StorageError> {
        let info = self.purpose_and_space_info(volid)?;
        self.cache
            .register(volid, info.purpose, info.total_pages, info.free_pages);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Recovery replay
    // -----------------------------------------------------------------

    /// Replay a bit-range set (`IdAlloc` redo, or undo of a clear).
    pub fn rv_set_alloctable(
        &self,
        addr: LogAddr,
        bits: crate::wal::MtabBits,
    ) -> Result<(), StorageError> {
        self.rv_alloctable(addr, bits.start_bit, bits.num, true)
    }

    /// Replay a bit-range clear (`IdAlloc` undo, or redo of a dealloc).
    pub fn rv_clear_alloctable(
        &self,
        addr: LogAddr,
        bits: crate::wal::MtabBits,
    ) -> Result<(), StorageError> {
        self.rv_alloctable(addr, bits.start_bit, bits.num, false)
    }

    fn rv_alloctable(
        &self,
        addr: LogAddr,
        start_bit: u32,
        num: i32,
        set: bool,
    ) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write_with_retry(addr.vpid)?;
        let data = page.data_mut();
        Self::apply_bits(data, addr.offset, start_bit, num, set);
        page.mark_dirty();
        Ok(())
    }

    fn apply_bits(data: &mut [u8], byte_offset: i32, start_bit: u32, num: i32, set: bool) {
        let mut applied = 0;
        let mut bit = start_bit;
        let mut byte = byte_offset as usize;
        while applied < num {
            while bit < 8 && applied < num {
                if set {
                    bitmap::bit_set(&mut data[byte], bit);
                } else {
                    bitmap::bit_clear(&mut data[byte], bit);
                }
                bit += 1;
                applied += 1;
            }
            bit = 0;
            byte += 1;
        }
    }

    /// Replay a sector-count delta on the header (`VhdrScalloc`).
    pub fn rv_vhdr_scalloc(&self, volid: VolId, delta: i32) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write_with_retry(Vpid::new(volid, VOLHEADER_PAGE))?;
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.free_sects += delta;
        vhdr.seal();
        page.mark_dirty();
        Ok(())
    }

    /// Replay a page-count delta on the header (`VhdrPgalloc`): the signed
    /// `num` is added to `free_pages` and subtracted from the used counter
    /// selected by the volume purpose and the page type.
    pub fn rv_vhdr_pgalloc(&self, volid: VolId, bits: MtabBitsWith) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write_with_retry(Vpid::new(volid, VOLHEADER_PAGE))?;
        let vhdr = VolHeader::view_mut(page.data_mut());
        Self::apply_vhdr_delta(vhdr, bits.num, bits.kind, bits.ptype);
        vhdr.seal();
        page.mark_dirty();
        Ok(())
    }

    fn apply_vhdr_delta(vhdr: &mut VolHeader, delta: i32, kind: AllocKind, ptype: PageType) {
        match kind {
            AllocKind::Sector => vhdr.free_sects += delta,
            AllocKind::Page => {
                vhdr.free_pages += delta;
                let used = match (vhdr.purpose(), ptype) {
                    (Purpose::PermData, PageType::Data) => Some(&mut vhdr.used_data_npages),
                    (Purpose::PermIndex, PageType::Index) => Some(&mut vhdr.used_index_npages),
                    (Purpose::PermGeneric, PageType::Data) => Some(&mut vhdr.used_data_npages),
                    (Purpose::PermGeneric, PageType::Index) => Some(&mut vhdr.used_index_npages),
                    _ => None,
                };
                if let Some(used) = used {
                    *used -= delta;
                    if *used < 0 {
                        *used = 0;
                    }
                }
            }
        }
    }

    /// Replay a postponed deallocation: clear the bit range and apply the
    /// header deltas as one atomic step.
    ///
    /// The bitmap latch the caller may conceptually hold is dropped and
    /// both pages are re-fixed header first, avoiding the cross-page
    /// deadlock between a header-holder wanting the bitmap and a
    /// bitmap-holder wanting the header. Bit clearing is idempotent, so a
    /// double replay leaves the bitmap unchanged.
    pub fn rv_alloctable_with_volheader(
        &self,
        addr: LogAddr,
        bits: MtabBitsWith,
        ref_lsa: Option<Lsa>,
    ) -> Result<(), StorageError> {
        let volid = addr.vpid.volid;
        let hdr_vpid = Vpid::new(volid, VOLHEADER_PAGE);

        let mut hdr_page = self
            .pgbuf
            .fix_write_with_retry(hdr_vpid)
            .map_err(|_| StorageError::MayNeedMediaRecovery { volid })?;
        let mut bm_page = self
            .pgbuf
            .fix_write_with_retry(addr.vpid)
            .map_err(|_| StorageError::MayNeedMediaRecovery { volid })?;

        Self::apply_bits(bm_page.data_mut(), addr.offset, bits.start_bit, bits.num, false);
        bm_page.mark_dirty();

        let vhdr = VolHeader::view_mut(hdr_page.data_mut());
        Self::apply_vhdr_delta(vhdr, bits.num, bits.kind, bits.ptype);
        vhdr.seal();
        let purpose = vhdr.purpose();
        hdr_page.mark_dirty();

        if let Some(ref_lsa) = ref_lsa {
            // The pair keeps the volume header and the bitmap page
            // synchronized during a crash between the two writes.
            self.log.append_run_postpone(
                RecoveryVerb::IdDeallocBitmapOnly,
                addr,
                LogData::BitsWith(bits),
                ref_lsa,
            );
            self.log.append_run_postpone(
                RecoveryVerb::IdDeallocVhdrOnly,
                LogAddr::new(hdr_vpid, 0),
                LogData::BitsWith(bits),
                ref_lsa,
            );
        }

        drop(bm_page);
        drop(hdr_page);

        if bits.kind == AllocKind::Page {
            self.cache.update(volid, purpose, bits.num, false);
        }
        Ok(())
    }

    /// Redo of `Format`: copy the logged header image back into page 0.
    pub fn rv_redo_format(&self, volid: VolId, blob: &[u8]) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write_with_retry(Vpid::new(volid, VOLHEADER_PAGE))?;
        page.data_mut()[..blob.len()].copy_from_slice(blob);
        page.mark_dirty();
        Ok(())
    }

    /// Undo of `Format`: the volume never committed, remove its file.
    pub fn rv_undo_format(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(volid) = self
            .pgbuf
            .mounted_volids()
            .into_iter()
            .find(|v| self.fullname(*v).map(|f| Path::new(&f) == path).unwrap_or(false))
        {
            return self.pgbuf.dismount_and_destroy(volid);
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::FormatIo(e)),
        }
    }

    /// Redo of `NewVol`: recreate the volume file from the logged header.
    pub fn rv_redo_newvol(&self, blob: &[u8]) -> Result<(), StorageError> {
        let hdr: VolHeader = bytemuck::pod_read_unaligned(&blob[..VOLHEADER_SIZE]);
        if self.pgbuf.is_mounted(hdr.volid) {
            return Ok(());
        }
        let fullname = String::from_utf8_lossy(
            &blob[VOLHEADER_SIZE..VOLHEADER_SIZE + hdr.fullname_len as usize],
        )
        .into_owned();
        self.pgbuf
            .mount_new(hdr.volid, Path::new(&fullname), hdr.total_pages as usize, None)?;
        self.rv_redo_format(hdr.volid, blob)
    }

    /// Redo of `InitMap`: a fresh bitmap page with its system bits.
    pub fn rv_redo_init_map(&self, addr: LogAddr, nalloc_bits: i32) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write_with_retry(addr.vpid)?;
        page.zero();
        Self::apply_bits(page.data_mut(), 0, 0, nalloc_bits, true);
        page.mark_dirty();
        Ok(())
    }

    /// Redo of `InitPages`: make sure the file covers the logged range.
    pub fn rv_redo_init_pages(
        &self,
        info: crate::wal::InitPagesInfo,
    ) -> Result<(), StorageError> {
        let have = self.pgbuf.npages(info.volid)? as i32;
        let need = info.start_pageid + info.npages;
        if have < need {
            self.pgbuf.extend(info.volid, (need - have) as usize)?;
        }
        Ok(())
    }

    /// Redo of `LinkPermVolext`.
    pub fn rv_redo_link(&self, volid: VolId, next_volid: VolId) -> Result<(), StorageError> {
        let mut page = self.pgbuf.fix_write_with_retry(Vpid::new(volid, VOLHEADER_PAGE))?;
        let vhdr = VolHeader::view_mut(page.data_mut());
        vhdr.next_volid = next_volid;
        vhdr.seal();
        page.mark_dirty();
        Ok(())
    }
}
