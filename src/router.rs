//! The allocation-cache router: picks a target volume for an allocation
//! request by purpose, and drives volume auto-extension when space runs
//! low.

use std::sync::Arc;

use crate::cache::{DiskCache, VolSnapshot};
use crate::error::StorageError;
use crate::types::{Purpose, SetPageMode, SysParams, VolId, SECTOR_NPAGES};
use crate::volume::{header::set_alloctables, VolumeManager};

/// Minimum useful free-page count of a volume picked for span-volumes
/// allocations; smaller remainders are left for files already there.
const MIN_USEFUL_SPANVOL_PAGES: i32 = SECTOR_NPAGES * 10;

/// Boot-level hook that creates and registers a brand-new volume. Volume
/// naming and cataloging belong to the boot manager, so the router only
/// states the purpose and the minimum size it needs.
pub trait VolumeExtender: Send + Sync {
    fn add_volume(
        &self,
        mgr: &VolumeManager,
        purpose: Purpose,
        npages: i32,
    ) -> Result<VolId, StorageError>;
}

/// System pages a brand-new volume of `npages` would spend on its header
/// and allocation tables.
pub fn overhead_npages_for_newvol(npages: i32) -> i32 {
    let tables = set_alloctables(npages);
    tables.sys_lastpage + 1
}

pub struct Router {
    mgr: Arc<VolumeManager>,
    cache: Arc<DiskCache>,
    extender: Box<dyn VolumeExtender>,
    params: SysParams,
}

struct Probe {
    best_volid: Option<VolId>,
    best_numpages: i32,
    found_contiguous: bool,
}

impl Router {
    pub fn new(
        mgr: Arc<VolumeManager>,
        extender: Box<dyn VolumeExtender>,
    ) -> Self {
        let cache = mgr.cache().clone();
        let params = mgr.params().clone();
        Self {
            mgr,
            cache,
            extender,
            params,
        }
    }

    pub fn manager(&self) -> &Arc<VolumeManager> {
        &self.mgr
    }

    /// Find a volume that can take `exp_npages` for the given purpose,
    /// creating or extending a volume if none qualifies. The hint volume
    /// is preferred for temporary purposes; `undesirable_volid` is never
    /// picked. Retries once after an extension; failing that, reports
    /// that the database is out of pages.
    pub fn find_goodvol(
        &self,
        hint_volid: VolId,
        mut undesirable_volid: VolId,
        exp_npages: i32,
        mode: SetPageMode,
        purpose: Purpose,
    ) -> Result<VolId, StorageError> {
        let mut retried = false;
        loop {
            if let Some(volid) =
                self.find_from_cache(hint_volid, undesirable_volid, exp_npages, mode, purpose)?
            {
                return Ok(volid);
            }
            if retried {
                break;
            }
            match self.add_auto_volume_extension(exp_npages, purpose) {
                Some(volid) => {
                    if purpose == Purpose::PermGeneric {
                        if volid == undesirable_volid {
                            // The undesirable volume itself was grown.
                            undesirable_volid = crate::types::NULL_VOLID;
                        }
                        retried = true;
                        continue;
                    }
                    return Ok(volid);
                }
                None => break,
            }
        }
        Err(StorageError::NotEnoughPagesInDatabase(exp_npages))
    }

    fn find_from_cache(
        &self,
        hint_volid: VolId,
        undesirable_volid: VolId,
        exp_npages: i32,
        mode: SetPageMode,
        purpose: Purpose,
    ) -> Result<Option<VolId>, StorageError> {
        let mut probe = Probe {
            best_volid: None,
            best_numpages: -1,
            found_contiguous: true,
        };

        match purpose {
            Purpose::PermData => {
                if !self.probe_partition(&mut probe, Purpose::PermData, undesirable_volid, exp_npages)
                    && !self.probe_partition(
                        &mut probe,
                        Purpose::PermGeneric,
                        undesirable_volid,
                        exp_npages,
                    )
                {
                    probe.found_contiguous = false;
                }
            }
            Purpose::PermIndex => {
                if !self.probe_partition(&mut probe, Purpose::PermIndex, undesirable_volid, exp_npages)
                    && !self.probe_partition(
                        &mut probe,
                        Purpose::PermGeneric,
                        undesirable_volid,
                        exp_npages,
                    )
                {
                    probe.found_contiguous = false;
                }
            }
            Purpose::TempTemp => {
                if let Some(v) = self.usable_temp_hint(hint_volid, exp_npages)? {
                    return Ok(Some(v));
                }
                if !self.probe_partition(&mut probe, Purpose::TempTemp, undesirable_volid, exp_npages)
                    && !self.probe_partition(
                        &mut probe,
                        Purpose::PermTemp,
                        undesirable_volid,
                        exp_npages,
                    )
                {
                    probe.found_contiguous = false;
                }
            }
            Purpose::PermTemp => {
                if let Some(v) = self.usable_temp_hint(hint_volid, exp_npages)? {
                    return Ok(Some(v));
                }
                if !self.probe_partition(&mut probe, Purpose::PermTemp, undesirable_volid, exp_npages)
                {
                    probe.found_contiguous = false;
                }
            }
            Purpose::EitherTemp => {
                if let Some(v) = self.usable_temp_hint(hint_volid, exp_npages)? {
                    return Ok(Some(v));
                }
                if !self.probe_partition(&mut probe, Purpose::PermTemp, undesirable_volid, exp_npages)
                    && !self.probe_partition(
                        &mut probe,
                        Purpose::TempTemp,
                        undesirable_volid,
                        exp_npages,
                    )
                {
                    probe.found_contiguous = false;
                }
            }
            Purpose::PermGeneric | Purpose::Unknown => {
                if !self.probe_partition(
                    &mut probe,
                    Purpose::PermGeneric,
                    undesirable_volid,
                    exp_npages,
                ) {
                    probe.found_contiguous = false;
                }
            }
        }

        if !probe.found_contiguous {
            match mode {
                SetPageMode::Contiguous => probe.best_volid = None,
                SetPageMode::NoncontiguousSameVol => {
                    if probe.best_numpages < exp_npages {
                        probe.best_volid = None;
                    }
                }
                SetPageMode::NoncontiguousSpanVols => {
                    // A near-empty remainder is left to the files already
                    // on the volume; a fresh volume serves better.
                    if probe.best_numpages < MIN_USEFUL_SPANVOL_PAGES {
                        probe.best_volid = None;
                    }
                }
            }
        }

        Ok(probe.best_volid)
    }

    /// A hinted temporary volume is taken as-is when it can supply the
    /// expected pages contiguously.
    fn usable_temp_hint(
        &self,
        hint_volid: VolId,
        exp_npages: i32,
    ) -> Result<Option<VolId>, StorageError> {
        if hint_volid == crate::types::NULL_VOLID {
            return Ok(None);
        }
        let Ok(purpose) = self.mgr.purpose(hint_volid) else {
            return Ok(None);
        };
        if !purpose.is_temporary() {
            return Ok(None);
        }
        let (has, _free) = self.mgr.hint_contiguous_free_npages(hint_volid, exp_npages)?;
        Ok(if has { Some(hint_volid) } else { None })
    }

    /// Probe one purpose partition of the cache. The best candidate is the
    /// volume with the most free pages that can also supply `exp_npages`
    /// contiguously (verified against the volume, not the hint); failing
    /// that, the one with the most free pages. Returns whether a
    /// contiguous-capable volume was found.
    fn probe_partition(
        &self,
        probe: &mut Probe,
        purpose: Purpose,
        undesirable_volid: VolId,
        exp_npages: i32,
    ) -> bool {
        let snapshot = self.cache.snapshot(purpose);
        let mut contiguous_best: Option<VolId> = None;

        for VolSnapshot {
            volid,
            hint_free_pages,
        } in snapshot
        {
            if volid == undesirable_volid {
                continue;
            }
            if hint_free_pages >= exp_npages && hint_free_pages > probe.best_numpages {
                let contiguous = if exp_npages <= 1 {
                    true
                } else {
                    match self.mgr.hint_contiguous_free_npages(volid, exp_npages) {
                        Ok((has, free)) => {
                            // Refresh the stale hint while we are here.
                            self.cache.set_hint(volid, purpose, free);
                            has
                        }
                        Err(_) => false,
                    }
                };
                if contiguous {
                    if contiguous_best.is_none() || hint_free_pages > probe.best_numpages {
                        probe.best_numpages = hint_free_pages;
                        probe.best_volid = Some(volid);
                        contiguous_best = Some(volid);
                    }
                } else if contiguous_best.is_none() && hint_free_pages > probe.best_numpages {
                    probe.best_numpages = hint_free_pages;
                    probe.best_volid = Some(volid);
                }
            } else if contiguous_best.is_none() && hint_free_pages > probe.best_numpages {
                probe.best_numpages = hint_free_pages;
                probe.best_volid = Some(volid);
            }
        }

        contiguous_best.is_some()
    }

    /// Create or grow a volume for the given purpose. Returns the volume
    /// that was added or extended, or `None` when nothing could be done
    /// (the caller then reports the database as out of pages).
    fn add_auto_volume_extension(&self, min_npages: i32, purpose: Purpose) -> Option<VolId> {
        let min_npages = min_npages.max(1);
        let max_npages = self.params.db_volume_pages().max(min_npages);
        let alloc_npages =
            (min_npages + overhead_npages_for_newvol(max_npages)).max(self.params.db_volume_pages());

        if matches!(purpose, Purpose::TempTemp | Purpose::EitherTemp) {
            return match self
                .extender
                .add_volume(&self.mgr, Purpose::TempTemp, alloc_npages)
            {
                Ok(volid) => Some(volid),
                Err(e) => {
                    log::warn!("adding a temporary volume failed: {e}");
                    None
                }
            };
        }

        // Permanent shortage is served by the one GENERIC volume allowed
        // to grow; once it is full, a new GENERIC volume takes over.
        if let Some(volid) = self.cache.auto_extend_volid() {
            match self
                .mgr
                .expand_perm(volid, self.params.db_volume_pages().max(min_npages))
            {
                Ok(grown) if grown >= min_npages => return Some(volid),
                Ok(_) => {}
                Err(e) => log::warn!("extending volume {volid} failed: {e}"),
            }
        }
        match self
            .extender
            .add_volume(&self.mgr, Purpose::PermGeneric, alloc_npages)
        {
            Ok(volid) => Some(volid),
            Err(e) => {
                log::warn!("adding a generic volume failed: {e}");
                None
            }
        }
    }

    /// Act on a pending GENERIC shortage signal raised by the allocator:
    /// issue one extension. Only one is in flight at a time; the lock is
    /// the header latch of the volume being grown.
    pub fn check_auto_extend(&self) -> bool {
        if !self.cache.take_need_add_generic() {
            return false;
        }
        self.add_auto_volume_extension(1, Purpose::PermGeneric).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgbuf::PageBuf;
    use crate::types::{PageType, NULL_PAGEID, NULL_VOLID};
    use crate::volume::{FormatArgs, PageAlloc};
    use crate::wal::MemoryLog;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI16, Ordering};

    struct DirExtender {
        dir: PathBuf,
        next_volid: AtomicI16,
        cap_npages: i32,
    }

    impl VolumeExtender for DirExtender {
        fn add_volume(
            &self,
            mgr: &VolumeManager,
            purpose: Purpose,
            npages: i32,
        ) -> Result<VolId, StorageError> {
            if npages > self.cap_npages {
                // The disk is "full".
                return Err(StorageError::NotEnoughPagesInDatabase(npages));
            }
            let volid = self.next_volid.fetch_add(1, Ordering::Relaxed);
            let path = self.dir.join(format!("vol{volid:04}"));
            mgr.format(&FormatArgs {
                volid,
                fullname: &path,
                purpose,
                max_npages: npages,
                extend_npages: npages,
                max_writesize_in_sec: None,
            })?;
            mgr.register_in_cache(volid)?;
            Ok(volid)
        }
    }

    fn setup(dir: &tempfile::TempDir, prealloc_pages: i32) -> Router {
        let mut params = SysParams::default();
        params.generic_vol_prealloc_bytes =
            prealloc_pages as u64 * crate::types::IO_PAGESIZE as u64;
        params.db_volume_bytes = 1024 * crate::types::IO_PAGESIZE as u64;
        let pgbuf = Arc::new(PageBuf::new(&params));
        let cache = Arc::new(DiskCache::new(prealloc_pages));
        let log = Arc::new(MemoryLog::new());
        let mgr = Arc::new(VolumeManager::new(pgbuf, cache, log, params, 20260801));
        Router::new(
            mgr,
            Box::new(DirExtender {
                dir: dir.path().to_path_buf(),
                next_volid: AtomicI16::new(0),
                cap_npages: 8192,
            }),
        )
    }

    fn format_and_cache(router: &Router, dir: &tempfile::TempDir, volid: VolId, purpose: Purpose) {
        let path = dir.path().join(format!("vol{volid:04}"));
        router
            .manager()
            .format(&FormatArgs {
                volid,
                fullname: &path,
                purpose,
                max_npages: 1024,
                extend_npages: 1024,
                max_writesize_in_sec: None,
            })
            .unwrap();
        router.manager().register_in_cache(volid).unwrap();
    }

    #[test]
    fn data_request_prefers_data_volume() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(&dir, 0);
        format_and_cache(&router, &dir, 2, Purpose::PermData);
        format_and_cache(&router, &dir, 3, Purpose::PermGeneric);

        let v = router
            .find_goodvol(
                NULL_VOLID,
                NULL_VOLID,
                8,
                SetPageMode::Contiguous,
                Purpose::PermData,
            )
            .unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn contiguity_probe_rejects_fragmented_data_volume() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(&dir, 0);
        format_and_cache(&router, &dir, 2, Purpose::PermData);
        format_and_cache(&router, &dir, 3, Purpose::PermGeneric);
        let mgr = router.manager();

        // Fill volume 2 so that no 64-page contiguous run remains, while
        // leaving plenty of scattered free pages in the cache hint.
        let hdr = mgr.header_snapshot(2).unwrap();
        let first_user = hdr.sys_lastpage + 1;
        for chunk_start in (first_user..hdr.total_pages - 1).step_by(40) {
            let npages = 30.min(hdr.total_pages - 1 - chunk_start);
            if npages <= 0 {
                break;
            }
            let got = mgr
                .alloc_page(
                    2,
                    crate::types::SECTOR_WITH_ALL_PAGES,
                    npages,
                    chunk_start,
                    PageType::Data,
                )
                .unwrap();
            assert!(matches!(got, PageAlloc::Pages(_)), "{got:?}");
        }
        assert!(mgr.max_contiguous_pages(2, 64).unwrap() < 64);
        mgr.refresh_cache().unwrap();

        // The data volume still advertises more free pages than needed,
        // but cannot serve 64 contiguously; the router must fall through
        // to the generic volume after probing.
        let v = router
            .find_goodvol(
                NULL_VOLID,
                NULL_VOLID,
                64,
                SetPageMode::Contiguous,
                Purpose::PermData,
            )
            .unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn out_of_space_reports_after_one_retry() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(&dir, 0);
        format_and_cache(&router, &dir, 0, Purpose::PermGeneric);

        // Ask for more pages than any volume (existing or auto-added) can
        // hold contiguously.
        let err = router
            .find_goodvol(
                NULL_VOLID,
                NULL_VOLID,
                1_000_000,
                SetPageMode::Contiguous,
                Purpose::PermGeneric,
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::NotEnoughPagesInDatabase(_)));
    }

    #[test]
    fn temp_request_creates_temp_volume_when_none_exists() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(&dir, 0);
        let v = router
            .find_goodvol(
                NULL_VOLID,
                NULL_VOLID,
                16,
                SetPageMode::Contiguous,
                Purpose::TempTemp,
            )
            .unwrap();
        assert_eq!(router.manager().purpose(v).unwrap(), Purpose::TempTemp);
    }

    #[test]
    fn temp_hint_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(&dir, 0);
        format_and_cache(&router, &dir, 0, Purpose::PermTemp);
        let v = router
            .find_goodvol(0, NULL_VOLID, 4, SetPageMode::Contiguous, Purpose::PermTemp)
            .unwrap();
        assert_eq!(v, 0);
    }

    #[test]
    fn generic_shortage_triggers_extension() {
        let dir = tempfile::tempdir().unwrap();
        // Threshold of 64 pages.
        let router = setup(&dir, 64);
        let mgr = router.manager().clone();
        let path = dir.path().join("gen");
        mgr.format(&FormatArgs {
            volid: 0,
            fullname: &path,
            purpose: Purpose::PermGeneric,
            max_npages: 1024,
            extend_npages: 128,
            max_writesize_in_sec: None,
        })
        .unwrap();
        mgr.register_in_cache(0).unwrap();
        mgr.cache().set_auto_extend_volid(Some(0));

        // 128 total, 3 system, so 125 free; one page below 125 keeps us
        // well under the 64-page threshold only after further allocation.
        let sect = mgr.alloc_sector(0, 1, 0).unwrap();
        let PageAlloc::Pages(_) = mgr
            .alloc_page(0, sect, SECTOR_NPAGES, NULL_PAGEID, PageType::Data)
            .unwrap()
        else {
            panic!();
        };
        // 115 free. Take 60 more through the special sector: 55 free,
        // below the threshold.
        let PageAlloc::Pages(_) = mgr
            .alloc_page(
                0,
                crate::types::SECTOR_WITH_ALL_PAGES,
                60,
                NULL_PAGEID,
                PageType::Data,
            )
            .unwrap()
        else {
            panic!();
        };

        assert!(mgr.cache().need_add_generic());
        let total_before = mgr.total_pages(0).unwrap();
        assert!(router.check_auto_extend());
        assert!(mgr.total_pages(0).unwrap() > total_before);
        assert!(!mgr.cache().need_add_generic());
    }
}
