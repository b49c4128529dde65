//! Process-wide cache of volumes, their purposes, and free-space hints.
//!
//! The cache routes allocations without touching volume headers. Per-volume
//! hints and per-purpose aggregates are maintained by the allocator after
//! it releases the header latch, so readers may observe stale values; every
//! decision that needs an authoritative answer re-checks the volume itself.
//! Structure changes (mount, dismount, refresh) take the writer side of the
//! section; probes take the reader side.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::RwLock;

use crate::types::{Purpose, VolId, NULL_VOLID};

/// Number of cached purposes: DATA, INDEX, GENERIC, PERM_TEMP, TEMP_TEMP.
const NPURPOSES: usize = 5;

fn purpose_slot(purpose: Purpose) -> Option<usize> {
    match purpose {
        Purpose::PermData => Some(0),
        Purpose::PermIndex => Some(1),
        Purpose::PermGeneric => Some(2),
        Purpose::PermTemp => Some(3),
        Purpose::TempTemp => Some(4),
        _ => None,
    }
}

/// One cached volume: its id and the free-page hint.
pub struct VolHint {
    pub volid: VolId,
    hint_free_pages: AtomicI32,
}

impl VolHint {
    pub fn hint_free_pages(&self) -> i32 {
        self.hint_free_pages.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PurposeAgg {
    nvols: AtomicI32,
    total_pages: AtomicI32,
    free_pages: AtomicI32,
}

struct CacheVols {
    /// Volumes ordered by purpose partition (DATA, INDEX, GENERIC,
    /// PERM_TEMP, TEMP_TEMP), then by volume id.
    vols: Vec<(Purpose, VolHint)>,
}

/// A snapshot entry handed to the router's probe.
#[derive(Clone, Copy, Debug)]
pub struct VolSnapshot {
    pub volid: VolId,
    pub hint_free_pages: i32,
}

/// The process-wide free-space cache.
pub struct DiskCache {
    vols: RwLock<CacheVols>,
    purpose: [PurposeAgg; NPURPOSES],
    auto_extend_volid: AtomicI32,
    need_add_generic: AtomicBool,
    /// GENERIC shortage threshold, in pages. Zero disables the check.
    prealloc_pages: i32,
}

impl DiskCache {
    pub fn new(prealloc_pages: i32) -> Self {
        Self {
            vols: RwLock::new(CacheVols { vols: Vec::new() }),
            purpose: Default::default(),
            auto_extend_volid: AtomicI32::new(NULL_VOLID as i32),
            need_add_generic: AtomicBool::new(false),
            prealloc_pages,
        }
    }

    /// Rebuild the cache atomically from the given volumes.
    pub fn refresh(&self, mut entries: Vec<(VolId, Purpose, i32, i32)>) {
        // (volid, purpose, total_pages, free_pages)
        entries.sort_by_key(|(volid, purpose, _, _)| (purpose_slot(*purpose), *volid));
        let mut vols = self.vols.write().unwrap();
        vols.vols.clear();
        for agg in &self.purpose {
            agg.nvols.store(0, Ordering::Relaxed);
            agg.total_pages.store(0, Ordering::Relaxed);
            agg.free_pages.store(0, Ordering::Relaxed);
        }
        for (volid, purpose, total, free) in entries {
            let Some(slot) = purpose_slot(purpose) else {
                continue;
            };
            vols.vols.push((
                purpose,
                VolHint {
                    volid,
                    hint_free_pages: AtomicI32::new(free),
                },
            ));
            let agg = &self.purpose[slot];
            agg.nvols.fetch_add(1, Ordering::Relaxed);
            agg.total_pages.fetch_add(total, Ordering::Relaxed);
            agg.free_pages.fetch_add(free, Ordering::Relaxed);
        }
    }

    /// Register one new volume without rebuilding the rest.
    pub fn register(&self, volid: VolId, purpose: Purpose, total_pages: i32, free_pages: i32) {
        let Some(slot) = purpose_slot(purpose) else {
            return;
        };
        let mut vols = self.vols.write().unwrap();
        let pos = vols
            .vols
            .iter()
            .position(|(p, h)| {
                (purpose_slot(*p), h.volid) > (Some(slot), volid)
            })
            .unwrap_or(vols.vols.len());
        vols.vols.insert(
            pos,
            (
                purpose,
                VolHint {
                    volid,
                    hint_free_pages: AtomicI32::new(free_pages),
                },
            ),
        );
        let agg = &self.purpose[slot];
        agg.nvols.fetch_add(1, Ordering::Relaxed);
        agg.total_pages.fetch_add(total_pages, Ordering::Relaxed);
        agg.free_pages.fetch_add(free_pages, Ordering::Relaxed);
    }

    /// Drop every cached volume.
    pub fn decache(&self) {
        self.refresh(Vec::new());
        self.auto_extend_volid
            .store(NULL_VOLID as i32, Ordering::Relaxed);
        self.need_add_generic.store(false, Ordering::Relaxed);
    }

    /// Apply a free-page delta for one volume.
    ///
    /// The caller has just released the volume's header latch; the hint is
    /// adjusted with atomics and clamped at zero (it is only a hint — the
    /// header stays authoritative). Returns true when the GENERIC aggregate
    /// has sunk below the prealloc threshold and a volume should be added
    /// or grown.
    pub fn update(
        &self,
        volid: VolId,
        purpose: Purpose,
        nfree_pages_toadd: i32,
        do_update_total: bool,
    ) -> bool {
        let Some(slot) = purpose_slot(purpose) else {
            return false;
        };
        let check_auto_ext = nfree_pages_toadd < 0
            && self.prealloc_pages > 0
            && matches!(
                purpose,
                Purpose::PermData | Purpose::PermIndex | Purpose::PermGeneric
            );

        let vols = self.vols.read().unwrap();
        for (p, hint) in vols.vols.iter() {
            if *p == purpose && hint.volid == volid {
                let old = hint
                    .hint_free_pages
                    .fetch_add(nfree_pages_toadd, Ordering::Relaxed);
                if old + nfree_pages_toadd < 0 {
                    log::warn!(
                        "free-page hint of volume {} went negative; clamping",
                        volid
                    );
                    hint.hint_free_pages.store(0, Ordering::Relaxed);
                }
            }
        }

        let agg = &self.purpose[slot];
        if do_update_total {
            agg.total_pages.fetch_add(nfree_pages_toadd, Ordering::Relaxed);
        }
        let old = agg.free_pages.fetch_add(nfree_pages_toadd, Ordering::Relaxed);
        if old + nfree_pages_toadd < 0 {
            log::warn!(
                "aggregate free pages of {:?} went negative; clamping",
                purpose
            );
            agg.free_pages.store(0, Ordering::Relaxed);
        }

        let mut need_add = false;
        if check_auto_ext {
            let generic: i32 = vols
                .vols
                .iter()
                .filter(|(p, _)| *p == Purpose::PermGeneric)
                .map(|(_, h)| h.hint_free_pages())
                .sum();
            if generic < self.prealloc_pages {
                need_add = true;
                self.need_add_generic.store(true, Ordering::Relaxed);
            }
        }
        need_add
    }

    /// Consume the pending generic-shortage signal.
    pub fn take_need_add_generic(&self) -> bool {
        self.need_add_generic.swap(false, Ordering::Relaxed)
    }

    pub fn need_add_generic(&self) -> bool {
        self.need_add_generic.load(Ordering::Relaxed)
    }

    /// Snapshot one purpose partition for probing.
    pub fn snapshot(&self, purpose: Purpose) -> Vec<VolSnapshot> {
        let vols = self.vols.read().unwrap();
        vols.vols
            .iter()
            .filter(|(p, _)| *p == purpose)
            .map(|(_, h)| VolSnapshot {
                volid: h.volid,
                hint_free_pages: h.hint_free_pages(),
            })
            .collect()
    }

    /// Write a refreshed hint for one volume.
    pub fn set_hint(&self, volid: VolId, purpose: Purpose, free_pages: i32) {
        let vols = self.vols.read().unwrap();
        for (p, hint) in vols.vols.iter() {
            if *p == purpose && hint.volid == volid {
                hint.hint_free_pages.store(free_pages, Ordering::Relaxed);
            }
        }
    }

    pub fn nvols(&self, purpose: Purpose) -> i32 {
        purpose_slot(purpose)
            .map(|s| self.purpose[s].nvols.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_pages(&self, purpose: Purpose) -> i32 {
        purpose_slot(purpose)
            .map(|s| self.purpose[s].total_pages.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn free_pages(&self, purpose: Purpose) -> i32 {
        purpose_slot(purpose)
            .map(|s| self.purpose[s].free_pages.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// The one GENERIC volume currently allowed to grow.
    pub fn auto_extend_volid(&self) -> Option<VolId> {
        let v = self.auto_extend_volid.load(Ordering::Relaxed);
        if v == NULL_VOLID as i32 {
            None
        } else {
            Some(v as VolId)
        }
    }

    pub fn set_auto_extend_volid(&self, volid: Option<VolId>) {
        self.auto_extend_volid.store(
            volid.map(|v| v as i32).unwrap_or(NULL_VOLID as i32),
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_two_generics() -> DiskCache {
        let cache = DiskCache::new(64);
        cache.refresh(vec![
            (0, Purpose::PermData, 1000, 800),
            (1, Purpose::PermGeneric, 1000, 100),
            (2, Purpose::PermGeneric, 1000, 30),
        ]);
        cache
    }

    #[test]
    fn aggregates_follow_refresh() {
        let cache = cache_with_two_generics();
        assert_eq!(cache.nvols(Purpose::PermGeneric), 2);
        assert_eq!(cache.free_pages(Purpose::PermGeneric), 130);
        assert_eq!(cache.total_pages(Purpose::PermGeneric), 2000);
        assert_eq!(cache.free_pages(Purpose::PermData), 800);
    }

    #[test]
    fn update_moves_hint_and_aggregate() {
        let cache = cache_with_two_generics();
        cache.update(1, Purpose::PermGeneric, -40, false);
        assert_eq!(cache.free_pages(Purpose::PermGeneric), 90);
        let snap = cache.snapshot(Purpose::PermGeneric);
        assert_eq!(snap[0].hint_free_pages, 60);
    }

    #[test]
    fn generic_shortage_raises_flag() {
        let cache = cache_with_two_generics();
        // 130 - 80 = 50 < 64 threshold.
        let need = cache.update(1, Purpose::PermGeneric, -80, false);
        assert!(need);
        assert!(cache.take_need_add_generic());
        assert!(!cache.take_need_add_generic());
    }

    #[test]
    fn negative_hint_clamps_to_zero() {
        let cache = cache_with_two_generics();
        cache.update(2, Purpose::PermGeneric, -500, false);
        let snap = cache.snapshot(Purpose::PermGeneric);
        assert_eq!(snap[1].hint_free_pages, 0);
    }

    #[test]
    fn auto_extend_volid_roundtrip() {
        let cache = DiskCache::new(0);
        assert_eq!(cache.auto_extend_volid(), None);
        cache.set_auto_extend_volid(Some(3));
        assert_eq!(cache.auto_extend_volid(), Some(3));
        cache.set_auto_extend_volid(None);
        assert_eq!(cache.auto_extend_volid(), None);
    }
}
