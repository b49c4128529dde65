//! Page buffer over memory-mapped volume files.
//!
//! Every mounted volume is one OS file, mapped read-write. Pages are handed
//! out as latched guards: shared latches for readers, exclusive for
//! writers. The guard releases its latch on drop. Growing a volume extends
//! the file and, where the platform allows, grows the last map in place;
//! otherwise a fresh map is appended. Existing guards stay valid because
//! maps are never moved or unmapped while the volume is mounted.
//!
//! Latch protocol: the volume header page (page 0) is latched before any
//! bitmap page of the same volume, never the reverse.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use memmap2::{MmapOptions, MmapRaw};

use crate::error::StorageError;
use crate::types::{Lsa, PageId, SysParams, VolId, Vpid, DB_PAGESIZE, IO_PAGESIZE, PAGE_PROLOG_SIZE};

/// Chunk size for the paced zero-fill of new volumes.
const FORMAT_WRITE_CHUNK: usize = 64 * IO_PAGESIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Latch {
    Read,
    Write,
}

#[derive(Default)]
struct LatchState {
    readers: u32,
    writer: bool,
}

struct LatchTable {
    pages: Mutex<HashMap<PageId, LatchState>>,
    cond: Condvar,
}

impl LatchTable {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, pageid: PageId, mode: Latch, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pages = self.pages.lock().unwrap();
        loop {
            let state = pages.entry(pageid).or_default();
            let free = match mode {
                Latch::Read => !state.writer,
                Latch::Write => !state.writer && state.readers == 0,
            };
            if free {
                match mode {
                    Latch::Read => state.readers += 1,
                    Latch::Write => state.writer = true,
                }
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, res) = self.cond.wait_timeout(pages, deadline - now).unwrap();
            pages = guard;
            if res.timed_out() {
                // Reassess once more under the lock before giving up.
                let state = pages.entry(pageid).or_default();
                let free = match mode {
                    Latch::Read => !state.writer,
                    Latch::Write => !state.writer && state.readers == 0,
                };
                if free {
                    match mode {
                        Latch::Read => state.readers += 1,
                        Latch::Write => state.writer = true,
                    }
                    return true;
                }
                return false;
            }
        }
    }

    fn release(&self, pageid: PageId, mode: Latch) {
        let mut pages = self.pages.lock().unwrap();
        if let Some(state) = pages.get_mut(&pageid) {
            match mode {
                Latch::Read => state.readers -= 1,
                Latch::Write => state.writer = false,
            }
            if state.readers == 0 && !state.writer {
                pages.remove(&pageid);
            }
        }
        self.cond.notify_all();
    }
}

/// Backing storage of one mounted volume.
struct VolStorage {
    maps: Vec<MmapRaw>,
    file: File,
    npages: usize,
}

impl VolStorage {
    /// Raw pointer to the start of page `pageid`, if mapped.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid for `IO_PAGESIZE` bytes as long as the
    /// maps are alive. Maps are only dropped when the volume is dismounted,
    /// which the caller prevents by holding an `Arc` to the volume.
    unsafe fn page_ptr(&self, pageid: PageId) -> Option<*mut u8> {
        let want = pageid as usize * IO_PAGESIZE;
        let mut start = 0usize;
        for map in &self.maps {
            let end = start + map.len();
            if want < end {
                if want + IO_PAGESIZE > end {
                    return None;
                }
                return Some(map.as_mut_ptr().add(want - start));
            }
            start = end;
        }
        None
    }
}

/// One mounted volume file.
pub struct VolumeFile {
    volid: VolId,
    path: PathBuf,
    storage: Mutex<VolStorage>,
    latches: LatchTable,
    dirty: Mutex<BTreeSet<PageId>>,
}

impl VolumeFile {
    pub fn volid(&self) -> VolId {
        self.volid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn npages(&self) -> usize {
        self.storage.lock().unwrap().npages
    }

    fn flush(&self) -> Result<(), StorageError> {
        let storage = self.storage.lock().unwrap();
        for map in &storage.maps {
            map.flush().map_err(StorageError::Sync)?;
        }
        storage.file.sync_all().map_err(StorageError::Sync)?;
        drop(storage);
        self.dirty.lock().unwrap().clear();
        Ok(())
    }
}

/// The process-wide page buffer: a mount table plus the latch policy.
pub struct PageBuf {
    vols: RwLock<BTreeMap<VolId, Arc<VolumeFile>>>,
    latch_timeout: Duration,
    latch_retries: u32,
}

impl PageBuf {
    pub fn new(params: &SysParams) -> Self {
        Self {
            vols: RwLock::new(BTreeMap::new()),
            latch_timeout: params.latch_timeout,
            latch_retries: params.latch_retries,
        }
    }

    fn vol(&self, volid: VolId) -> Result<Arc<VolumeFile>, StorageError> {
        self.vols
            .read()
            .unwrap()
            .get(&volid)
            .cloned()
            .ok_or(StorageError::UnknownVolume(volid))
    }

    pub fn is_mounted(&self, volid: VolId) -> bool {
        self.vols.read().unwrap().contains_key(&volid)
    }

    /// All mounted volume ids, in id order.
    pub fn mounted_volids(&self) -> Vec<VolId> {
        self.vols.read().unwrap().keys().copied().collect()
    }

    /// Create a new volume file of `npages` pages and mount it.
    ///
    /// An optional write-rate cap (KiB per second) throttles the initial
    /// fill the same way a background formatter would.
    pub fn mount_new(
        &self,
        volid: VolId,
        path: &Path,
        npages: usize,
        write_rate_kb_sec: Option<u32>,
    ) -> Result<Arc<VolumeFile>, StorageError> {
        if self.is_mounted(volid) {
            return Err(StorageError::FormatBadParams {
                volid,
                reason: "volume id already mounted",
            });
        }
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(StorageError::FormatIo)?;
        let len = npages * IO_PAGESIZE;
        file.set_len(len as u64).map_err(StorageError::FormatIo)?;
        if let Some(rate) = write_rate_kb_sec {
            paced_zero_fill(&mut file, len, rate)?;
        }
        file.sync_all().map_err(StorageError::FormatIo)?;
        self.mount_prepared(volid, path, file, npages)
    }

    /// Mount an existing volume file.
    pub fn mount(&self, volid: VolId, path: &Path) -> Result<Arc<VolumeFile>, StorageError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(StorageError::Open)?;
        let len = file.metadata().map_err(StorageError::Open)?.len() as usize;
        if len == 0 || len % IO_PAGESIZE != 0 {
            return Err(StorageError::BadVolumeHeader(volid));
        }
        self.mount_prepared(volid, path, file, len / IO_PAGESIZE)
    }

    fn mount_prepared(
        &self,
        volid: VolId,
        path: &Path,
        file: File,
        npages: usize,
    ) -> Result<Arc<VolumeFile>, StorageError> {
        use fs4::fs_std::FileExt;

        if IO_PAGESIZE % page_size::get() != 0 {
            log::warn!(
                "system page size {} does not divide the I/O page size {}",
                page_size::get(),
                IO_PAGESIZE
            );
        }
        file.try_lock_exclusive().map_err(StorageError::Lock)?;

        let map = MmapOptions::new()
            .len(npages * IO_PAGESIZE)
            .map_raw(&file)
            .map_err(StorageError::Open)?;
        let vol = Arc::new(VolumeFile {
            volid,
            path: path.to_path_buf(),
            storage: Mutex::new(VolStorage {
                maps: vec![map],
                file,
                npages,
            }),
            latches: LatchTable::new(),
            dirty: Mutex::new(BTreeSet::new()),
        });
        self.vols.write().unwrap().insert(volid, vol.clone());
        Ok(vol)
    }

    /// Unmount a volume, keeping its file.
    pub fn dismount(&self, volid: VolId) -> Result<(), StorageError> {
        self.vols
            .write()
            .unwrap()
            .remove(&volid)
            .map(|_| ())
            .ok_or(StorageError::UnknownVolume(volid))
    }

    /// Unmount a volume and remove its file from the filesystem.
    pub fn dismount_and_destroy(&self, volid: VolId) -> Result<(), StorageError> {
        let vol = self
            .vols
            .write()
            .unwrap()
            .remove(&volid)
            .ok_or(StorageError::UnknownVolume(volid))?;
        let path = vol.path.clone();
        drop(vol);
        std::fs::remove_file(path).map_err(StorageError::FormatIo)
    }

    /// Grow a volume by `add_npages` pages. Returns the new page count.
    pub fn extend(&self, volid: VolId, add_npages: usize) -> Result<usize, StorageError> {
        let vol = self.vol(volid)?;
        let mut storage = vol.storage.lock().unwrap();
        let add_len = add_npages * IO_PAGESIZE;
        let current_len = storage.npages * IO_PAGESIZE;
        storage
            .file
            .set_len((current_len + add_len) as u64)
            .map_err(|e| StorageError::ResizeFailed {
                size: current_len,
                requested: current_len + add_len,
                source: e,
            })?;
        storage.file.sync_all().map_err(StorageError::Sync)?;

        // On Linux the last map can often grow in place, keeping the page
        // pointers of outstanding guards stable for free.
        #[cfg(target_os = "linux")]
        {
            use memmap2::RemapOptions;
            let map = storage.maps.last_mut().unwrap();
            let grown = map.len() + add_len;
            if unsafe { map.remap(grown, RemapOptions::new().may_move(false)) }.is_ok() {
                storage.npages += add_npages;
                return Ok(storage.npages);
            }
        }

        let map = MmapOptions::new()
            .offset(current_len as u64)
            .len(add_len)
            .map_raw(&storage.file)
            .map_err(StorageError::Open)?;
        storage.maps.push(map);
        storage.npages += add_npages;
        Ok(storage.npages)
    }

    /// Fix a page with a shared latch.
    pub fn fix_read(&self, vpid: Vpid) -> Result<PageReadGuard, StorageError> {
        let vol = self.vol(vpid.volid)?;
        let mem = self.page_ptr_checked(&vol, vpid)?;
        if !vol.latches.acquire(vpid.pageid, Latch::Read, self.latch_timeout) {
            return Err(StorageError::PageLatchTimedOut {
                volid: vpid.volid,
                pageid: vpid.pageid,
            });
        }
        Ok(PageReadGuard {
            vol,
            pageid: vpid.pageid,
            mem,
        })
    }

    /// Fix a page with an exclusive latch.
    pub fn fix_write(&self, vpid: Vpid) -> Result<PageWriteGuard, StorageError> {
        let vol = self.vol(vpid.volid)?;
        let mem = self.page_ptr_checked(&vol, vpid)?;
        if !vol.latches.acquire(vpid.pageid, Latch::Write, self.latch_timeout) {
            return Err(StorageError::PageLatchTimedOut {
                volid: vpid.volid,
                pageid: vpid.pageid,
            });
        }
        Ok(PageWriteGuard {
            vol,
            pageid: vpid.pageid,
            mem,
        })
    }

    /// Fix with an exclusive latch, retrying timed-out acquisitions up to
    /// the configured bound before aborting.
    pub fn fix_write_with_retry(&self, vpid: Vpid) -> Result<PageWriteGuard, StorageError> {
        let mut retry = 0;
        loop {
            match self.fix_write(vpid) {
                Err(StorageError::PageLatchTimedOut { .. }) => {
                    retry += 1;
                    if retry > self.latch_retries {
                        log::warn!(
                            "giving up write latch on {}|{} after {} retries",
                            vpid.volid,
                            vpid.pageid,
                            retry - 1
                        );
                        return Err(StorageError::PageLatchAborted {
                            volid: vpid.volid,
                            pageid: vpid.pageid,
                        });
                    }
                }
                other => return other,
            }
        }
    }

    fn page_ptr_checked(
        &self,
        vol: &Arc<VolumeFile>,
        vpid: Vpid,
    ) -> Result<*mut u8, StorageError> {
        if vpid.pageid < 0 {
            return Err(StorageError::UnknownPage {
                volid: vpid.volid,
                pageid: vpid.pageid,
            });
        }
        let storage = vol.storage.lock().unwrap();
        if (vpid.pageid as usize) >= storage.npages {
            return Err(StorageError::UnknownPage {
                volid: vpid.volid,
                pageid: vpid.pageid,
            });
        }
        // Safety: bounds checked above; the maps outlive the guard because
        // the guard holds an Arc to the volume.
        unsafe { storage.page_ptr(vpid.pageid) }.ok_or(StorageError::UnknownPage {
            volid: vpid.volid,
            pageid: vpid.pageid,
        })
    }

    /// Write all dirty state of a volume to disk.
    pub fn flush_all(&self, volid: VolId) -> Result<(), StorageError> {
        self.vol(volid)?.flush()
    }

    /// Discard dirty tracking for a volume without writing.
    pub fn invalidate_all(&self, volid: VolId) -> Result<(), StorageError> {
        self.vol(volid)?.dirty.lock().unwrap().clear();
        Ok(())
    }

    pub fn npages(&self, volid: VolId) -> Result<usize, StorageError> {
        Ok(self.vol(volid)?.npages())
    }
}

fn paced_zero_fill(file: &mut File, len: usize, rate_kb_sec: u32) -> Result<(), StorageError> {
    let zeros = vec![0u8; FORMAT_WRITE_CHUNK];
    let mut written = 0usize;
    let budget_per_sec = (rate_kb_sec as usize) * 1024;
    while written < len {
        let n = FORMAT_WRITE_CHUNK.min(len - written);
        file.write_all(&zeros[..n]).map_err(StorageError::FormatIo)?;
        written += n;
        if budget_per_sec > 0 {
            let secs = n as f64 / budget_per_sec as f64;
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
    }
    Ok(())
}

/// A page fixed with a shared latch. Unlatches on drop.
pub struct PageReadGuard {
    vol: Arc<VolumeFile>,
    pageid: PageId,
    mem: *mut u8,
}

impl std::fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard")
            .field("pageid", &self.pageid)
            .finish()
    }
}

/// A page fixed with an exclusive latch. Unlatches on drop.
pub struct PageWriteGuard {
    vol: Arc<VolumeFile>,
    pageid: PageId,
    mem: *mut u8,
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("pageid", &self.pageid)
            .finish()
    }
}

// The raw page pointer is only dereferenced while the latch is held, and
// latching serializes access across threads.
unsafe impl Send for PageReadGuard {}
unsafe impl Send for PageWriteGuard {}

impl PageReadGuard {
    pub fn vpid(&self) -> Vpid {
        Vpid::new(self.vol.volid, self.pageid)
    }

    pub fn lsa(&self) -> Lsa {
        // Safety: prolog bytes are within the page, latch held.
        unsafe { *(self.mem as *const Lsa) }
    }

    /// The page data area, past the recovery prolog.
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mem.add(PAGE_PROLOG_SIZE), DB_PAGESIZE) }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.vol.latches.release(self.pageid, Latch::Read);
    }
}

impl PageWriteGuard {
    pub fn vpid(&self) -> Vpid {
        Vpid::new(self.vol.volid, self.pageid)
    }

    pub fn lsa(&self) -> Lsa {
        unsafe { *(self.mem as *const Lsa) }
    }

    pub fn set_lsa(&mut self, lsa: Lsa) {
        unsafe { *(self.mem as *mut Lsa) = lsa }
    }

    /// Stamp the temporary-LSA sentinel: the page belongs to a temporary
    /// volume and must never be logged.
    pub fn set_lsa_as_temporary(&mut self) {
        self.set_lsa(Lsa::INIT_TEMP);
    }

    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mem.add(PAGE_PROLOG_SIZE), DB_PAGESIZE) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mem.add(PAGE_PROLOG_SIZE), DB_PAGESIZE) }
    }

    /// Zero the whole page, prolog included.
    pub fn zero(&mut self) {
        unsafe { std::ptr::write_bytes(self.mem, 0, IO_PAGESIZE) }
    }

    pub fn mark_dirty(&self) {
        self.vol.dirty.lock().unwrap().insert(self.pageid);
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.vol.latches.release(self.pageid, Latch::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PageBuf) {
        let dir = tempfile::tempdir().unwrap();
        let pgbuf = PageBuf::new(&SysParams {
            latch_timeout: Duration::from_millis(50),
            latch_retries: 2,
            ..SysParams::default()
        });
        (dir, pgbuf)
    }

    #[test]
    fn mount_write_read_roundtrip() {
        let (dir, pgbuf) = scratch();
        let path = dir.path().join("vol0");
        pgbuf.mount_new(0, &path, 8, None).unwrap();

        {
            let mut page = pgbuf.fix_write(Vpid::new(0, 3)).unwrap();
            page.data_mut()[0..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
            page.set_lsa(Lsa::new(7, 42));
            page.mark_dirty();
        }
        pgbuf.flush_all(0).unwrap();

        let page = pgbuf.fix_read(Vpid::new(0, 3)).unwrap();
        assert_eq!(&page.data()[0..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(page.lsa(), Lsa::new(7, 42));
    }

    #[test]
    fn write_latch_excludes_and_times_out() {
        let (dir, pgbuf) = scratch();
        let path = dir.path().join("vol1");
        pgbuf.mount_new(1, &path, 4, None).unwrap();

        let guard = pgbuf.fix_write(Vpid::new(1, 1)).unwrap();
        let err = pgbuf.fix_write(Vpid::new(1, 1)).unwrap_err();
        assert!(matches!(err, StorageError::PageLatchTimedOut { .. }));
        let err = pgbuf.fix_write_with_retry(Vpid::new(1, 1)).unwrap_err();
        assert!(matches!(err, StorageError::PageLatchAborted { .. }));
        drop(guard);
        assert!(pgbuf.fix_write(Vpid::new(1, 1)).is_ok());
    }

    #[test]
    fn read_latches_share() {
        let (dir, pgbuf) = scratch();
        let path = dir.path().join("vol2");
        pgbuf.mount_new(2, &path, 4, None).unwrap();

        let a = pgbuf.fix_read(Vpid::new(2, 1)).unwrap();
        let b = pgbuf.fix_read(Vpid::new(2, 1)).unwrap();
        assert!(pgbuf.fix_write(Vpid::new(2, 1)).is_err());
        drop(a);
        drop(b);
        assert!(pgbuf.fix_write(Vpid::new(2, 1)).is_ok());
    }

    #[test]
    fn extend_keeps_existing_pages() {
        let (dir, pgbuf) = scratch();
        let path = dir.path().join("vol3");
        pgbuf.mount_new(3, &path, 4, None).unwrap();
        {
            let mut page = pgbuf.fix_write(Vpid::new(3, 2)).unwrap();
            page.data_mut()[0] = 0x5a;
        }
        assert!(pgbuf.fix_read(Vpid::new(3, 6)).is_err());
        assert_eq!(pgbuf.extend(3, 4).unwrap(), 8);
        let page = pgbuf.fix_read(Vpid::new(3, 2)).unwrap();
        assert_eq!(page.data()[0], 0x5a);
        drop(page);
        assert!(pgbuf.fix_read(Vpid::new(3, 6)).is_ok());
    }

    #[test]
    fn out_of_range_page_is_rejected() {
        let (dir, pgbuf) = scratch();
        let path = dir.path().join("vol4");
        pgbuf.mount_new(4, &path, 4, None).unwrap();
        assert!(matches!(
            pgbuf.fix_read(Vpid::new(4, 4)).unwrap_err(),
            StorageError::UnknownPage { .. }
        ));
        assert!(matches!(
            pgbuf.fix_read(Vpid::new(5, 0)).unwrap_err(),
            StorageError::UnknownVolume(5)
        ));
    }
}
