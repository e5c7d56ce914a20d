use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;

use super::disk_manager::DiskManager;
use super::error::{StorageError, StorageResult};
use super::{BUFFER_POOL_SIZE, INVALID_PAGE_ID, PAGE_SIZE, PageId};

/// A slot in the buffer pool, caching at most one page image
struct Frame {
    /// Page currently held, INVALID_PAGE_ID when the frame is empty
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
    /// Latched once set; cleared only by a flush
    is_dirty: bool,
    pin_count: u32,
}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            data: Box::new([0u8; PAGE_SIZE]),
            is_dirty: false,
            pin_count: 0,
        }
    }

    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.is_dirty = false;
        self.pin_count = 0;
    }
}

/// Buffer pool over a fixed set of frames, with pinning and LRU eviction
///
/// All page access goes through here; the disk manager is never touched
/// directly by callers. Every successful `fetch_page`/`new_page` must be
/// paired with exactly one `unpin_page` on the same page id, and a caller
/// that mutated the payload unpins with `dirty = true`. Only unpinned
/// frames are eviction candidates.
pub struct BufferManager {
    disk: DiskManager,
    frames: Vec<Frame>,
    /// Resident pages: page id -> frame index
    page_table: HashMap<PageId, usize>,
    /// Frames holding no page
    free_list: VecDeque<usize>,
    /// Eviction index over frame indices: exactly the resident frames with
    /// pin_count == 0, most recently unpinned first. Capacity equals the
    /// frame count, so the cache itself never evicts behind our back.
    lru: LruCache<usize, ()>,
}

impl BufferManager {
    /// Create a buffer manager with the default pool size
    pub fn new(disk: DiskManager) -> Self {
        Self::with_capacity(disk, BUFFER_POOL_SIZE)
    }

    /// Create a buffer manager with the given number of frames
    pub fn with_capacity(disk: DiskManager, capacity: usize) -> Self {
        Self {
            disk,
            frames: (0..capacity).map(|_| Frame::new()).collect(),
            page_table: HashMap::new(),
            free_list: (0..capacity).collect(),
            lru: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
        }
    }

    /// Get a reference to the disk manager
    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    /// Pin a page, reading it from disk if it is not resident
    pub fn fetch_page(&mut self, page_id: PageId) -> StorageResult<()> {
        if page_id < 0 {
            return Err(StorageError::InvalidPageId(page_id));
        }

        if let Some(&frame_idx) = self.page_table.get(&page_id) {
            self.frames[frame_idx].pin_count += 1;
            // A pinned frame must not be an eviction candidate; it re-enters
            // the index when its pin count drops back to zero.
            self.lru.pop(&frame_idx);
            return Ok(());
        }

        let frame_idx = self.take_victim()?;
        let frame = &mut self.frames[frame_idx];
        if let Err(e) = self.disk.read_page(page_id, &mut frame.data) {
            frame.reset();
            self.free_list.push_back(frame_idx);
            return Err(e);
        }
        frame.page_id = page_id;
        frame.is_dirty = false;
        frame.pin_count = 1;
        self.page_table.insert(page_id, frame_idx);

        Ok(())
    }

    /// Allocate a fresh page and pin it; its payload starts zeroed
    pub fn new_page(&mut self) -> StorageResult<PageId> {
        let frame_idx = self.take_victim()?;
        let page_id = self.disk.allocate_page();

        let frame = &mut self.frames[frame_idx];
        frame.data.fill(0);
        frame.page_id = page_id;
        frame.is_dirty = false;
        frame.pin_count = 1;
        self.page_table.insert(page_id, frame_idx);

        Ok(page_id)
    }

    /// Payload of a resident page. The caller must hold a pin.
    pub fn page(&self, page_id: PageId) -> StorageResult<&[u8; PAGE_SIZE]> {
        let frame_idx = *self
            .page_table
            .get(&page_id)
            .ok_or(StorageError::PageNotResident(page_id))?;
        Ok(&self.frames[frame_idx].data)
    }

    /// Mutable payload of a resident page. The caller must hold a pin and
    /// declare the mutation by unpinning with `dirty = true`.
    pub fn page_mut(&mut self, page_id: PageId) -> StorageResult<&mut [u8; PAGE_SIZE]> {
        let frame_idx = *self
            .page_table
            .get(&page_id)
            .ok_or(StorageError::PageNotResident(page_id))?;
        Ok(&mut self.frames[frame_idx].data)
    }

    /// Drop one pin. Returns false for a page that is not resident or not
    /// pinned, which indicates a bug in the caller's pin discipline.
    pub fn unpin_page(&mut self, page_id: PageId, dirty: bool) -> bool {
        let Some(&frame_idx) = self.page_table.get(&page_id) else {
            return false;
        };

        let frame = &mut self.frames[frame_idx];
        if frame.pin_count == 0 {
            return false;
        }

        frame.pin_count -= 1;
        frame.is_dirty |= dirty;

        if frame.pin_count == 0 {
            // Most recently unpinned goes to the front of the LRU index
            self.lru.put(frame_idx, ());
        }

        true
    }

    /// Write a resident page to disk and clear its dirty bit.
    /// Returns Ok(false) if the page is not resident.
    pub fn flush_page(&mut self, page_id: PageId) -> StorageResult<bool> {
        let Some(&frame_idx) = self.page_table.get(&page_id) else {
            return Ok(false);
        };

        let frame = &mut self.frames[frame_idx];
        self.disk.write_page(frame.page_id, &frame.data)?;
        frame.is_dirty = false;
        Ok(true)
    }

    /// Drop a page from the pool without writing it back. Succeeds if the
    /// page is not resident; fails if it is pinned. The disk-level page id
    /// is not recycled.
    pub fn delete_page(&mut self, page_id: PageId) -> bool {
        let Some(&frame_idx) = self.page_table.get(&page_id) else {
            return true;
        };

        if self.frames[frame_idx].pin_count > 0 {
            return false;
        }

        self.lru.pop(&frame_idx);
        self.page_table.remove(&page_id);
        self.frames[frame_idx].reset();
        self.free_list.push_back(frame_idx);

        true
    }

    /// Write every resident dirty page back to disk
    pub fn flush_all(&mut self) -> StorageResult<()> {
        for frame in self.frames.iter_mut() {
            if frame.page_id != INVALID_PAGE_ID && frame.is_dirty {
                self.disk.write_page(frame.page_id, &frame.data)?;
                frame.is_dirty = false;
            }
        }
        Ok(())
    }

    /// Number of pages currently resident
    pub fn cached_page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Number of resident pages with unflushed modifications
    pub fn dirty_page_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.page_id != INVALID_PAGE_ID && f.is_dirty)
            .count()
    }

    /// Number of resident pages still holding pins
    pub fn pinned_page_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.page_id != INVALID_PAGE_ID && f.pin_count > 0)
            .count()
    }

    /// Check whether a page is resident
    pub fn is_page_cached(&self, page_id: PageId) -> bool {
        self.page_table.contains_key(&page_id)
    }

    /// Pin count of a resident page
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.page_table
            .get(&page_id)
            .map(|&frame_idx| self.frames[frame_idx].pin_count)
    }

    /// Claim a frame for a new resident page: the front of the free list if
    /// any, otherwise the least recently unpinned frame, written back first
    /// when dirty.
    fn take_victim(&mut self) -> StorageResult<usize> {
        if let Some(frame_idx) = self.free_list.pop_front() {
            return Ok(frame_idx);
        }

        // The index only ever holds unpinned frames, so the pin check
        // should never fire. Entries popped here stay popped.
        while let Some((frame_idx, ())) = self.lru.pop_lru() {
            if self.frames[frame_idx].pin_count > 0 {
                continue;
            }

            let frame = &mut self.frames[frame_idx];
            if frame.is_dirty {
                if let Err(e) = self.disk.write_page(frame.page_id, &frame.data) {
                    self.lru.put(frame_idx, ());
                    return Err(e);
                }
                frame.is_dirty = false;
            }
            self.page_table.remove(&frame.page_id);
            frame.page_id = INVALID_PAGE_ID;

            return Ok(frame_idx);
        }

        Err(StorageError::PoolExhausted(self.frames.len()))
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        // Flush all dirty pages when the buffer manager is dropped
        let _ = self.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(capacity: usize) -> (TempDir, BufferManager) {
        let temp_dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::open(temp_dir.path().join("test.db")).unwrap();
        (temp_dir, BufferManager::with_capacity(disk, capacity))
    }

    /// Allocate a page whose first byte is `tag`, unpinned dirty
    fn new_tagged_page(bm: &mut BufferManager, tag: u8) -> PageId {
        let page_id = bm.new_page().unwrap();
        bm.page_mut(page_id).unwrap()[0] = tag;
        bm.unpin_page(page_id, true);
        page_id
    }

    #[test]
    fn test_new_page_is_pinned_and_zeroed() {
        let (_temp_dir, mut bm) = setup(4);

        let page_id = bm.new_page().unwrap();
        assert_eq!(page_id, 0);
        assert_eq!(bm.pin_count(page_id), Some(1));
        assert!(bm.page(page_id).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fetch_page_reads_from_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.db");

        {
            let mut disk = DiskManager::open(&path).unwrap();
            let mut page = [0u8; PAGE_SIZE];
            page[0] = 42;
            disk.write_page(0, &page).unwrap();
        }

        let disk = DiskManager::open(&path).unwrap();
        let mut bm = BufferManager::with_capacity(disk, 4);

        bm.fetch_page(0).unwrap();
        assert_eq!(bm.page(0).unwrap()[0], 42);
        assert_eq!(bm.cached_page_count(), 1);
        bm.unpin_page(0, false);
    }

    #[test]
    fn test_pin_counting() {
        let (_temp_dir, mut bm) = setup(4);

        let page_id = new_tagged_page(&mut bm, 1);
        assert_eq!(bm.pin_count(page_id), Some(0));

        bm.fetch_page(page_id).unwrap();
        bm.fetch_page(page_id).unwrap();
        assert_eq!(bm.pin_count(page_id), Some(2));

        assert!(bm.unpin_page(page_id, false));
        assert!(bm.unpin_page(page_id, false));
        assert_eq!(bm.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_unpin_violations_return_false() {
        let (_temp_dir, mut bm) = setup(4);

        // Not resident
        assert!(!bm.unpin_page(99, false));

        // Already fully unpinned
        let page_id = new_tagged_page(&mut bm, 1);
        assert!(!bm.unpin_page(page_id, false));
    }

    #[test]
    fn test_page_access_requires_residency() {
        let (_temp_dir, mut bm) = setup(4);

        assert!(matches!(bm.page(3), Err(StorageError::PageNotResident(3))));
        assert!(matches!(
            bm.page_mut(3),
            Err(StorageError::PageNotResident(3))
        ));
    }

    #[test]
    fn test_lru_evicts_least_recently_unpinned() {
        let (_temp_dir, mut bm) = setup(3);

        let p0 = new_tagged_page(&mut bm, 10);
        let p1 = new_tagged_page(&mut bm, 11);
        let p2 = new_tagged_page(&mut bm, 12);
        assert_eq!(bm.cached_page_count(), 3);

        // Pool is full; the next allocation evicts p0
        let p3 = new_tagged_page(&mut bm, 13);
        assert_eq!(bm.cached_page_count(), 3);
        assert!(!bm.is_page_cached(p0));
        assert!(bm.is_page_cached(p1));
        assert!(bm.is_page_cached(p2));
        assert!(bm.is_page_cached(p3));
    }

    #[test]
    fn test_refetch_refreshes_recency() {
        let (_temp_dir, mut bm) = setup(3);

        let p0 = new_tagged_page(&mut bm, 10);
        let p1 = new_tagged_page(&mut bm, 11);
        let p2 = new_tagged_page(&mut bm, 12);

        // Touch p0 so p1 becomes the eviction victim
        bm.fetch_page(p0).unwrap();
        bm.unpin_page(p0, false);

        new_tagged_page(&mut bm, 13);
        assert!(bm.is_page_cached(p0));
        assert!(!bm.is_page_cached(p1));
        assert!(bm.is_page_cached(p2));
    }

    #[test]
    fn test_pinned_page_is_never_evicted() {
        let (_temp_dir, mut bm) = setup(2);

        let p0 = bm.new_page().unwrap(); // stays pinned
        let p1 = new_tagged_page(&mut bm, 11);

        // Only p1 is evictable
        let p2 = new_tagged_page(&mut bm, 12);
        assert!(bm.is_page_cached(p0));
        assert!(!bm.is_page_cached(p1));
        assert!(bm.is_page_cached(p2));

        bm.unpin_page(p0, false);
    }

    #[test]
    fn test_pool_exhausted_when_all_frames_pinned() {
        let (_temp_dir, mut bm) = setup(2);

        bm.new_page().unwrap();
        bm.new_page().unwrap();

        let result = bm.new_page();
        assert!(matches!(result, Err(StorageError::PoolExhausted(2))));
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() {
        let (_temp_dir, mut bm) = setup(2);

        let p0 = new_tagged_page(&mut bm, 77);

        // Force p0 out of the pool
        new_tagged_page(&mut bm, 1);
        new_tagged_page(&mut bm, 2);
        assert!(!bm.is_page_cached(p0));

        // Reloading sees the written-back bytes
        bm.fetch_page(p0).unwrap();
        assert_eq!(bm.page(p0).unwrap()[0], 77);
        bm.unpin_page(p0, false);
    }

    #[test]
    fn test_dirty_bit_is_latched() {
        let (_temp_dir, mut bm) = setup(4);

        let page_id = new_tagged_page(&mut bm, 1);
        assert_eq!(bm.dirty_page_count(), 1);

        // A later clean unpin must not wash out the dirty bit
        bm.fetch_page(page_id).unwrap();
        bm.unpin_page(page_id, false);
        assert_eq!(bm.dirty_page_count(), 1);
    }

    #[test]
    fn test_flush_page() {
        let (_temp_dir, mut bm) = setup(4);

        let page_id = new_tagged_page(&mut bm, 55);
        assert_eq!(bm.dirty_page_count(), 1);

        assert!(bm.flush_page(page_id).unwrap());
        assert_eq!(bm.dirty_page_count(), 0);

        // Not resident
        assert!(!bm.flush_page(42).unwrap());
    }

    #[test]
    fn test_flush_all() {
        let (_temp_dir, mut bm) = setup(8);

        for tag in 0..5 {
            new_tagged_page(&mut bm, tag);
        }
        assert_eq!(bm.dirty_page_count(), 5);

        bm.flush_all().unwrap();
        assert_eq!(bm.dirty_page_count(), 0);
    }

    #[test]
    fn test_delete_page() {
        let (_temp_dir, mut bm) = setup(4);

        // Not resident: idempotent success
        assert!(bm.delete_page(99));

        // Pinned: refused
        let page_id = bm.new_page().unwrap();
        assert!(!bm.delete_page(page_id));

        // Unpinned: dropped, frame becomes free again
        bm.unpin_page(page_id, false);
        assert!(bm.delete_page(page_id));
        assert!(!bm.is_page_cached(page_id));
        assert_eq!(bm.cached_page_count(), 0);
    }

    #[test]
    fn test_drop_flushes_dirty_pages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.db");

        {
            let disk = DiskManager::open(&path).unwrap();
            let mut bm = BufferManager::with_capacity(disk, 4);
            new_tagged_page(&mut bm, 88);
            // bm is dropped here, should flush
        }

        let mut disk = DiskManager::open(&path).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(0, &mut buf).unwrap();
        assert_eq!(buf[0], 88);
    }
}
