//! Capacity-bounded, lock-aware file store.
//!
//! Entries live in a [`LinkedHashMap`] keyed by absolute name whose
//! iteration order doubles as the LRU list: front is least recently used,
//! back is most recently used. Map and recency order always change together
//! under the single store mutex.
//!
//! Capacity is enforced on two axes, slots and bytes. Eviction walks from
//! the LRU end, skips every locked entry and the entry being written, and
//! only commits when the planned victims free enough room; otherwise the
//! store is left untouched and the operation fails.

use std::sync::{Condvar, Mutex};

use hashlink::LinkedHashMap;
use vcache_config::{log_store_debug, log_store_info, StoreConfig};
use vcache_ipc::{attached_file_size, FileData, ResourcePath};

use crate::error::StoreError;
use crate::sync::{lock, wait};
use crate::ClientId;

type Result<T> = std::result::Result<T, StoreError>;

struct CacheEntry {
    owner: Option<ClientId>,
    path: ResourcePath,
    content: Vec<u8>,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn to_file_data(&self) -> FileData {
        FileData::new(self.path.clone(), self.content.clone())
    }

    fn into_file_data(self) -> FileData {
        FileData::new(self.path, self.content)
    }
}

/// Snapshot of store usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub bytes_used: u64,
    pub bytes_max: u64,
    pub slots_used: usize,
    pub slots_max: usize,
    /// High-water mark of `bytes_used`
    pub peak_bytes: u64,
    /// High-water mark of `slots_used`
    pub peak_slots: usize,
    /// Operations that needed eviction, successful or not
    pub capacity_misses: u64,
    pub evicted_files: u64,
}

struct StoreInner {
    entries: LinkedHashMap<String, CacheEntry>,
    stats: StoreStats,
    shutting_down: bool,
}

impl StoreInner {
    /// Pick LRU victims so that adding `extra_slots` entries and
    /// `extra_bytes` bytes fits. `None` when locked entries make that
    /// impossible.
    fn plan_eviction(
        &self,
        skip: Option<&str>,
        extra_slots: usize,
        extra_bytes: u64,
    ) -> Option<Vec<String>> {
        let slots_over = (self.stats.slots_used + extra_slots).saturating_sub(self.stats.slots_max);
        let bytes_over = (self.stats.bytes_used + extra_bytes).saturating_sub(self.stats.bytes_max);

        let mut victims = Vec::new();
        let (mut slots_freed, mut bytes_freed) = (0usize, 0u64);
        for (name, entry) in self.entries.iter() {
            if slots_freed >= slots_over && bytes_freed >= bytes_over {
                break;
            }
            if entry.owner.is_some() || Some(name.as_str()) == skip {
                continue;
            }
            slots_freed += 1;
            bytes_freed += entry.size();
            victims.push(name.clone());
        }

        (slots_freed >= slots_over && bytes_freed >= bytes_over).then_some(victims)
    }

    fn needs_eviction(&self, extra_slots: usize, extra_bytes: u64) -> bool {
        self.stats.slots_used + extra_slots > self.stats.slots_max
            || self.stats.bytes_used + extra_bytes > self.stats.bytes_max
    }

    /// Make room or fail without side effects (beyond the miss counter).
    fn reclaim(
        &mut self,
        skip: Option<&str>,
        extra_slots: usize,
        extra_bytes: u64,
        failure: StoreError,
    ) -> Result<Vec<FileData>> {
        if !self.needs_eviction(extra_slots, extra_bytes) {
            return Ok(Vec::new());
        }
        self.stats.capacity_misses += 1;

        let victims = self
            .plan_eviction(skip, extra_slots, extra_bytes)
            .ok_or(failure)?;

        let mut evicted = Vec::with_capacity(victims.len());
        for name in victims {
            if let Some(entry) = self.entries.remove(&name) {
                self.stats.slots_used -= 1;
                self.stats.bytes_used -= entry.size();
                self.stats.evicted_files += 1;
                log_store_debug!("Evicted", name = name.as_str(), bytes = entry.size());
                evicted.push(entry.into_file_data());
            }
        }
        Ok(evicted)
    }

    fn record_peaks(&mut self) {
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.bytes_used);
        self.stats.peak_slots = self.stats.peak_slots.max(self.stats.slots_used);
    }

    /// Entry the caller may modify: it must exist and be locked by them.
    fn owned_mut(&mut self, client: ClientId, name: &str) -> Result<&mut CacheEntry> {
        let entry = self.entries.get_mut(name).ok_or(StoreError::NotFound)?;
        if entry.owner != Some(client) {
            return Err(StoreError::NotPermitted);
        }
        Ok(entry)
    }

    /// Replace the content of an owned entry, evicting others as needed.
    fn store_content(
        &mut self,
        client: ClientId,
        name: &str,
        build: impl FnOnce(&[u8]) -> Vec<u8>,
    ) -> Result<Vec<FileData>> {
        let entry = self.owned_mut(client, name)?;
        let old_len = entry.size();
        let content = build(&entry.content);
        let new_len = content.len() as u64;

        if new_len > self.stats.bytes_max {
            self.stats.capacity_misses += 1;
            return Err(StoreError::OutOfMemory);
        }
        let evicted = self.reclaim(
            Some(name),
            0,
            new_len.saturating_sub(old_len),
            StoreError::OutOfMemory,
        )?;

        if let Some(entry) = self.entries.to_back(name) {
            entry.content = content;
        }
        self.stats.bytes_used = self.stats.bytes_used - old_len + new_len;
        self.record_peaks();
        Ok(evicted)
    }
}

pub struct FileStore {
    inner: Mutex<StoreInner>,
    /// Signalled whenever a lock is released or a locked entry disappears
    released: Condvar,
}

impl FileStore {
    pub fn new(bytes_max: u64, slots_max: usize, table_size: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: LinkedHashMap::with_capacity(table_size),
                stats: StoreStats {
                    bytes_max,
                    slots_max,
                    ..StoreStats::default()
                },
                shutting_down: false,
            }),
            released: Condvar::new(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.max_bytes(),
            config.max_capacity_slots,
            config.bucket_count(),
        )
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        lock(&self.inner, "file store")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner().entries.contains_key(name)
    }

    /// Reserve an empty entry, locked by `client` when `locked` is set.
    /// Returns the files evicted to free a slot.
    pub fn create(&self, client: ClientId, path: &ResourcePath, locked: bool) -> Result<Vec<FileData>> {
        let mut inner = self.inner();
        if inner.entries.contains_key(path.absolute()) {
            return Err(StoreError::AlreadyExists);
        }
        if inner.stats.slots_max == 0 {
            return Err(StoreError::OutOfSlots);
        }
        let evicted = inner.reclaim(None, 1, 0, StoreError::OutOfSlots)?;

        inner.entries.insert(
            path.absolute().to_string(),
            CacheEntry {
                owner: locked.then_some(client),
                path: path.clone(),
                content: Vec::new(),
            },
        );
        inner.stats.slots_used += 1;
        inner.record_peaks();
        log_store_debug!("Created", name = path.absolute(), client = client.0, locked = locked);
        Ok(evicted)
    }

    /// Acquire exclusive ownership, blocking while another client holds it.
    pub fn lock(&self, client: ClientId, name: &str) -> Result<()> {
        let mut inner = self.inner();
        loop {
            let shutting_down = inner.shutting_down;
            let entry = inner.entries.get_mut(name).ok_or(StoreError::NotFound)?;
            match entry.owner {
                None => {
                    entry.owner = Some(client);
                    return Ok(());
                }
                Some(owner) if owner == client => return Ok(()),
                // only a lock that would have to wait is refused
                Some(_) if shutting_down => return Err(StoreError::Unavailable),
                Some(owner) => {
                    log_store_debug!("Waiting for lock", name = name, client = client.0, owner = owner.0);
                }
            }
            inner = wait(&self.released, inner, "file store");
        }
    }

    pub fn unlock(&self, client: ClientId, name: &str) -> Result<()> {
        let mut inner = self.inner();
        inner.owned_mut(client, name)?.owner = None;
        drop(inner);
        self.released.notify_all();
        Ok(())
    }

    /// Content of `name`, refreshing its recency.
    pub fn read(&self, client: ClientId, name: &str) -> Result<FileData> {
        let mut inner = self.inner();
        let owner = inner.entries.get(name).ok_or(StoreError::NotFound)?.owner;
        if owner.is_some_and(|owner| owner != client) {
            return Err(StoreError::NotPermitted);
        }
        let entry = inner.entries.to_back(name).ok_or(StoreError::NotFound)?;
        Ok(entry.to_file_data())
    }

    /// Up to `n` stored files (all of them when `n == 0`), most recent first.
    /// Files locked by other clients are skipped; recency is not touched.
    ///
    /// The listing stops before the first file that would take the encoded
    /// files past `max_reply` bytes, so the reply always fits in one frame.
    pub fn read_n(&self, client: ClientId, n: usize, max_reply: usize) -> Vec<FileData> {
        let inner = self.inner();
        let limit = if n == 0 { usize::MAX } else { n };
        let mut budget = max_reply;
        inner
            .entries
            .values()
            .rev()
            .filter(|entry| entry.owner.map_or(true, |owner| owner == client))
            .take(limit)
            .map_while(|entry| {
                let size = attached_file_size(&entry.path, entry.content.len());
                budget = budget.checked_sub(size)?;
                Some(entry.to_file_data())
            })
            .collect()
    }

    /// Replace the content. The caller must hold the lock.
    pub fn write(&self, client: ClientId, name: &str, content: Vec<u8>) -> Result<Vec<FileData>> {
        let mut inner = self.inner();
        let evicted = inner.store_content(client, name, |_| content)?;
        log_store_debug!("Written", name = name, evicted = evicted.len());
        Ok(evicted)
    }

    /// Append to the content. The caller must hold the lock.
    pub fn append(&self, client: ClientId, name: &str, data: &[u8]) -> Result<Vec<FileData>> {
        let mut inner = self.inner();
        let evicted = inner.store_content(client, name, |old| {
            let mut content = Vec::with_capacity(old.len() + data.len());
            content.extend_from_slice(old);
            content.extend_from_slice(data);
            content
        })?;
        log_store_debug!("Appended", name = name, bytes = data.len(), evicted = evicted.len());
        Ok(evicted)
    }

    /// Delete a file. The caller must hold the lock.
    pub fn remove(&self, client: ClientId, name: &str) -> Result<()> {
        let mut inner = self.inner();
        inner.owned_mut(client, name)?;
        if let Some(entry) = inner.entries.remove(name) {
            inner.stats.slots_used -= 1;
            inner.stats.bytes_used -= entry.size();
        }
        drop(inner);
        // waiters on this file now observe NotFound
        self.released.notify_all();
        log_store_debug!("Removed", name = name, client = client.0);
        Ok(())
    }

    /// Drop every lock held by `client`. Returns how many were released.
    pub fn release_client(&self, client: ClientId) -> usize {
        let mut inner = self.inner();
        let mut released = 0;
        for entry in inner.entries.values_mut() {
            if entry.owner == Some(client) {
                entry.owner = None;
                released += 1;
            }
        }
        drop(inner);
        if released > 0 {
            self.released.notify_all();
            log_store_debug!("Released locks", client = client.0, count = released);
        }
        released
    }

    /// Fail pending and future lock waits with `Unavailable`. Locks that
    /// can be granted at once are still granted.
    pub fn shutdown(&self) {
        self.inner().shutting_down = true;
        self.released.notify_all();
    }

    pub fn stats(&self) -> StoreStats {
        self.inner().stats
    }

    /// Stored names, least recently used first.
    pub fn file_names(&self) -> Vec<String> {
        self.inner().entries.keys().cloned().collect()
    }

    pub fn log_summary(&self) {
        let stats = self.stats();
        log_store_info!(
            "Store summary",
            files = stats.slots_used,
            bytes = stats.bytes_used,
            peak_files = stats.peak_slots,
            peak_bytes = stats.peak_bytes,
            capacity_misses = stats.capacity_misses,
            evicted = stats.evicted_files,
        );
        for name in self.file_names() {
            log_store_info!("Stored file", name = name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn path(name: &str) -> ResourcePath {
        ResourcePath::new(format!("/t/{}", name), name)
    }

    /// Create, write and unlock a file owned by nobody afterwards.
    fn put(store: &FileStore, name: &str, content: &[u8]) -> Vec<FileData> {
        let p = path(name);
        let mut evicted = store.create(A, &p, true).unwrap();
        evicted.extend(store.write(A, p.absolute(), content.to_vec()).unwrap());
        store.unlock(A, p.absolute()).unwrap();
        evicted
    }

    #[test]
    fn test_write_then_append_accumulates() {
        let store = FileStore::new(1024, 4, 16);
        let p = path("f");
        store.create(A, &p, true).unwrap();
        store.write(A, p.absolute(), b"hello".to_vec()).unwrap();
        store.append(A, p.absolute(), b" world").unwrap();
        assert_eq!(store.read(A, p.absolute()).unwrap().content, b"hello world");
        store.write(A, p.absolute(), b"x".to_vec()).unwrap();
        assert_eq!(store.read(A, p.absolute()).unwrap().content, b"x");
        assert_eq!(store.stats().bytes_used, 1);
    }

    #[test]
    fn test_write_requires_lock() {
        let store = FileStore::new(1024, 4, 16);
        put(&store, "f", b"data");
        let name = path("f").absolute().to_string();
        assert_eq!(store.write(B, &name, b"x".to_vec()), Err(StoreError::NotPermitted));
        assert_eq!(store.append(B, &name, b"x"), Err(StoreError::NotPermitted));
        assert_eq!(store.remove(B, &name), Err(StoreError::NotPermitted));
        assert!(store.contains(&name));
    }

    #[test]
    fn test_slot_eviction_follows_lru() {
        let store = FileStore::new(1024, 2, 16);
        put(&store, "a", b"aaa");
        put(&store, "b", b"bbb");
        // touching a makes b the LRU entry
        store.read(B, path("a").absolute()).unwrap();

        let evicted = put(&store, "c", b"ccc");
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].path.relative(), "b");
        assert_eq!(evicted[0].content, b"bbb");
        assert!(!store.contains(path("b").absolute()));
        assert_eq!(store.stats().evicted_files, 1);
        assert_eq!(store.stats().capacity_misses, 1);
    }

    #[test]
    fn test_byte_eviction_skips_locked_entries() {
        let store = FileStore::new(10, 8, 16);
        put(&store, "a", b"aaaa");
        put(&store, "b", b"bbbb");
        store.lock(B, path("a").absolute()).unwrap();

        let p = path("c");
        store.create(A, &p, true).unwrap();
        let evicted = store.write(A, p.absolute(), b"cccccc".to_vec()).unwrap();
        let names: Vec<_> = evicted.iter().map(|f| f.path.relative()).collect();
        assert_eq!(names, vec!["b"]);
        assert!(store.contains(path("a").absolute()));
        assert_eq!(store.stats().bytes_used, 10);
    }

    #[test]
    fn test_unreclaimable_space_leaves_store_unchanged() {
        let store = FileStore::new(10, 8, 16);
        let a = path("a");
        store.create(B, &a, true).unwrap();
        store.write(B, a.absolute(), b"aaaaaaaa".to_vec()).unwrap();

        let c = path("c");
        store.create(A, &c, true).unwrap();
        store.write(A, c.absolute(), b"cc".to_vec()).unwrap();
        let before = store.stats();

        assert_eq!(
            store.append(A, c.absolute(), b"ccc"),
            Err(StoreError::OutOfMemory)
        );
        assert_eq!(store.read(A, c.absolute()).unwrap().content, b"cc");
        assert_eq!(store.stats().bytes_used, before.bytes_used);
        assert_eq!(store.stats().slots_used, before.slots_used);
        assert_eq!(store.file_names().len(), 2);
    }

    #[test]
    fn test_content_larger_than_store_rejected() {
        let store = FileStore::new(4, 8, 16);
        let p = path("big");
        store.create(A, &p, true).unwrap();
        assert_eq!(
            store.write(A, p.absolute(), vec![0; 5]),
            Err(StoreError::OutOfMemory)
        );
        assert_eq!(store.append(A, p.absolute(), &[0; 5]), Err(StoreError::OutOfMemory));
        let stats = store.stats();
        assert_eq!(stats.capacity_misses, 2);
        assert_eq!(stats.bytes_used, 0);
    }

    #[test]
    fn test_create_fails_when_every_slot_is_locked() {
        let store = FileStore::new(1024, 1, 16);
        store.create(A, &path("a"), true).unwrap();
        assert_eq!(store.create(B, &path("b"), false), Err(StoreError::OutOfSlots));
        assert_eq!(store.create(B, &path("a"), false), Err(StoreError::AlreadyExists));
    }

    #[test]
    fn test_read_of_file_locked_by_other_is_refused() {
        let store = FileStore::new(1024, 4, 16);
        put(&store, "f", b"x");
        let name = path("f").absolute().to_string();
        store.lock(A, &name).unwrap();
        assert_eq!(store.read(B, &name).unwrap_err(), StoreError::NotPermitted);
        assert!(store.read(A, &name).is_ok());
        assert!(store.read_n(B, 0, usize::MAX).is_empty());
        assert_eq!(store.read_n(A, 0, usize::MAX).len(), 1);
    }

    #[test]
    fn test_read_n_limits_and_orders_by_recency() {
        let store = FileStore::new(1024, 8, 16);
        put(&store, "a", b"1");
        put(&store, "b", b"2");
        put(&store, "c", b"3");
        let files = store.read_n(A, 2, usize::MAX);
        let names: Vec<_> = files.iter().map(|f| f.path.relative()).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert_eq!(store.read_n(A, 0, usize::MAX).len(), 3);
    }

    #[test]
    fn test_read_n_stops_at_reply_budget() {
        let store = FileStore::new(1024, 8, 16);
        put(&store, "a", &[1; 100]);
        put(&store, "b", &[2; 100]);
        put(&store, "c", &[3; 100]);
        let one = attached_file_size(&path("c"), 100);

        let files = store.read_n(A, 0, 2 * one + one / 2);
        let names: Vec<_> = files.iter().map(|f| f.path.relative()).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert_eq!(store.read_n(A, 0, 3 * one).len(), 3);
        assert!(store.read_n(A, 0, one - 1).is_empty());
    }

    #[test]
    fn test_lock_blocks_until_release() {
        let store = Arc::new(FileStore::new(1024, 4, 16));
        put(&store, "f", b"x");
        let name = path("f").absolute().to_string();
        store.lock(A, &name).unwrap();
        store.lock(A, &name).unwrap(); // re-entrant for the owner

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let store = store.clone();
            let name = name.clone();
            thread::spawn(move || tx.send(store.lock(B, &name)).unwrap())
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        store.unlock(A, &name).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        waiter.join().unwrap();
        assert_eq!(store.unlock(A, &name), Err(StoreError::NotPermitted));
    }

    #[test]
    fn test_lock_waiter_sees_removal() {
        let store = Arc::new(FileStore::new(1024, 4, 16));
        put(&store, "f", b"x");
        let name = path("f").absolute().to_string();
        store.lock(A, &name).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let store = store.clone();
            let name = name.clone();
            thread::spawn(move || tx.send(store.lock(B, &name)).unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        store.remove(A, &name).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(StoreError::NotFound)
        );
        waiter.join().unwrap();
    }

    #[test]
    fn test_release_client_and_shutdown_wake_waiters() {
        let store = Arc::new(FileStore::new(1024, 4, 16));
        put(&store, "f", b"x");
        put(&store, "g", b"y");
        let f = path("f").absolute().to_string();
        let g = path("g").absolute().to_string();
        store.lock(A, &f).unwrap();
        store.lock(A, &g).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let store = store.clone();
            let f = f.clone();
            thread::spawn(move || tx.send(store.lock(B, &f)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(store.release_client(A), 2);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        waiter.join().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let store = store.clone();
            thread::spawn(move || tx.send(store.lock(A, &f)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        store.shutdown();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(StoreError::Unavailable)
        );
        waiter.join().unwrap();
    }

    #[test]
    fn test_shutdown_refuses_only_contended_locks() {
        let store = FileStore::new(1024, 4, 16);
        put(&store, "free", b"x");
        put(&store, "held", b"y");
        let free = path("free").absolute().to_string();
        let held = path("held").absolute().to_string();
        store.lock(A, &held).unwrap();

        store.shutdown();
        assert_eq!(store.lock(B, &free), Ok(()));
        assert_eq!(store.lock(B, &free), Ok(()));
        assert_eq!(store.lock(A, &held), Ok(()));
        assert_eq!(store.lock(B, &held), Err(StoreError::Unavailable));
        assert_eq!(store.lock(B, "/t/missing"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_stats_track_peaks() {
        let store = FileStore::new(1024, 4, 16);
        put(&store, "a", b"12345");
        let p = path("a");
        store.lock(A, p.absolute()).unwrap();
        store.remove(A, p.absolute()).unwrap();
        let stats = store.stats();
        assert_eq!(stats.bytes_used, 0);
        assert_eq!(stats.slots_used, 0);
        assert_eq!(stats.peak_bytes, 5);
        assert_eq!(stats.peak_slots, 1);
    }
}
