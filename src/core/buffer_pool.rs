//! # Device Memory Manager
//!
//! Owns every frame-sized buffer on a device, grouped into fixed-size pools per
//! [`SizeClass`] (one class per stage output resolution). Buffers are allocated up front
//! and recycled, so steady-state processing performs no allocation.
//!
//! ## Architecture
//!
//! ```text
//!            acquire(class)                   drop / release
//! stage ─────────────────────► BufferLease ─────────────────────┐
//!   ▲                              │ record_use(fence)          │
//!   │ blocks (bounded) when        ▼                            ▼
//!   │ the class is exhausted   kernel reads/writes      Retiring(fence) ──fence signaled──► Free
//!   └──────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - A buffer is handed to exactly one lease at a time; handles carry a generation so a
//!   handle used after its release is detected as stale instead of aliasing new data.
//! - A released buffer whose last kernel has not finished is parked until that kernel's
//!   fence signals; it never re-enters the free list while the device may still touch it.
//! - The number of live buffers in a class never exceeds its configured count, and no
//!   count may exceed the manager's hard cap.
//! - Acquisition on an exhausted class blocks until a buffer comes back or the acquire
//!   timeout elapses; the timeout is a transient error.

use crate::core::device::Fence;
use crate::error::{StitchError, StitchResult, operations};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Buffer pools are keyed by the resolution class of the data they hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    /// Camera frames as captured
    Raw,
    /// Undistorted camera frames
    Rectified,
    /// Color-corrected frames of the matched camera
    Matched,
    /// Stitched panoramas
    Panorama,
}

impl SizeClass {
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Raw,
        SizeClass::Rectified,
        SizeClass::Matched,
        SizeClass::Panorama,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SizeClass::Raw => "raw",
            SizeClass::Rectified => "rectified",
            SizeClass::Matched => "matched",
            SizeClass::Panorama => "panorama",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque reference to one pooled buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    class: SizeClass,
    slot: u32,
    generation: u32,
}

impl BufferHandle {
    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Backing storage of one buffer, shared with the kernels that access it.
pub type SlabMemory = Arc<RwLock<MmapMut>>;

/// Snapshot of one size-class pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub buffer_bytes: usize,
    /// Configured buffer count
    pub target: usize,
    /// Buffers currently allocated
    pub live: usize,
    pub in_use: usize,
    pub free: usize,
    /// Released buffers waiting on their last kernel
    pub retiring: usize,
    pub peak_in_use: usize,
    pub acquisitions: u64,
    /// Acquisitions that had to block
    pub waits: u64,
    pub timeouts: u64,
}

enum SlotState {
    Free,
    InUse,
    Retiring(Fence),
}

struct Slot {
    memory: Option<SlabMemory>,
    generation: u32,
    state: SlotState,
}

struct ClassPool {
    buffer_bytes: usize,
    target: usize,
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    peak_in_use: usize,
    acquisitions: u64,
    waits: u64,
    timeouts: u64,
}

impl ClassPool {
    fn new(buffer_bytes: usize) -> Self {
        Self {
            buffer_bytes,
            target: 0,
            slots: Vec::new(),
            free: VecDeque::new(),
            peak_in_use: 0,
            acquisitions: 0,
            waits: 0,
            timeouts: 0,
        }
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.memory.is_some()).count()
    }

    fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.memory.is_some() && matches!(s.state, SlotState::InUse))
            .count()
    }

    fn retiring(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Retiring(_)))
            .count()
    }

    fn allocate(&mut self, class: SizeClass) -> StitchResult<()> {
        let map = MmapMut::map_anon(self.buffer_bytes).map_err(|e| {
            StitchError::resource(
                format!("{class} buffer"),
                format!("allocating {} bytes failed: {e}", self.buffer_bytes),
            )
        })?;
        let memory = Some(Arc::new(RwLock::new(map)));
        let index = match self.slots.iter().position(|s| s.memory.is_none()) {
            Some(i) => {
                self.slots[i].memory = memory;
                self.slots[i].state = SlotState::Free;
                i
            }
            None => {
                self.slots.push(Slot {
                    memory,
                    generation: 0,
                    state: SlotState::Free,
                });
                self.slots.len() - 1
            }
        };
        self.free.push_back(index as u32);
        Ok(())
    }

    /// Returns a slot to circulation, or frees its memory when the pool is shrinking.
    fn recycle(&mut self, slot: u32) {
        let shrinking = self.live() > self.target;
        let entry = &mut self.slots[slot as usize];
        entry.state = SlotState::Free;
        if shrinking {
            entry.memory = None;
        } else {
            self.free.push_back(slot);
        }
    }

    /// Moves retiring slots whose fence has signaled back to circulation.
    fn collect(&mut self) -> usize {
        let done: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match &s.state {
                SlotState::Retiring(fence) if fence.is_signaled() => Some(i as u32),
                _ => None,
            })
            .collect();
        for slot in &done {
            self.recycle(*slot);
        }
        done.len()
    }

    fn oldest_retiring(&self) -> Option<Fence> {
        self.slots
            .iter()
            .filter_map(|s| match &s.state {
                SlotState::Retiring(fence) => Some(fence),
                _ => None,
            })
            .min_by_key(|f| f.index())
            .cloned()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_bytes: self.buffer_bytes,
            target: self.target,
            live: self.live(),
            in_use: self.in_use(),
            free: self.free.len(),
            retiring: self.retiring(),
            peak_in_use: self.peak_in_use,
            acquisitions: self.acquisitions,
            waits: self.waits,
            timeouts: self.timeouts,
        }
    }
}

/// Size-class buffer pools of one device.
pub struct MemoryManager {
    hard_cap: usize,
    acquire_timeout: Duration,
    pools: Mutex<HashMap<SizeClass, ClassPool>>,
    available: Condvar,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("hard_cap", &self.hard_cap)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Creates a manager with no pools; see [`MemoryManager::configure_class`].
    ///
    /// # Parameters
    ///
    /// - `hard_cap`: maximum buffer count any single class may be sized to
    /// - `acquire_timeout`: how long [`MemoryManager::acquire`] blocks on an exhausted class
    pub fn new(hard_cap: usize, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            hard_cap,
            acquire_timeout,
            pools: Mutex::new(HashMap::new()),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> StitchResult<MutexGuard<'_, HashMap<SizeClass, ClassPool>>> {
        self.pools.lock().map_err(|_| StitchError::poisoned("memory manager"))
    }

    pub fn hard_cap(&self) -> usize {
        self.hard_cap
    }

    /// Creates the pool for `class` with `count` buffers of `buffer_bytes` each.
    ///
    /// # Errors
    ///
    /// Fatal when `count` exceeds the hard cap, the class already exists with a different
    /// buffer size, or the allocation fails.
    pub fn configure_class(&self, class: SizeClass, buffer_bytes: usize, count: usize) -> StitchResult<()> {
        if buffer_bytes == 0 {
            return Err(StitchError::config("buffer_bytes", "0", format!("{class} buffers must not be empty")));
        }
        {
            let mut pools = self.lock()?;
            let pool = pools.entry(class).or_insert_with(|| ClassPool::new(buffer_bytes));
            if pool.buffer_bytes != buffer_bytes {
                return Err(StitchError::config(
                    "buffer_bytes",
                    buffer_bytes.to_string(),
                    format!("{class} pool already holds {}-byte buffers", pool.buffer_bytes),
                ));
            }
        }
        self.resize_pool(class, count)
    }

    /// Grows or shrinks the pool of `class` to `count` buffers.
    ///
    /// Shrinking frees idle buffers immediately; buffers still leased are freed as they
    /// come back.
    pub fn resize_pool(&self, class: SizeClass, count: usize) -> StitchResult<()> {
        if count > self.hard_cap {
            return Err(StitchError::resource(
                format!("{class} pool"),
                format!("requested {count} buffers exceeds hard cap {}", self.hard_cap),
            )
            .with_metadata("size_class", class.name()));
        }
        if count == 0 {
            return Err(StitchError::config("pool_size", "0", format!("{class} pool needs at least one buffer")));
        }
        let mut pools = self.lock()?;
        let pool = pools
            .get_mut(&class)
            .ok_or_else(|| StitchError::config("size_class", class.name(), "no pool configured"))?;
        pool.target = count;
        pool.collect();
        while pool.live() < count {
            pool.allocate(class)?;
        }
        while pool.live() > count {
            let Some(slot) = pool.free.pop_back() else { break };
            pool.slots[slot as usize].memory = None;
        }
        info!(
            size_class = %class,
            target = count,
            live = pool.live(),
            buffer_bytes = pool.buffer_bytes,
            "buffer pool resized"
        );
        drop(pools);
        self.available.notify_all();
        Ok(())
    }

    /// Leases a buffer of `class`, blocking up to the configured acquire timeout.
    pub fn acquire(self: &Arc<Self>, class: SizeClass) -> StitchResult<BufferLease> {
        self.acquire_within(class, self.acquire_timeout)
    }

    /// Leases a buffer of `class`, blocking up to `timeout`.
    ///
    /// While blocked, the caller waits on the oldest retiring buffer's fence when there
    /// is one, otherwise on plain releases.
    pub fn acquire_within(self: &Arc<Self>, class: SizeClass, timeout: Duration) -> StitchResult<BufferLease> {
        let deadline = Instant::now() + timeout;
        let mut waited = false;
        let mut pools = self.lock()?;
        loop {
            let pool = pools
                .get_mut(&class)
                .ok_or_else(|| StitchError::config("size_class", class.name(), "no pool configured"))?;
            pool.collect();
            if let Some(slot) = pool.free.pop_front() {
                let entry = &mut pool.slots[slot as usize];
                let Some(memory) = entry.memory.clone() else {
                    continue;
                };
                entry.state = SlotState::InUse;
                let handle = BufferHandle {
                    class,
                    slot,
                    generation: entry.generation,
                };
                pool.acquisitions += 1;
                let in_use = pool.in_use();
                pool.peak_in_use = pool.peak_in_use.max(in_use);
                let len = pool.buffer_bytes;
                return Ok(BufferLease {
                    handle,
                    memory,
                    len,
                    last_use: Mutex::new(None),
                    manager: Arc::clone(self),
                    released: false,
                });
            }

            if !waited {
                pool.waits += 1;
                waited = true;
                debug!(size_class = %class, in_use = pool.in_use(), "pool exhausted, waiting");
            }
            let now = Instant::now();
            if now >= deadline {
                pool.timeouts += 1;
                warn!(size_class = %class, timeout_ms = timeout.as_millis() as u64, "buffer acquire timed out");
                return Err(
                    StitchError::timeout(operations::BUFFER_ACQUIRE, timeout.as_millis() as u64)
                        .with_metadata("size_class", class.name()),
                );
            }
            let remaining = deadline - now;
            match pool.oldest_retiring() {
                Some(fence) => {
                    drop(pools);
                    fence.wait_complete(remaining);
                    pools = self.lock()?;
                }
                None => {
                    pools = self
                        .available
                        .wait_timeout(pools, remaining)
                        .map_err(|_| StitchError::poisoned("memory manager"))?
                        .0;
                }
            }
        }
    }

    /// Returns a buffer by handle; it is free for reuse immediately.
    ///
    /// # Errors
    ///
    /// [`StitchError::StaleHandle`] if the handle was already released.
    pub fn release(&self, handle: BufferHandle) -> StitchResult<()> {
        self.release_inner(handle, None)
    }

    /// Returns a buffer whose last kernel is `fence`; reuse waits for the fence.
    pub fn release_after(&self, handle: BufferHandle, fence: Fence) -> StitchResult<()> {
        self.release_inner(handle, Some(fence))
    }

    fn release_inner(&self, handle: BufferHandle, fence: Option<Fence>) -> StitchResult<()> {
        let mut pools = self.lock()?;
        let pool = pools
            .get_mut(&handle.class)
            .ok_or_else(|| StitchError::stale_handle(handle))?;
        let entry = pool
            .slots
            .get_mut(handle.slot as usize)
            .ok_or_else(|| StitchError::stale_handle(handle))?;
        if entry.generation != handle.generation || !matches!(entry.state, SlotState::InUse) {
            return Err(StitchError::stale_handle(handle));
        }
        entry.generation = entry.generation.wrapping_add(1);
        match fence {
            Some(fence) if !fence.is_signaled() => entry.state = SlotState::Retiring(fence),
            _ => pool.recycle(handle.slot),
        }
        drop(pools);
        self.available.notify_all();
        Ok(())
    }

    /// Validated access to a leased buffer's storage.
    pub fn memory(&self, handle: BufferHandle) -> StitchResult<SlabMemory> {
        let pools = self.lock()?;
        let entry = pools
            .get(&handle.class)
            .and_then(|p| p.slots.get(handle.slot as usize))
            .ok_or_else(|| StitchError::stale_handle(handle))?;
        match (&entry.memory, &entry.state) {
            (Some(memory), SlotState::InUse) if entry.generation == handle.generation => Ok(Arc::clone(memory)),
            _ => Err(StitchError::stale_handle(handle)),
        }
    }

    /// Recycles every retiring buffer whose fence has signaled.
    pub fn collect_garbage(&self) -> StitchResult<usize> {
        let mut pools = self.lock()?;
        let collected = pools.values_mut().map(ClassPool::collect).sum();
        drop(pools);
        if collected > 0 {
            self.available.notify_all();
        }
        Ok(collected)
    }

    pub fn stats(&self, class: SizeClass) -> Option<PoolStats> {
        self.pools.lock().ok()?.get(&class).map(ClassPool::stats)
    }

    pub fn all_stats(&self) -> Vec<(SizeClass, PoolStats)> {
        let Ok(pools) = self.pools.lock() else {
            return Vec::new();
        };
        let mut stats: Vec<_> = pools.iter().map(|(c, p)| (*c, p.stats())).collect();
        stats.sort_by_key(|(c, _)| *c);
        stats
    }
}

/// Exclusive lease on one pooled buffer. Dropping the lease releases the buffer,
/// deferred behind the last fence recorded with [`BufferLease::record_use`].
pub struct BufferLease {
    handle: BufferHandle,
    memory: SlabMemory,
    len: usize,
    last_use: Mutex<Option<Fence>>,
    manager: Arc<MemoryManager>,
    released: bool,
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl BufferLease {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size_class(&self) -> SizeClass {
        self.handle.class
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Storage handle to move into a kernel.
    pub fn memory(&self) -> SlabMemory {
        Arc::clone(&self.memory)
    }

    /// Host read access; callers must have waited for the producing kernel.
    pub fn read(&self) -> StitchResult<RwLockReadGuard<'_, MmapMut>> {
        self.memory.read().map_err(|_| StitchError::poisoned("buffer"))
    }

    /// Notes that a kernel submitted with `fence` accesses this buffer.
    pub fn record_use(&self, fence: &Fence) {
        if let Ok(mut last) = self.last_use.lock() {
            let newer = last.as_ref().is_none_or(|f| f.index() < fence.index());
            if newer {
                *last = Some(fence.clone());
            }
        }
    }

    /// Releases the buffer now, reporting a stale handle instead of logging it.
    pub fn release(mut self) -> StitchResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> StitchResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let fence = self.last_use.get_mut().ok().and_then(Option::take);
        self.manager.release_inner(self.handle, fence)
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, handle = ?self.handle, "buffer release failed");
        }
    }
}
