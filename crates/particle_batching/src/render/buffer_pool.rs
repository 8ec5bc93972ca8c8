//! Pooled GPU buffers
//!
//! Drawers request vertex and index buffers every frame. Instead of creating
//! them each time, pools hand out buffers bucketed by power-of-two size levels
//! and recycle them once the GPU is done with them.
//!
//! # Lifecycle
//!
//! ```text
//! allocate ──> in use ──> map ──> mapped ──> unmap ──> in use
//!                 │                                       │
//!                 └──────────────── release ──────────────┘
//!                                     │
//!                       free (reusable after 2 frame ticks)
//!                                     │
//!                garbage_collect after 4 idle frame ticks ──> destroyed
//! ```
//!
//! Mapping moves the staging words out of the pool into a [`MappedBuffer`], so a
//! drawer can fill several buffers of the same pool at once. Unmapping moves
//! them back and uploads the bytes through the backend.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::foundation::collections::{BufferKey, SlotMap};
use crate::render::api::{
    BackendError, BufferDesc, BufferUsage, GpuBufferHandle, GraphicsBackend, IndexFormat,
};

/// Frame ticks a released buffer waits before it can be handed out again
pub const FRAME_TICKS_BEFORE_REUSE: u64 = 2;

/// Idle frame ticks after which `garbage_collect` destroys a free buffer
pub const GC_TICKS_BEFORE_RELEASE: u64 = 4;

/// Number of pooled size levels
pub const LEVEL_COUNT: u32 = 20;

/// Every capacity is a multiple of this
pub const BUFFER_ALIGNMENT: u32 = 0x10;

const BASE_SIZE_LOG2: u32 = 9;

/// Round up to the buffer alignment
pub const fn align16(value: u32) -> Option<u32> {
    match value.checked_add(BUFFER_ALIGNMENT - 1) {
        Some(v) => Some(v & !(BUFFER_ALIGNMENT - 1)),
        None => None,
    }
}

/// Capacity of a size level
pub const fn level_to_size(level: u32) -> u32 {
    1 << (level + BASE_SIZE_LOG2)
}

/// Smallest level whose capacity holds `size`
pub const fn size_to_level(size: u32) -> u32 {
    let log2 = if size == 0 { 0 } else { 31 - size.leading_zeros() };
    let log2 = if log2 > BASE_SIZE_LOG2 { log2 } else { BASE_SIZE_LOG2 };
    log2 - BASE_SIZE_LOG2 + 1
}

/// How many larger levels an allocation may borrow from
pub const fn level_lookahead(level: u32) -> u32 {
    LEVEL_COUNT.saturating_sub(level) / 4
}

/// Result type for pool operations
pub type BufferResult<T> = Result<T, BufferError>;

/// Buffer pool errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Zero-sized request
    #[error("Empty buffer request ({element_count} x {stride} bytes)")]
    EmptyRequest {
        /// Requested elements
        element_count: u32,
        /// Requested stride
        stride: u32,
    },

    /// Size does not fit in 32 bits
    #[error("Buffer size overflow")]
    SizeOverflow,

    /// The backend refused to create the buffer
    #[error("Buffer creation failed: {0}")]
    Creation(#[from] BackendError),

    /// The view holds no live buffer
    #[error("Buffer is not allocated")]
    NotAllocated,

    /// The buffer is GPU-written only
    #[error("Buffer is not mappable")]
    NotMappable,

    /// The buffer is already mapped
    #[error("Buffer is already mapped")]
    AlreadyMapped,

    /// The buffer is mapped and cannot be resized
    #[error("Buffer is mapped and cannot be resized")]
    ResizeWhileMapped,

    /// Mapping would go past the capacity
    #[error("Mapping {requested} bytes exceeds the {capacity}-byte capacity")]
    ExceedsCapacity {
        /// Aligned mapped size
        requested: u32,
        /// Buffer capacity
        capacity: u32,
    },

    /// Mapped element type does not match the allocation stride
    #[error("Element size {element} does not match stride {stride}")]
    StrideMismatch {
        /// Size of the mapped type
        element: u32,
        /// Allocation stride
        stride: u32,
    },
}

/// Vertex or index pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Sizes are in bytes
    Vertex,
    /// Sizes are in indices
    Index,
}

/// A drawer's handle on a pooled buffer
///
/// Views are not `Clone`: releasing a copy could free a buffer that was
/// already handed to someone else.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PooledBuffer {
    key: Option<BufferKey>,
    handle: Option<GpuBufferHandle>,
    element_count: u32,
    stride: u32,
    capacity_in_bytes: u32,
    large_indices: bool,
}

impl PooledBuffer {
    /// Empty view
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the view holds a buffer
    pub const fn is_valid(&self) -> bool {
        self.key.is_some()
    }

    /// Backend handle
    pub const fn handle(&self) -> Option<GpuBufferHandle> {
        self.handle
    }

    /// Allocated element count
    pub const fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Element stride in bytes
    pub const fn stride(&self) -> u32 {
        self.stride
    }

    /// Bytes covered by the allocation
    pub const fn size_in_bytes(&self) -> u32 {
        self.element_count * self.stride
    }

    /// Capacity of the underlying buffer
    pub const fn capacity_in_bytes(&self) -> u32 {
        self.capacity_in_bytes
    }

    /// Whether the indices are 32-bit
    pub const fn large_indices(&self) -> bool {
        self.large_indices
    }

    /// Index format of an index view
    pub const fn index_format(&self) -> IndexFormat {
        if self.large_indices {
            IndexFormat::U32
        } else {
            IndexFormat::U16
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Staging memory of a mapped buffer
///
/// Hand it back with [`BufferPool::unmap`] to upload the contents.
#[derive(Debug)]
pub struct MappedBuffer<T: Pod> {
    key: BufferKey,
    words: Vec<u32>,
    len_in_bytes: usize,
    _element: PhantomData<T>,
}

impl<T: Pod> MappedBuffer<T> {
    /// Typed view over the mapped elements
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.words.as_mut_slice());
        bytemuck::try_cast_slice_mut(&mut bytes[..self.len_in_bytes]).unwrap_or_default()
    }

    /// Mapped element count
    pub fn len(&self) -> usize {
        self.len_in_bytes / std::mem::size_of::<T>().max(1)
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mapped index buffer in its native format
#[derive(Debug)]
pub enum MappedIndices {
    /// 16-bit indices
    U16(MappedBuffer<u16>),
    /// 32-bit indices
    U32(MappedBuffer<u32>),
}

impl MappedIndices {
    /// Write one index
    pub fn set(&mut self, position: usize, value: u32) {
        match self {
            Self::U16(buffer) => {
                if let Some(slot) = buffer.as_mut_slice().get_mut(position) {
                    *slot = value as u16;
                }
            }
            Self::U32(buffer) => {
                if let Some(slot) = buffer.as_mut_slice().get_mut(position) {
                    *slot = value;
                }
            }
        }
    }

    /// Index count
    pub fn len(&self) -> usize {
        match self {
            Self::U16(buffer) => buffer.len(),
            Self::U32(buffer) => buffer.len(),
        }
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers alive in the backend
    pub live_buffers: usize,
    /// Bytes alive in the backend
    pub live_bytes: u64,
    /// Buffers handed out and not yet released
    pub in_use: usize,
    /// Buffers created
    pub created: u64,
    /// Free buffers handed out again
    pub reused: u64,
    /// Allocations satisfied by the view's current buffer
    pub kept: u64,
    /// Buffers destroyed by garbage collection
    pub collected: u64,
}

#[derive(Debug)]
struct PoolEntry {
    handle: GpuBufferHandle,
    level: Option<u32>,
    capacity_units: u32,
    capacity_in_bytes: u32,
    large_indices: bool,
    staging: Vec<u32>,
    mapped: bool,
    in_use: bool,
    released_tick: u64,
}

/// Size-bucketed pool of GPU buffers
#[derive(Debug)]
pub struct BufferPool {
    name: &'static str,
    kind: BufferKind,
    usage: BufferUsage,
    entries: SlotMap<BufferKey, PoolEntry>,
    tick: u64,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a vertex pool; `usage` adds shader bindings on top of vertex input
    pub fn vertex(name: &'static str, usage: BufferUsage) -> Self {
        Self::new(name, BufferKind::Vertex, usage | BufferUsage::VERTEX)
    }

    /// Create an index pool
    pub fn index(name: &'static str, usage: BufferUsage) -> Self {
        Self::new(name, BufferKind::Index, usage | BufferUsage::INDEX)
    }

    fn new(name: &'static str, kind: BufferKind, usage: BufferUsage) -> Self {
        log::debug!("Created {:?} buffer pool '{}' ({:?})", kind, name, usage);
        Self {
            name,
            kind,
            usage,
            entries: SlotMap::with_key(),
            tick: 0,
            stats: PoolStats::default(),
        }
    }

    /// Pool name used in logs
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether CPU mapping is allowed
    pub const fn is_mappable(&self) -> bool {
        !self.usage.contains(BufferUsage::UNORDERED_ACCESS)
    }

    /// Current statistics
    pub const fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Allocate `element_count` elements of `stride` bytes into `view`
    ///
    /// With `persistent`, the view keeps its current buffer when it is large
    /// enough; otherwise the buffer goes back to the pool first.
    pub fn allocate(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        view: &mut PooledBuffer,
        element_count: u32,
        stride: u32,
        persistent: bool,
    ) -> BufferResult<()> {
        let bytes = element_count
            .checked_mul(stride)
            .ok_or(BufferError::SizeOverflow)?;
        if bytes == 0 {
            return Err(BufferError::EmptyRequest { element_count, stride });
        }
        let units = match self.kind {
            BufferKind::Vertex => align16(bytes).ok_or(BufferError::SizeOverflow)?,
            BufferKind::Index => align16(element_count).ok_or(BufferError::SizeOverflow)?,
        };

        if !self.keep_current(view, units, persistent)? {
            let key = self.acquire(backend, units)?;
            self.bind(view, key);
        }
        view.element_count = element_count;
        view.stride = match self.kind {
            BufferKind::Vertex => stride,
            BufferKind::Index => {
                if view.large_indices {
                    4
                } else {
                    2
                }
            }
        };
        Ok(())
    }

    /// Allocate only when `condition` holds; otherwise release the view and succeed
    pub fn allocate_if(
        &mut self,
        condition: bool,
        backend: &mut dyn GraphicsBackend,
        view: &mut PooledBuffer,
        element_count: u32,
        stride: u32,
        persistent: bool,
    ) -> BufferResult<()> {
        if condition {
            self.allocate(backend, view, element_count, stride, persistent)
        } else {
            self.release(view);
            Ok(())
        }
    }

    /// Allocate `index_count` indices; the pool picks the index format
    pub fn allocate_indices(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        view: &mut PooledBuffer,
        index_count: u32,
        persistent: bool,
    ) -> BufferResult<()> {
        self.allocate(backend, view, index_count, 2, persistent)
    }

    /// Map the whole allocation of `view`
    pub fn map<T: Pod>(&mut self, view: &PooledBuffer) -> BufferResult<MappedBuffer<T>> {
        let key = view.key.ok_or(BufferError::NotAllocated)?;
        if !self.is_mappable() {
            return Err(BufferError::NotMappable);
        }
        let entry = self
            .entries
            .get_mut(key)
            .filter(|entry| entry.in_use)
            .ok_or(BufferError::NotAllocated)?;
        if entry.mapped {
            return Err(BufferError::AlreadyMapped);
        }
        let element = std::mem::size_of::<T>() as u32;
        if element != view.stride || std::mem::align_of::<T>() > std::mem::align_of::<u32>() {
            return Err(BufferError::StrideMismatch {
                element,
                stride: view.stride,
            });
        }
        let len_in_bytes = view.size_in_bytes();
        let requested = align16(len_in_bytes).ok_or(BufferError::SizeOverflow)?;
        if requested > entry.capacity_in_bytes {
            return Err(BufferError::ExceedsCapacity {
                requested,
                capacity: entry.capacity_in_bytes,
            });
        }

        let mut words = std::mem::take(&mut entry.staging);
        let word_count = (entry.capacity_in_bytes / 4) as usize;
        if words.len() < word_count {
            words.resize(word_count, 0);
        }
        entry.mapped = true;
        Ok(MappedBuffer {
            key,
            words,
            len_in_bytes: len_in_bytes as usize,
            _element: PhantomData,
        })
    }

    /// Map an index view in its native format
    pub fn map_indices(&mut self, view: &PooledBuffer) -> BufferResult<MappedIndices> {
        if view.large_indices {
            self.map::<u32>(view).map(MappedIndices::U32)
        } else {
            self.map::<u16>(view).map(MappedIndices::U16)
        }
    }

    /// Upload and unmap a mapped buffer
    ///
    /// Buffers released while mapped are dropped without upload.
    pub fn unmap<T: Pod>(&mut self, backend: &mut dyn GraphicsBackend, mapped: MappedBuffer<T>) {
        let Some(entry) = self.entries.get_mut(mapped.key) else {
            return;
        };
        if !entry.mapped || !entry.in_use {
            entry.mapped = false;
            return;
        }
        let upload_len = (align16(mapped.len_in_bytes as u32).unwrap_or(0) as usize)
            .min(mapped.words.len() * 4);
        let bytes: &[u8] = bytemuck::cast_slice(mapped.words.as_slice());
        if let Err(err) = backend.write_buffer(entry.handle, 0, &bytes[..upload_len]) {
            log::warn!("Upload to pooled buffer in '{}' failed: {}", self.name, err);
        }
        entry.staging = mapped.words;
        entry.mapped = false;
    }

    /// Unmap an index buffer
    pub fn unmap_indices(&mut self, backend: &mut dyn GraphicsBackend, mapped: MappedIndices) {
        match mapped {
            MappedIndices::U16(buffer) => self.unmap(backend, buffer),
            MappedIndices::U32(buffer) => self.unmap(backend, buffer),
        }
    }

    /// Return the buffer of `view` to the unmapped state without uploading
    ///
    /// No-op for unmapped or empty views.
    pub fn unmap_view(&mut self, view: &PooledBuffer) {
        if let Some(entry) = view.key.and_then(|key| self.entries.get_mut(key)) {
            entry.mapped = false;
        }
    }

    /// Unmap and release in one go
    pub fn unmap_and_clear(&mut self, view: &mut PooledBuffer) {
        self.unmap_view(view);
        self.release(view);
    }

    /// Whether the buffer of `view` is mapped
    pub fn is_mapped(&self, view: &PooledBuffer) -> bool {
        view.key
            .and_then(|key| self.entries.get(key))
            .is_some_and(|entry| entry.mapped)
    }

    /// Give the buffer of `view` back to the pool and empty the view
    pub fn release(&mut self, view: &mut PooledBuffer) {
        if let Some(entry) = view.key.and_then(|key| self.entries.get_mut(key)) {
            if entry.in_use {
                entry.in_use = false;
                entry.mapped = false;
                entry.released_tick = self.tick;
                self.stats.in_use = self.stats.in_use.saturating_sub(1);
            }
        }
        view.clear();
    }

    /// Advance the frame counter
    pub fn frame_tick(&mut self) {
        self.tick += 1;
    }

    /// Destroy free buffers idle for at least [`GC_TICKS_BEFORE_RELEASE`] ticks
    pub fn garbage_collect(&mut self, backend: &mut dyn GraphicsBackend) -> usize {
        let tick = self.tick;
        let expired: Vec<BufferKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.in_use && tick >= entry.released_tick + GC_TICKS_BEFORE_RELEASE)
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            if let Some(entry) = self.entries.remove(*key) {
                backend.release_buffer(entry.handle);
                self.stats.live_buffers -= 1;
                self.stats.live_bytes -= u64::from(entry.capacity_in_bytes);
                self.stats.collected += 1;
            }
        }
        if !expired.is_empty() {
            log::debug!(
                "Pool '{}' collected {} idle buffers ({} still alive)",
                self.name,
                expired.len(),
                self.stats.live_buffers
            );
        }
        expired.len()
    }

    /// Destroy every buffer, in use or not
    pub fn destroy_all(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, entry) in self.entries.drain() {
            backend.release_buffer(entry.handle);
        }
        self.stats.live_buffers = 0;
        self.stats.live_bytes = 0;
        self.stats.in_use = 0;
    }

    fn keep_current(&mut self, view: &mut PooledBuffer, units: u32, persistent: bool) -> BufferResult<bool> {
        if let Some(entry) = view.key.and_then(|key| self.entries.get(key)) {
            if entry.in_use {
                if entry.mapped {
                    return Err(BufferError::ResizeWhileMapped);
                }
                if persistent && entry.capacity_units >= units {
                    self.stats.kept += 1;
                    return Ok(true);
                }
            }
        }
        self.release(view);
        Ok(false)
    }

    fn acquire(&mut self, backend: &mut dyn GraphicsBackend, units: u32) -> BufferResult<BufferKey> {
        let level = size_to_level(units);
        if level < LEVEL_COUNT {
            let max_level = level + level_lookahead(level);
            let tick = self.tick;
            let best = self
                .entries
                .iter()
                .filter(|(_, entry)| !entry.in_use && tick >= entry.released_tick + FRAME_TICKS_BEFORE_REUSE)
                .filter_map(|(key, entry)| {
                    entry
                        .level
                        .filter(|l| (level..=max_level).contains(l))
                        .map(|l| (l, key))
                })
                .min_by_key(|(l, _)| *l);

            if let Some((_, key)) = best {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.in_use = true;
                    self.stats.reused += 1;
                    self.stats.in_use += 1;
                    return Ok(key);
                }
            }
            self.create(backend, level_to_size(level), Some(level))
        } else {
            let exact = align16(units).ok_or(BufferError::SizeOverflow)?;
            self.create(backend, exact, None)
        }
    }

    fn create(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        capacity_units: u32,
        level: Option<u32>,
    ) -> BufferResult<BufferKey> {
        let large_indices = self.kind == BufferKind::Index
            && (capacity_units > 0xFFFF || self.usage.contains(BufferUsage::UNORDERED_ACCESS));
        let (capacity_in_bytes, stride) = match self.kind {
            BufferKind::Vertex => (capacity_units, 4),
            BufferKind::Index => {
                let format = if large_indices { IndexFormat::U32 } else { IndexFormat::U16 };
                let bytes = capacity_units
                    .checked_mul(format.size_in_bytes())
                    .ok_or(BufferError::SizeOverflow)?;
                (bytes, format.size_in_bytes())
            }
        };
        let desc = BufferDesc {
            size_in_bytes: capacity_in_bytes,
            usage: self.usage,
            stride,
        };
        let handle = backend.create_buffer(&desc).map_err(|err| {
            log::warn!("Pool '{}' failed to create a {}-byte buffer: {}", self.name, capacity_in_bytes, err);
            BufferError::Creation(err)
        })?;

        self.stats.created += 1;
        self.stats.live_buffers += 1;
        self.stats.in_use += 1;
        self.stats.live_bytes += u64::from(capacity_in_bytes);
        log::trace!(
            "Pool '{}' created buffer {:?} ({} bytes, level {:?})",
            self.name,
            handle,
            capacity_in_bytes,
            level
        );

        Ok(self.entries.insert(PoolEntry {
            handle,
            level,
            capacity_units,
            capacity_in_bytes,
            large_indices,
            staging: Vec::new(),
            mapped: false,
            in_use: true,
            released_tick: self.tick,
        }))
    }

    fn bind(&self, view: &mut PooledBuffer, key: BufferKey) {
        if let Some(entry) = self.entries.get(key) {
            view.key = Some(key);
            view.handle = Some(entry.handle);
            view.capacity_in_bytes = entry.capacity_in_bytes;
            view.large_indices = entry.large_indices;
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::warn!(
                "Buffer pool '{}' dropped with {} live buffers; destroy_all was not called",
                self.name,
                self.entries.len()
            );
        }
    }
}

/// The five pools owned by the render side of the batch manager
#[derive(Debug)]
pub struct BufferPools {
    /// Mappable vertex buffers
    pub vb: BufferPool,
    /// Mappable index buffers
    pub ib: BufferPool,
    /// Simulation data read by vertex billboarding
    pub vb_vertex_bb: BufferPool,
    /// GPU-written vertex buffers
    pub vb_gpu: BufferPool,
    /// GPU-written index buffers
    pub ib_gpu: BufferPool,
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPools {
    /// Create the five pools
    pub fn new() -> Self {
        let gpu = BufferUsage::UNORDERED_ACCESS | BufferUsage::SHADER_RESOURCE | BufferUsage::BYTE_ADDRESS;
        log::info!("Created particle buffer pools (vb, ib, vb_vertex_bb, vb_gpu, ib_gpu)");
        Self {
            vb: BufferPool::vertex("vb", BufferUsage::empty()),
            ib: BufferPool::index("ib", BufferUsage::empty()),
            vb_vertex_bb: BufferPool::vertex("vb_vertex_bb", BufferUsage::SHADER_RESOURCE),
            vb_gpu: BufferPool::vertex("vb_gpu", gpu),
            ib_gpu: BufferPool::index("ib_gpu", gpu),
        }
    }

    fn each_mut(&mut self) -> [&mut BufferPool; 5] {
        [
            &mut self.vb,
            &mut self.ib,
            &mut self.vb_vertex_bb,
            &mut self.vb_gpu,
            &mut self.ib_gpu,
        ]
    }

    /// Advance every pool's frame counter
    pub fn frame_tick(&mut self) {
        for pool in self.each_mut() {
            pool.frame_tick();
        }
    }

    /// Collect idle buffers in every pool
    pub fn garbage_collect(&mut self, backend: &mut dyn GraphicsBackend) -> usize {
        self.each_mut()
            .into_iter()
            .map(|pool| pool.garbage_collect(backend))
            .sum()
    }

    /// Destroy every buffer of every pool
    pub fn destroy_all(&mut self, backend: &mut dyn GraphicsBackend) {
        for pool in self.each_mut() {
            pool.destroy_all(backend);
        }
        log::info!("Destroyed particle buffer pools");
    }

    /// Buffers alive across all pools
    pub fn live_buffers(&self) -> usize {
        [&self.vb, &self.ib, &self.vb_vertex_bb, &self.vb_gpu, &self.ib_gpu]
            .iter()
            .map(|pool| pool.stats().live_buffers)
            .sum()
    }
}
