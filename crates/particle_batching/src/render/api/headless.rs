//! Recording backend
//!
//! Keeps buffer contents in host memory and records every dispatch and draw
//! call. The recording is shared behind a mutex so it can still be inspected
//! after the backend moved to the render thread.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::render_backend::{
    BackendError, BackendResult, BufferDesc, ComputeDispatch, DrawCall, GpuBufferHandle, GraphicsBackend,
};

/// Host copy of a backend buffer
#[derive(Debug, Clone)]
pub struct HeadlessBuffer {
    /// Creation parameters
    pub desc: BufferDesc,
    /// Current contents
    pub data: Vec<u8>,
}

/// Everything the headless backend saw
#[derive(Debug, Default)]
pub struct HeadlessRecording {
    /// Live buffers
    pub buffers: HashMap<GpuBufferHandle, HeadlessBuffer>,
    /// Submitted draw calls, in order
    pub draws: Vec<DrawCall>,
    /// Issued compute dispatches, in order
    pub dispatches: Vec<ComputeDispatch>,
    /// Buffers created so far
    pub created_buffers: u64,
    /// Buffers released so far
    pub released_buffers: u64,
    /// Buffer uploads so far
    pub writes: u64,
}

impl HeadlessRecording {
    /// Number of buffers currently alive
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Contents of a live buffer
    pub fn buffer_data(&self, handle: GpuBufferHandle) -> Option<&[u8]> {
        self.buffers.get(&handle).map(|buffer| buffer.data.as_slice())
    }

    /// Drain the recorded draw calls
    pub fn take_draws(&mut self) -> Vec<DrawCall> {
        std::mem::take(&mut self.draws)
    }
}

/// Backend that records instead of rendering
#[derive(Debug)]
pub struct HeadlessBackend {
    recording: Arc<Mutex<HeadlessRecording>>,
    next_handle: u64,
    vertex_billboarding: bool,
    max_buffer_size: Option<u32>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Create a backend that supports vertex billboarding
    pub fn new() -> Self {
        Self {
            recording: Arc::new(Mutex::new(HeadlessRecording::default())),
            next_handle: 1,
            vertex_billboarding: true,
            max_buffer_size: None,
        }
    }

    /// Toggle reported vertex billboarding support
    #[must_use]
    pub const fn with_vertex_billboarding(mut self, supported: bool) -> Self {
        self.vertex_billboarding = supported;
        self
    }

    /// Refuse to create buffers larger than `size_in_bytes`
    #[must_use]
    pub const fn with_max_buffer_size(mut self, size_in_bytes: u32) -> Self {
        self.max_buffer_size = Some(size_in_bytes);
        self
    }

    /// Shared handle on the recording
    pub fn recording(&self) -> Arc<Mutex<HeadlessRecording>> {
        Arc::clone(&self.recording)
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> BackendResult<GpuBufferHandle> {
        if let Some(max) = self.max_buffer_size {
            if desc.size_in_bytes > max {
                return Err(BackendError::BufferCreation {
                    size_in_bytes: u64::from(desc.size_in_bytes),
                    reason: format!("exceeds the {max}-byte limit"),
                });
            }
        }
        let handle = GpuBufferHandle(self.next_handle);
        self.next_handle += 1;

        let mut recording = self.recording.lock();
        recording.buffers.insert(
            handle,
            HeadlessBuffer {
                desc: *desc,
                data: vec![0; desc.size_in_bytes as usize],
            },
        );
        recording.created_buffers += 1;
        Ok(handle)
    }

    fn release_buffer(&mut self, handle: GpuBufferHandle) {
        let mut recording = self.recording.lock();
        if recording.buffers.remove(&handle).is_some() {
            recording.released_buffers += 1;
        }
    }

    fn write_buffer(&mut self, handle: GpuBufferHandle, offset: u32, data: &[u8]) -> BackendResult<()> {
        let mut recording = self.recording.lock();
        let buffer = recording
            .buffers
            .get_mut(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.data.len() {
            return Err(BackendError::WriteOutOfBounds {
                buffer: handle,
                offset,
                len: data.len(),
            });
        }
        buffer.data[start..end].copy_from_slice(data);
        recording.writes += 1;
        Ok(())
    }

    fn dispatch(&mut self, dispatch: &ComputeDispatch) -> BackendResult<()> {
        self.recording.lock().dispatches.push(dispatch.clone());
        Ok(())
    }

    fn submit_draw(&mut self, draw: DrawCall) -> BackendResult<()> {
        self.recording.lock().draws.push(draw);
        Ok(())
    }

    fn supports_vertex_billboarding(&self) -> bool {
        self.vertex_billboarding
    }
}
