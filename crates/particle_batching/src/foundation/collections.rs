//! Keyed collections
//!
//! Renderer caches and pooled buffers are addressed by generational slot-map
//! keys so a stale key can never alias a recycled entry.

pub use slotmap::{SecondaryMap, SlotMap};

slotmap::new_key_type! {
    /// Key of a renderer cache, shared by the update and render threads
    pub struct CacheKey;

    /// Key of a GPU buffer owned by a buffer pool
    pub struct BufferKey;
}
