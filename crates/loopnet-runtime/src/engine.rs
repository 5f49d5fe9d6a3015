//! The engine: memory allocation and the device stream.
//!
//! An [`Engine`] is created once and shared (`Arc<Engine>`) by every
//! network and loop executor that runs on it. Allocation goes through
//! [`Engine::allocate`] so the number of buffers and bytes handed out can
//! be observed.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use loopnet_core::memory::MemoryView;
use loopnet_core::types::Layout;

use crate::config::EngineConfig;
use crate::stream::{create_stream, Stream};

pub struct Engine {
    config: EngineConfig,
    stream: Arc<dyn Stream>,
    allocations: AtomicUsize,
    allocated_bytes: AtomicUsize,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let stream = create_stream(config.queue);
        Engine {
            config,
            stream,
            allocations: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    /// An engine submitting to a caller-provided stream.
    pub fn with_stream(stream: Arc<dyn Stream>) -> Self {
        Engine {
            config: EngineConfig {
                queue: stream.kind(),
            },
            stream,
            allocations: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    /// Allocates a zeroed buffer for `layout`.
    pub fn allocate(&self, layout: Layout) -> MemoryView {
        let bytes = layout.byte_size();
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
        tracing::trace!(%layout, bytes, "allocate");
        MemoryView::allocate(layout)
    }

    /// Number of buffers allocated so far.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("allocations", &self.allocation_count())
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use loopnet_core::types::DataType;

    use super::*;
    use crate::config::QueueKind;

    #[test]
    fn counts_allocations() {
        let engine = Engine::default();
        let view = engine.allocate(Layout::new(DataType::F32, &[4]));
        engine.allocate(Layout::scalar(DataType::I64));
        assert_eq!(view.byte_len(), 16);
        assert_eq!(engine.allocation_count(), 2);
        assert_eq!(engine.allocated_bytes(), 24);
    }

    #[test]
    fn queue_kind_follows_config() {
        let engine = Engine::new(EngineConfig {
            queue: QueueKind::InOrder,
        });
        assert_eq!(engine.stream().kind(), QueueKind::InOrder);
    }
}
