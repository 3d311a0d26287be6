/// Engine configuration.
///
/// The C lineage of this engine configured itself through a preprocessor
/// tangle; here the same axes collapse into one `EngineConfig` consulted at
/// run time plus a handful of hard constants. `CONFIG` is the build the crate
/// ships with; per-context knobs (heap budget, stack limit, debug tracing)
/// live in `ContextOptions`.

use crate::platform::{DefaultPort, Port};
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Hard constants
// ---------------------------------------------------------------------------

/// Alignment granule of the managed heap. Compressed pointers address the
/// heap in units of this many bytes.
pub const HEAP_GRANULE: usize = 8;

/// Compressed pointers are packed into value words with this many usable
/// bits. Heaps larger than `2^CP_BITS * HEAP_GRANULE` bytes are rejected at
/// context init.
pub const CP_BITS: u32 = 27;

/// Direct recursion depth of the GC marker before deeper chains spill onto
/// the explicit worklist.
pub const GC_MARK_LIMIT: u32 = 8;

/// A LOW-pressure collection runs only if at least `heap / GC_NEW_OBJECTS_FRACTION`
/// bytes were allocated since the previous collection.
pub const GC_NEW_OBJECTS_FRACTION: usize = 32;

/// Property-pair chains longer than this get a hashmap index attached.
pub const PROP_HASHMAP_THRESHOLD: usize = 32;

/// Entries in the direct-mapped property lookup cache.
pub const LOOKUP_CACHE_SIZE: usize = 128;

/// The halt callback is polled once per this many dispatched opcodes.
pub const VM_EXEC_STOP_INTERVAL: u32 = 16;

/// A write this far past the end of a fast array converts it to the sparse
/// representation instead of filling with holes.
pub const FAST_ARRAY_MAX_GAP: u32 = 32;

/// Default managed heap budget in bytes.
pub const DEFAULT_HEAP_LIMIT: usize = 512 * 1024;

/// Default bound on VM stack slots (operands + frame bookkeeping).
pub const DEFAULT_VM_STACK_LIMIT: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Compile-time axes
// ---------------------------------------------------------------------------

/// Width of compressed pointers. The 16-bit flavour caps the heap at 512 KiB
/// (65536 granules); the 32-bit flavour is capped by `CP_BITS` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpWidth {
    Cp16,
    Cp32,
}

impl CpWidth {
    pub fn max_heap_bytes(self) -> usize {
        match self {
            CpWidth::Cp16 => (1usize << 16) * HEAP_GRANULE,
            CpWidth::Cp32 => (1usize << CP_BITS) * HEAP_GRANULE,
        }
    }
}

/// The feature axes of a build. One `const` instance (`CONFIG`) stands in for
/// the original's per-feature preprocessor switches.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub cp_width: CpWidth,
    /// Parser included; with `false` only snapshot execution can produce code.
    pub parser: bool,
    pub modules: bool,
    pub promises: bool,
    pub proxy: bool,
    pub bigint: bool,
    pub error_messages: bool,
    pub line_info: bool,
    pub snapshot_save: bool,
    pub snapshot_exec: bool,
    pub property_hashmap: bool,
    pub lookup_cache: bool,
}

impl EngineConfig {
    pub const DEFAULT: EngineConfig = EngineConfig {
        cp_width: CpWidth::Cp32,
        parser: true,
        modules: true,
        promises: true,
        proxy: true,
        bigint: false,
        error_messages: true,
        line_info: true,
        snapshot_save: true,
        snapshot_exec: true,
        property_hashmap: true,
        lookup_cache: true,
    };
}

/// The active build configuration.
pub const CONFIG: EngineConfig = EngineConfig::DEFAULT;

// ---------------------------------------------------------------------------
// Per-context options
// ---------------------------------------------------------------------------

/// An embedder-supplied heap buffer. The engine books allocations against
/// `capacity` and calls `on_free` exactly once when the context is destroyed.
pub struct ExternalHeap {
    pub capacity: usize,
    pub on_free: Option<Box<dyn FnOnce()>>,
}

impl std::fmt::Debug for ExternalHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalHeap")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Options for [`crate::Context::new`].
pub struct ContextOptions {
    /// Managed heap budget in bytes. Ignored when `external_heap` is set.
    pub heap_limit: usize,
    /// Optional embedder-owned heap buffer.
    pub external_heap: Option<ExternalHeap>,
    /// Bound on VM stack slots.
    pub vm_stack_limit: usize,
    /// Force a full collection before every allocation (debug aid, the
    /// moral equivalent of `MEM_GC_BEFORE_EACH_ALLOC`).
    pub gc_before_each_alloc: bool,
    /// Emit GC trace lines through the port log.
    pub gc_debug: bool,
    /// Host port vtable.
    pub port: Rc<dyn Port>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            heap_limit: DEFAULT_HEAP_LIMIT,
            external_heap: None,
            vm_stack_limit: DEFAULT_VM_STACK_LIMIT,
            gc_before_each_alloc: false,
            gc_debug: false,
            port: Rc::new(DefaultPort),
        }
    }
}

impl ContextOptions {
    /// Effective heap budget after accounting for an external buffer.
    pub fn effective_heap_limit(&self) -> usize {
        match &self.external_heap {
            Some(ext) => ext.capacity,
            None => self.heap_limit,
        }
    }

    /// Reject option combinations the engine cannot honor. The external
    /// buffer size is only checkable here, at init.
    pub fn validate(&self) -> Result<(), &'static str> {
        let limit = self.effective_heap_limit();
        if limit == 0 {
            return Err("heap limit must be non-zero");
        }
        if limit > CONFIG.cp_width.max_heap_bytes() {
            return Err("heap exceeds compressed pointer range");
        }
        if self.vm_stack_limit < 64 {
            return Err("vm stack limit too small");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(ContextOptions::default().validate().is_ok());
    }

    #[test]
    fn oversized_external_heap_rejected() {
        let opts = ContextOptions {
            external_heap: Some(ExternalHeap {
                capacity: CONFIG.cp_width.max_heap_bytes() + 1,
                on_free: None,
            }),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn zero_heap_rejected() {
        let opts = ContextOptions {
            heap_limit: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
