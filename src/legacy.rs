//! The process-wide default heap.
//!
//! Call sites ported from C-style firmware expect three free functions instead
//! of an allocator object. This module provides them on top of a single
//! [`Allocator`] instance, whose break stays [`DEFAULT_STACK_MARGIN`] bytes
//! below the stack pointer. All functions are non-blocking: if the heap is in
//! use (e.g. by the code interrupted by the caller), they fail with
//! `Contended` (or return `None` in case of [`stats()`]).
//!
//! The default heap is only linked into the binary, if one of these functions
//! is used. Its static is all zeros, so it is placed in `.bss`: the ceiling is
//! installed by the first call instead of being part of the static.
use crate::heap::{Arena, HeapState};
use crate::{AllocError, Allocator, Ceiling, FreeError, Stats, DEFAULT_STACK_MARGIN};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// The size of the memory of the default heap in bytes.
pub const DEFAULT_HEAP_SIZE: usize = 4096;

static HEAP: Allocator<DEFAULT_HEAP_SIZE> = Allocator::new();
/// Only accessed while holding the lock of `HEAP`.
static CEILING_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Run `f` on the default heap, if it is not locked by someone else.
fn with_default_heap<R>(f: impl FnOnce(&mut HeapState, &Arena) -> R) -> Option<R> {
    HEAP.try_with_heap(|heap, arena| {
        if !CEILING_INSTALLED.load(Ordering::Relaxed) {
            heap.set_ceiling(Ceiling::below_stack(DEFAULT_STACK_MARGIN));
            CEILING_INSTALLED.store(true, Ordering::Relaxed);
        }
        f(heap, arena)
    })
}

/// Allocate a block of at least `len` bytes from the default heap.
pub fn allocate(len: usize) -> Result<NonNull<u8>, AllocError> {
    with_default_heap(|heap, arena| heap.allocate(arena, len)).unwrap_or(Err(AllocError::Contended))
}

/// Release a block of the default heap. Releasing `None` does nothing.
pub fn release(ptr: Option<NonNull<u8>>) -> Result<(), FreeError> {
    with_default_heap(|heap, arena| heap.release(arena, ptr)).unwrap_or(Err(FreeError::Contended))
}

/// Resize a block of the default heap. Resizing `None` allocates.
pub fn reallocate(ptr: Option<NonNull<u8>>, len: usize) -> Result<NonNull<u8>, AllocError> {
    with_default_heap(|heap, arena| heap.reallocate(arena, ptr, len))
        .unwrap_or(Err(AllocError::Contended))
}

/// The usage numbers of the default heap, if it is not in use.
pub fn stats() -> Option<Stats> {
    with_default_heap(|heap, arena| heap.stats(arena))
}
