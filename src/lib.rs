//! Break-based free-list allocator for embedded systems
//!
//! This crate provides a heap, which carves memory out of a contiguous region
//! by moving a _break_ upwards, and keeps released chunks in an address-ordered
//! free list for reuse. It is meant as the single dynamic memory allocator of a
//! firmware: every `alloc`-collection, driver object or string ends up here.
//!
//! There are two entry points:
//! - [`Allocator`] owns a statically sized buffer and implements the
//!   [`core::alloc::GlobalAlloc`]-trait, so it can be used as the
//!   `#[global_allocator]` on `#![no_std]`-targets.
//! - [`Heap`] manages a borrowed (or platform provided) memory region and is
//!   passed around explicitly. It requires exclusive access for every
//!   operation, therefore it needs no locking at all.
//!
//! # Usage
//! Copy and paste the following code snippet into your binary crate and adjust
//! the number of bytes of the heap (here 4K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: brkalloc::Allocator<4096> = brkalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! If the heap shares the memory with the stack, limit the growth of the heap
//! to the stack pointer minus a safety margin instead:
//! ```no_run
//! use brkalloc::{Allocator, Ceiling, DEFAULT_STACK_MARGIN};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<4096> = Allocator::with_ceiling(Ceiling::below_stack(DEFAULT_STACK_MARGIN));
//! ```
//!
//! # Interrupts
//! The heap itself is not reentrant. [`Allocator`] guards it with a spin lock,
//! which would dead-lock, if an interrupt handler allocates while the
//! interrupted code holds the lock. Interrupt handlers therefore have to use
//! the non-blocking methods [`Allocator::try_allocate()`],
//! [`Allocator::try_release()`] and [`Allocator::try_reallocate()`], which fail
//! with `Contended` instead of waiting.
//!
//! # Implementation
//! Every chunk consists of a header of one machine word (the payload size) and
//! the payload, which is at least one word large. The examples below use a
//! word size of 4 bytes.
//! 1.  We start with an empty heap: nothing is carved out, the break (`^`) is
//!     at the start of the memory.
//!     ```text
//!     .... .... .... .... .... .... .... ....
//!     ^
//!     ```
//! 2.  Blocks of 8, 4 and 8 bytes are allocated. The free list is empty, so
//!     each of them is carved out of the virgin memory at the break.
//!     ```text
//!     xxxx 0000 0000 yyyy 0000 zzzz 0000 0000 ....
//!     ^--- ^-------- ^--- ^--- ^--- ^-------- ^
//!     USED size = 8  USED size USED size = 8
//!     ```
//! 3.  The first block is released. It is not at the top of the heap, so it is
//!     put into the free list. Its first payload word now holds the link to
//!     the next free chunk (there is none).
//!     ```text
//!     xxxx 0000 0000 yyyy 0000 zzzz 0000 0000 ....
//!     ^--- ^-------- ^--- ^--- ^--- ^-------- ^
//!     FREE size = 8  USED size USED size = 8
//!     ```
//! 4.  The third block is released. It ends exactly at the break, so instead
//!     of being listed it is given back to virgin memory: the break moves down.
//!     ```text
//!     xxxx 0000 0000 yyyy 0000 .... .... ....
//!     ^--- ^-------- ^--- ^--- ^
//!     FREE size = 8  USED size
//!     ```
//! 5.  A block of 4 bytes is requested. There is no free chunk of exactly that
//!     size, but the free chunk of 8 is large enough. Its remainder of 4 bytes
//!     could not hold a header and a link, so the whole chunk is handed out.
//!     Had the remainder been large enough, the _upper_ part would be handed
//!     out and the lower part would stay in the free list with a reduced size.
//! 6.  The first and then the second block are released. The second one is
//!     adjacent to the free first one, so the two are merged into one chunk.
//!     The merged chunk ends at the break, therefore the whole heap is given
//!     back to virgin memory and the free list is empty again.
//!
//! Reallocation prefers to stay in place: a shrunk block gives its tail back
//! (if the tail can form a chunk), a grown block absorbs the free chunk right
//! behind it or moves the break if it is the top of the heap. Only otherwise
//! the contents are moved to a newly allocated block.
#![no_std]

#[cfg(test)]
extern crate std;

/// Log a placement decision (compiled out without the `log`-feature).
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        log::trace!(target: "brkalloc", $($arg)+);
    };
}

/// Log a failed operation (compiled out without the `log`-feature).
macro_rules! warn {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        log::warn!(target: "brkalloc", $($arg)+);
    };
}

mod heap;
pub mod legacy;

pub use heap::{
    stack_pointer, AllocError, Block, Blocks, Ceiling, FreeError, Heap, Stats, DEFAULT_STACK_MARGIN,
    HEADER_SIZE, MIN_CHUNK_SIZE,
};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use heap::{Arena, Buffer, HeapState, WORD};

/// The alignment of every pointer handed out by the heap.
///
/// [`Allocator`] serves larger alignments by over-allocating.
pub const ALIGNMENT: usize = WORD;

/// The memory allocator for embedded systems.
///
/// This is an allocator with a predefined heap size. The heap memory is a part
/// of the allocator itself, therefore the heap memory usage is statically
/// limited to an upper value and is counted to the static memory (the
/// `.bss`-section). Optionally the growth of the heap can additionally be
/// limited by a [`Ceiling`], e.g. to keep a distance to the stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The memory size of the heap is `4096` or 4K in this
/// example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: brkalloc::Allocator<4096> = brkalloc::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for
/// recommendations on the usage from interrupt handlers.
pub struct Allocator<const N: usize> {
    buffer: Buffer<N>,
    state: spin::Mutex<HeapState>,
}
// SAFETY: the buffer is only accessed while holding the lock of `state` (or by
// the holders of the pointers handed out, which is the point of an allocator).
unsafe impl<const N: usize> Sync for Allocator<N> {}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`], which may use its whole buffer.
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is less
    /// than two minimal chunks or not divisible by the word size.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self::with_ceiling(Ceiling::ArenaEnd)
    }

    /// Create a new [`Allocator`], whose break may not reach the given
    /// ceiling.
    ///
    /// Only [`Ceiling::ArenaEnd`] is all zeros. A static created with any
    /// other ceiling is placed in `.data` together with its whole buffer.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N` is less
    /// than two minimal chunks or not divisible by the word size.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn with_ceiling(ceiling: Ceiling) -> Self {
        assert!(N >= 2 * MIN_CHUNK_SIZE, "too small heap memory");
        assert!(N % WORD == 0, "memory size has to be divisible by the word size");
        Self {
            buffer: Buffer::new(),
            state: spin::Mutex::new(HeapState::new(ceiling)),
        }
    }

    /// Run `f` on the heap, waiting for the lock if necessary.
    fn with_heap<R>(&self, f: impl FnOnce(&mut HeapState, &Arena) -> R) -> R {
        let mut state = self.state.lock();
        // SAFETY: the arena is only used while the lock is held
        let arena = unsafe { self.buffer.arena() };
        f(&mut state, &arena)
    }

    /// Run `f` on the heap, if the heap is not locked by someone else.
    pub(crate) fn try_with_heap<R>(&self, f: impl FnOnce(&mut HeapState, &Arena) -> R) -> Option<R> {
        let mut state = self.state.try_lock()?;
        // SAFETY: the arena is only used while the lock is held
        let arena = unsafe { self.buffer.arena() };
        Some(f(&mut state, &arena))
    }

    /// Allocate a block of at least `len` bytes without waiting for the lock.
    pub fn try_allocate(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.try_with_heap(|heap, arena| heap.allocate(arena, len))
            .unwrap_or(Err(AllocError::Contended))
    }

    /// Release a block without waiting for the lock. Releasing `None` is a
    /// no-op (which might still report `Contended`).
    pub fn try_release(&self, ptr: Option<NonNull<u8>>) -> Result<(), FreeError> {
        self.try_with_heap(|heap, arena| heap.release(arena, ptr))
            .unwrap_or(Err(FreeError::Contended))
    }

    /// Resize a block without waiting for the lock. On failure (including
    /// `Contended`) the block is left untouched.
    pub fn try_reallocate(&self, ptr: Option<NonNull<u8>>, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.try_with_heap(|heap, arena| heap.reallocate(arena, ptr, len))
            .unwrap_or(Err(AllocError::Contended))
    }

    /// Collect the current usage numbers of the heap.
    pub fn stats(&self) -> Stats {
        self.with_heap(|heap, arena| heap.stats(arena))
    }

    /// Collect the current usage numbers of the heap without waiting for the
    /// lock. Returns `None` if the heap is in use.
    pub fn try_stats(&self) -> Option<Stats> {
        self.try_with_heap(|heap, arena| heap.stats(arena))
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
impl<const N: usize> Allocator<N> {
    /// Allocate a block with an alignment above [`ALIGNMENT`].
    ///
    /// The block is over-allocated by the alignment. The pointer handed out is
    /// aligned and preceded by a word, which holds the pointer the heap
    /// actually returned.
    ///
    /// ```text
    /// | header | padding ... | base pointer | payload ........ |
    ///          ^ base                       ^ aligned pointer
    /// ```
    fn alloc_over_aligned(&self, layout: Layout) -> *mut u8 {
        let align = layout.align();
        let len = match layout.size().checked_add(align) {
            Some(len) => len,
            None => return ptr::null_mut(),
        };
        let base = match self.with_heap(|heap, arena| heap.allocate(arena, len)) {
            Ok(base) => base.as_ptr(),
            Err(_) => return ptr::null_mut(),
        };
        let first = base as usize + WORD;
        let padding = (align - first % align) % align;
        // SAFETY: `WORD + padding <= align`, so the aligned pointer, the word
        // before it and the `layout.size()` bytes after it are inside of the
        // block of `layout.size() + align` bytes.
        unsafe {
            let aligned = base.add(WORD + padding);
            aligned.cast::<*mut u8>().sub(1).write(base);
            aligned
        }
    }

    /// Recover the pointer returned by the heap for an over-aligned block.
    ///
    /// # Safety
    /// `ptr` has to be returned by [`Self::alloc_over_aligned()`].
    unsafe fn over_aligned_base(ptr: *mut u8) -> *mut u8 {
        ptr.cast::<*mut u8>().sub(1).read()
    }
}
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return self.alloc_over_aligned(layout);
        }
        self.with_heap(|heap, arena| heap.allocate(arena, layout.size()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let ptr = if layout.align() > ALIGNMENT && !ptr.is_null() {
            Self::over_aligned_base(ptr)
        } else {
            ptr
        };
        // a failed deallocation cannot be reported, it was logged already
        let _ = self.with_heap(|heap, arena| heap.release(arena, NonNull::new(ptr)));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self
                .with_heap(|heap, arena| heap.reallocate(arena, NonNull::new(ptr), new_size))
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // SAFETY: the caller guarantees, that `new_size` does not overflow
        // with the alignment of the old layout
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let moved = self.alloc_over_aligned(new_layout);
        if !moved.is_null() {
            ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        moved
    }
}
