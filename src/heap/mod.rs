//! This module provides the heap and its support types.
//!
//! The heap is split into three layers: the [`Boundary`](boundary::Boundary)
//! tracks the break and the ceiling, the [`FreeList`](registry::FreeList)
//! keeps the freed chunks and [`HeapState`] decides between reusing a free
//! chunk, splitting one, growing into virgin memory and failing.
//!
//! All of the state is expressed as offsets into an [`Arena`], so the state
//! itself is position independent and can be created in a `const` context.
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

mod arena;
mod boundary;
mod chunk;
mod registry;

pub(crate) use arena::{Arena, Buffer, WORD};
pub use boundary::{stack_pointer, Ceiling, DEFAULT_STACK_MARGIN};
pub use chunk::{Block, Blocks};
use chunk::{normalize, UsedChunk, HEADER, MIN_CHUNK};
use registry::{Fit, FreeList};

/// The size of the header in front of every allocation.
pub const HEADER_SIZE: usize = HEADER;
/// The smallest chunk (header plus payload) the heap ever creates.
pub const MIN_CHUNK_SIZE: usize = MIN_CHUNK;

/// An error occurred when calling `allocate()` or `reallocate()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Neither a free chunk nor the virgin memory below the ceiling can
    /// satisfy the request.
    OutOfMemory,
    /// The requested size added to the pointer wraps the address space.
    SizeOverflow,
    /// The pointer to reallocate does not belong to this heap.
    AllocationNotFound,
    /// The heap is in use by someone else (only reported by the non-blocking
    /// methods of [`Allocator`](crate::Allocator)).
    Contended,
}
impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfMemory => "out of memory",
            Self::SizeOverflow => "requested size overflows the address space",
            Self::AllocationNotFound => "pointer does not belong to the heap",
            Self::Contended => "heap is locked",
        })
    }
}

/// An error occurred when calling `release()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// An invalid pointer was freed up (either a pointer outside of the heap
    /// memory or not pointing to the start of an allocation).
    AllocationNotFound,
    /// There is a double-free detected. An already freed-up block is freed up
    /// again.
    DoubleFreeDetected,
    /// The heap is in use by someone else (only reported by the non-blocking
    /// methods of [`Allocator`](crate::Allocator)).
    Contended,
}
impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AllocationNotFound => "pointer does not belong to the heap",
            Self::DoubleFreeDetected => "double free detected",
            Self::Contended => "heap is locked",
        })
    }
}

/// A snapshot of the heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// The offset of the break, i.e. the number of bytes carved out so far.
    pub brk: usize,
    /// The current ceiling as an offset.
    pub ceiling: usize,
    /// The number of chunks in the free list.
    pub free_chunks: usize,
    /// The summed payload sizes of all chunks in the free list.
    pub free_bytes: usize,
    /// The payload size of the largest chunk in the free list.
    pub largest_free: usize,
    /// The bytes between the break and the ceiling.
    pub headroom: usize,
}

/// The complete state of a heap, without its memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeapState {
    free: FreeList,
    boundary: boundary::Boundary,
}
impl HeapState {
    /// Create the state of an empty heap: nothing is free, the break is at the
    /// start of the arena.
    pub const fn new(ceiling: Ceiling) -> Self {
        Self {
            free: FreeList::new(),
            boundary: boundary::Boundary::new(ceiling),
        }
    }

    /// Allocate a block with a payload of (at least) `len` bytes.
    ///
    /// The free list is searched for a chunk of exactly that size first, then
    /// for the smallest larger chunk, which is split if the remainder is large
    /// enough. Only if no free chunk fits, virgin memory is carved out.
    pub fn allocate(&mut self, arena: &Arena, len: usize) -> Result<NonNull<u8>, AllocError> {
        let len = match normalize(len) {
            Some(len) => len,
            None => {
                warn!("allocate({}): request too large", len);
                return Err(AllocError::OutOfMemory);
            }
        };

        let chunk = match self.free.find(arena, len) {
            Some(Fit::Exact(chunk)) => {
                trace!("allocate({}): exact fit at {:#x}", len, chunk.offset());
                self.free.remove(arena, chunk);
                chunk.into_used()
            }
            Some(Fit::Smallest(chunk)) => {
                trace!("allocate({}): taking from chunk at {:#x}", len, chunk.offset());
                self.free.take_or_split(arena, chunk, len)
            }
            None => match self.boundary.grow_chunk(arena, len) {
                Ok(offset) => {
                    trace!("allocate({}): carved at {:#x}", len, offset);
                    UsedChunk::new(arena, offset, len)
                }
                Err(error) => {
                    warn!(
                        "allocate({}): out of memory (break {:#x}, ceiling {:#x})",
                        len,
                        self.boundary.current_break(),
                        self.boundary.ceiling(arena)
                    );
                    return Err(error);
                }
            },
        };
        self.debug_check(arena);
        Ok(arena.pointer(chunk.payload()))
    }

    /// Release a block previously returned by this heap.
    ///
    /// `None` is ignored. The chunk is merged with adjacent free chunks and
    /// given back to virgin memory, if it ends up at the top of the heap.
    pub fn release(&mut self, arena: &Arena, ptr: Option<NonNull<u8>>) -> Result<(), FreeError> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return Ok(()),
        };
        let chunk = self.chunk_of(arena, ptr).ok_or_else(|| {
            warn!("release({:p}): not an allocation of this heap", ptr);
            FreeError::AllocationNotFound
        })?;

        trace!("release({:#x}): {} bytes", chunk.offset(), chunk.size(arena));
        self.free
            .insert_and_coalesce(arena, &mut self.boundary, chunk)
            .map_err(|error| {
                warn!("release({:p}): {}", ptr, error);
                error
            })?;
        self.debug_check(arena);
        Ok(())
    }

    /// Resize a block previously returned by this heap.
    ///
    /// The block is resized in place whenever possible: shrinking splits off
    /// the tail (if it is large enough to form a chunk), growing absorbs the
    /// free chunk directly following the block or advances the break if the
    /// block is the top of the heap. Only if all of that fails, the contents
    /// are moved to a new block. On failure the original block is untouched.
    pub fn reallocate(
        &mut self,
        arena: &Arena,
        ptr: Option<NonNull<u8>>,
        len: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.allocate(arena, len),
        };
        if (ptr.as_ptr() as usize).checked_add(len).is_none() {
            warn!("reallocate({:p}, {}): size overflow", ptr, len);
            return Err(AllocError::SizeOverflow);
        }
        let chunk = self.live_chunk_of(arena, ptr).ok_or_else(|| {
            warn!("reallocate({:p}): not an allocation of this heap", ptr);
            AllocError::AllocationNotFound
        })?;
        let len = normalize(len).ok_or(AllocError::SizeOverflow)?;
        let size = chunk.size(arena);

        if len <= size {
            self.shrink_in_place(arena, chunk, len);
            return Ok(ptr);
        }
        if self.grow_in_place(arena, chunk, len) {
            return Ok(ptr);
        }

        let moved = self.allocate(arena, len)?;
        let target = arena.offset_of(moved).ok_or(AllocError::AllocationNotFound)?;
        trace!("reallocate({:#x}, {}): moved to {:#x}", chunk.offset(), len, target);
        arena.copy(chunk.payload(), target, size);
        let released = self.free.insert_and_coalesce(arena, &mut self.boundary, chunk);
        debug_assert!(released.is_ok(), "relocated chunk already free");
        self.debug_check(arena);
        Ok(moved)
    }

    /// Give the tail of a chunk back, if the tail can form a chunk on its own.
    fn shrink_in_place(&mut self, arena: &Arena, chunk: UsedChunk, len: usize) {
        let size = chunk.size(arena);
        if size - len < MIN_CHUNK {
            return;
        }
        trace!("reallocate({:#x}, {}): shrinking from {}", chunk.offset(), len, size);
        chunk.set_size(arena, len);
        let tail = UsedChunk::new(arena, chunk.end(arena), size - len - HEADER);
        let released = self.free.insert_and_coalesce(arena, &mut self.boundary, tail);
        debug_assert!(released.is_ok(), "split off tail already free");
        self.debug_check(arena);
    }

    /// Try to grow a chunk without moving it.
    ///
    /// Only the free chunk starting exactly at the end of `chunk` is
    /// considered, there is no search for other free chunks.
    fn grow_in_place(&mut self, arena: &Arena, chunk: UsedChunk, len: usize) -> bool {
        let size = chunk.size(arena);
        let needed = len - size;
        let end = chunk.end(arena);

        if let Some(neighbor) = self.free.find_at(arena, end) {
            let available = HEADER + neighbor.size(arena);
            if available >= needed {
                if available - needed < MIN_CHUNK {
                    trace!("reallocate({:#x}, {}): absorbing neighbor", chunk.offset(), len);
                    self.free.remove(arena, neighbor);
                    chunk.set_size(arena, size + available);
                } else {
                    trace!("reallocate({:#x}, {}): splitting neighbor", chunk.offset(), len);
                    self.free.shift_start(arena, neighbor, needed);
                    chunk.set_size(arena, len);
                }
                self.debug_check(arena);
                return true;
            }
        }

        if end == self.boundary.current_break() && self.boundary.grow(arena, needed).is_ok() {
            trace!("reallocate({:#x}, {}): growing at the break", chunk.offset(), len);
            chunk.set_size(arena, len);
            self.debug_check(arena);
            return true;
        }
        false
    }

    /// Convert a user pointer into the chunk it belongs to.
    fn chunk_of(&self, arena: &Arena, ptr: NonNull<u8>) -> Option<UsedChunk> {
        let payload = arena.offset_of(ptr)?;
        UsedChunk::from_payload(arena, payload, self.boundary.current_break())
    }

    /// Like [`Self::chunk_of()`], but rejects chunks in the free list.
    fn live_chunk_of(&self, arena: &Arena, ptr: NonNull<u8>) -> Option<UsedChunk> {
        self.chunk_of(arena, ptr)
            .filter(|chunk| !self.free.overlaps(arena, *chunk))
    }

    /// The payload size of the block behind `ptr`.
    ///
    /// This might be larger than requested, since requests are rounded up and
    /// small remainders are not split off.
    pub fn usable_size(&self, arena: &Arena, ptr: NonNull<u8>) -> Option<usize> {
        self.live_chunk_of(arena, ptr).map(|chunk| chunk.size(arena))
    }

    pub fn current_break(&self) -> usize {
        self.boundary.current_break()
    }

    pub fn ceiling(&self, arena: &Arena) -> usize {
        self.boundary.ceiling(arena)
    }

    pub fn set_ceiling(&mut self, ceiling: Ceiling) {
        self.boundary.set_ceiling(ceiling);
    }

    /// Collect the current usage numbers.
    pub fn stats(&self, arena: &Arena) -> Stats {
        let mut stats = Stats {
            brk: self.boundary.current_break(),
            ceiling: self.boundary.ceiling(arena),
            headroom: self.boundary.headroom(arena),
            ..Stats::default()
        };
        for chunk in self.free.iter(arena) {
            let size = chunk.size(arena);
            stats.free_chunks += 1;
            stats.free_bytes += size;
            stats.largest_free = stats.largest_free.max(size);
        }
        stats
    }

    /// Walk over all chunks below the break.
    pub fn blocks<'a, 'mem>(&self, arena: &'a Arena<'mem>) -> Blocks<'a, 'mem> {
        Blocks::new(arena, self.free.first(), self.boundary.current_break())
    }

    #[inline]
    fn debug_check(&self, arena: &Arena) {
        #[cfg(debug_assertions)]
        self.free.assert_invariants(arena, &self.boundary);
        #[cfg(not(debug_assertions))]
        let _ = arena;
    }
}

/// A heap over a borrowed (or otherwise provided) memory region.
///
/// This is the allocator core with explicit context: there is no global state
/// involved, every operation requires exclusive access to the heap. Use
/// [`Allocator`](crate::Allocator) for a heap shared between contexts or for
/// the `#[global_allocator]`.
///
/// Offsets reported by [`Heap::current_break()`], [`Heap::blocks()`] and
/// [`Heap::stats()`] are relative to the (word-aligned) start of the region.
///
/// # Example
/// ```
/// use core::mem::MaybeUninit;
/// use brkalloc::{Ceiling, Heap};
///
/// let mut memory = [MaybeUninit::uninit(); 256];
/// let mut heap = Heap::new(&mut memory, Ceiling::ArenaEnd);
///
/// let a = heap.allocate(16).unwrap();
/// let b = heap.reallocate(Some(a), 64).unwrap();
/// heap.release(Some(b)).unwrap();
/// assert_eq!(heap.current_break(), 0);
/// ```
#[derive(Debug)]
pub struct Heap<'mem> {
    arena: Arena<'mem>,
    state: HeapState,
}
impl<'mem> Heap<'mem> {
    /// Create an empty heap in the given memory.
    pub fn new(memory: &'mem mut [MaybeUninit<u8>], ceiling: Ceiling) -> Self {
        Self {
            arena: Arena::new(memory),
            state: HeapState::new(ceiling),
        }
    }

    /// Create an empty heap in a memory region provided by the platform, e.g.
    /// the memory between the end of the static data and the end of the RAM.
    ///
    /// # Safety
    /// The memory `start..start + len` has to be valid for reads and writes
    /// for `'mem` and must not be used for anything else.
    pub unsafe fn from_raw_parts(start: NonNull<u8>, len: usize, ceiling: Ceiling) -> Self {
        Self {
            arena: Arena::from_raw_parts(start, len),
            state: HeapState::new(ceiling),
        }
    }

    /// Allocate a block with a payload of at least `len` bytes.
    ///
    /// The returned pointer is aligned to the machine word size.
    pub fn allocate(&mut self, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.state.allocate(&self.arena, len)
    }

    /// Release a block. Releasing `None` does nothing.
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), FreeError> {
        self.state.release(&self.arena, ptr)
    }

    /// Resize a block, moving it if necessary. Resizing `None` allocates.
    pub fn reallocate(&mut self, ptr: Option<NonNull<u8>>, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.state.reallocate(&self.arena, ptr, len)
    }

    /// The payload size of the block behind `ptr`, if it is an allocation of
    /// this heap.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.state.usable_size(&self.arena, ptr)
    }

    /// The offset of the break.
    pub fn current_break(&self) -> usize {
        self.state.current_break()
    }

    /// The current ceiling as an offset.
    pub fn ceiling(&self) -> usize {
        self.state.ceiling(&self.arena)
    }

    /// The number of usable bytes in the memory region.
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Collect the current usage numbers.
    pub fn stats(&self) -> Stats {
        self.state.stats(&self.arena)
    }

    /// Walk over all chunks below the break, yielding their header offsets.
    pub fn blocks(&self) -> Blocks<'_, 'mem> {
        self.state.blocks(&self.arena)
    }
}
