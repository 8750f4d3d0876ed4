//! Tracking of the break and the ceiling it may not reach.
use super::arena::Arena;
use super::chunk::HEADER;
use super::AllocError;

/// The default number of bytes kept free below the stack pointer.
///
/// This is the space interrupt handlers may use on top of the current stack
/// without colliding with the heap.
pub const DEFAULT_STACK_MARGIN: usize = 128;

/// The limit the break of a heap is not allowed to reach.
///
/// The ceiling is never stored as a number: it is evaluated each time the heap
/// tries to grow, since the stack pointer moves independently of the heap.
#[derive(Debug, Clone, Copy)]
// keeps `ArenaEnd` at discriminant zero, so an `Allocator::new()` static is all
// zeros and lands in `.bss`
#[repr(usize)]
pub enum Ceiling {
    /// The heap may grow up to the end of its memory region.
    ArenaEnd,
    /// The heap may grow up to a fixed number of bytes after its start.
    ///
    /// Values past the end of the memory region are clamped to the region.
    Fixed(usize),
    /// The heap may grow up to the current stack pointer minus a margin.
    BelowStack {
        /// Bytes reserved below the stack pointer.
        margin: usize,
        /// Query of the current stack pointer (an absolute address).
        probe: fn() -> usize,
    },
}
impl Ceiling {
    /// A ceiling following the stack pointer, which is queried via
    /// [`stack_pointer()`].
    pub const fn below_stack(margin: usize) -> Self {
        Self::BelowStack {
            margin,
            probe: stack_pointer,
        }
    }

    /// Evaluate the ceiling as an offset into the given arena.
    fn limit(&self, arena: &Arena) -> usize {
        let limit = match *self {
            Self::ArenaEnd => arena.len(),
            Self::Fixed(limit) => limit,
            Self::BelowStack { margin, probe } => probe()
                .saturating_sub(margin)
                .saturating_sub(arena.start_address()),
        };
        limit.min(arena.len())
    }
}
impl Default for Ceiling {
    fn default() -> Self {
        Self::ArenaEnd
    }
}

/// Approximate the current stack pointer.
///
/// This takes the address of a local variable, which is as close to the real
/// stack pointer as it gets without target-specific assembly.
#[inline(never)]
pub fn stack_pointer() -> usize {
    let marker = 0_u8;
    core::hint::black_box(core::ptr::addr_of!(marker)) as usize
}

/// The boundary between carved-out memory and virgin memory.
#[derive(Debug, Clone, Copy)]
pub struct Boundary {
    brk: usize,
    ceiling: Ceiling,
}
impl Boundary {
    /// Create a boundary for an empty heap, i.e. with the break at the start.
    pub const fn new(ceiling: Ceiling) -> Self {
        Self { brk: 0, ceiling }
    }

    /// The lowest offset not yet carved out of virgin memory.
    pub const fn current_break(&self) -> usize {
        self.brk
    }

    /// The offset the break is not allowed to reach.
    pub fn ceiling(&self, arena: &Arena) -> usize {
        self.ceiling.limit(arena)
    }

    /// Replace the ceiling policy. The break is not touched, even if it is
    /// above the new ceiling.
    pub fn set_ceiling(&mut self, ceiling: Ceiling) {
        self.ceiling = ceiling;
    }

    /// The number of bytes between the break and the ceiling.
    pub fn headroom(&self, arena: &Arena) -> usize {
        self.ceiling(arena).saturating_sub(self.brk)
    }

    /// Advance the break by `by` bytes and return the previous break.
    ///
    /// This fails if the new break would reach or exceed the ceiling.
    pub fn grow(&mut self, arena: &Arena, by: usize) -> Result<usize, AllocError> {
        if by >= self.headroom(arena) {
            return Err(AllocError::OutOfMemory);
        }
        Ok(self.advance(by))
    }

    /// Carve a chunk with a payload of `len` bytes out of virgin memory and
    /// return the offset of its header.
    ///
    /// The payload size and the total size are checked separately: adding the
    /// header to a huge request may wrap around before it is compared.
    pub fn grow_chunk(&mut self, arena: &Arena, len: usize) -> Result<usize, AllocError> {
        let available = self.headroom(arena);
        if len >= available {
            return Err(AllocError::OutOfMemory);
        }
        match len.checked_add(HEADER) {
            Some(total) if total < available => Ok(self.advance(total)),
            _ => Err(AllocError::OutOfMemory),
        }
    }

    fn advance(&mut self, by: usize) -> usize {
        let base = self.brk;
        self.brk += by;
        base
    }

    /// Retract the break by `by` bytes.
    ///
    /// Only called for the free chunk ending exactly at the break.
    pub fn shrink(&mut self, by: usize) {
        debug_assert!(by <= self.brk, "break retracted below the heap start");
        self.brk -= by;
    }
}
