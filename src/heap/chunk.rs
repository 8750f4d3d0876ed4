//! The layout of a single chunk inside of the arena.
//!
//! ```text
//! allocated:  | size | payload .......................... |
//! free:       | size | next | unused ..................... |
//!             ^ chunk offset
//!                    ^ payload offset (chunk offset + HEADER)
//! ```
//! The size never includes the header itself. While a chunk is free, the first
//! payload word holds the offset of the next free chunk, which is the reason
//! for the minimal payload size of one word.
//!
//! The two states are modelled as two distinct handle types: a [`FreeChunk`]
//! is only ever obtained from the free list (or by explicitly turning a
//! [`UsedChunk`] into one), so the link word can never be read from the
//! payload of an allocated chunk.
use super::arena::{Arena, WORD};

/// The size of the chunk header, i.e. the size field.
pub const HEADER: usize = WORD;
/// The size of the forward link stored in a free chunk.
pub const LINK: usize = WORD;
/// The smallest chunk (header plus payload) which may ever exist.
pub const MIN_CHUNK: usize = HEADER + LINK;

/// Marks the end of the free list inside of a link word.
const NIL: usize = usize::MAX;

/// Round a requested payload length up to a valid chunk size.
///
/// Returns `None` if the rounding overflows.
pub fn normalize(len: usize) -> Option<usize> {
    let len = len.max(LINK);
    len.checked_add(WORD - 1).map(|len| len & !(WORD - 1))
}

/// A chunk, which is currently registered in the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeChunk(usize);
impl FreeChunk {
    /// Write a new free chunk header including its link.
    pub fn new(arena: &Arena, offset: usize, size: usize, next: Option<FreeChunk>) -> Self {
        debug_assert!(size >= LINK, "free chunk too small for its link");
        let chunk = Self(offset);
        chunk.set_size(arena, size);
        chunk.set_next(arena, next);
        chunk
    }

    /// The offset of the chunk header.
    pub const fn offset(self) -> usize {
        self.0
    }

    pub fn size(self, arena: &Arena) -> usize {
        arena.read_word(self.0)
    }

    pub fn set_size(self, arena: &Arena, size: usize) {
        arena.write_word(self.0, size);
    }

    /// The first offset after this chunk.
    pub fn end(self, arena: &Arena) -> usize {
        self.0 + HEADER + self.size(arena)
    }

    /// The next free chunk by address.
    pub fn next(self, arena: &Arena) -> Option<FreeChunk> {
        match arena.read_word(self.0 + HEADER) {
            NIL => None,
            offset => Some(Self(offset)),
        }
    }

    pub fn set_next(self, arena: &Arena, next: Option<FreeChunk>) {
        arena.write_word(self.0 + HEADER, next.map_or(NIL, Self::offset));
    }

    /// Hand the chunk out to a user. The caller has to unlink it first.
    pub const fn into_used(self) -> UsedChunk {
        UsedChunk(self.0)
    }
}

/// A chunk, which is handed out to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedChunk(usize);
impl UsedChunk {
    /// Write the header of a new allocated chunk.
    pub fn new(arena: &Arena, offset: usize, size: usize) -> Self {
        debug_assert!(size >= LINK, "allocated chunk too small to be freed");
        arena.write_word(offset, size);
        Self(offset)
    }

    /// Recover a chunk from the offset of its payload.
    ///
    /// The payload offset has to be aligned, preceded by a header and the
    /// chunk has to end at or below the `limit` (the current break). These
    /// checks reject foreign pointers, but a pointer into the middle of an
    /// allocation can still slip through.
    pub fn from_payload(arena: &Arena, payload: usize, limit: usize) -> Option<Self> {
        if payload % WORD != 0 || payload < HEADER || payload >= limit {
            return None;
        }
        let offset = payload - HEADER;
        let size = arena.read_word(offset);
        let end = payload.checked_add(size)?;
        (size >= LINK && size % WORD == 0 && end <= limit).then(|| Self(offset))
    }

    /// The offset of the chunk header.
    pub const fn offset(self) -> usize {
        self.0
    }

    /// The offset of the first payload byte.
    pub const fn payload(self) -> usize {
        self.0 + HEADER
    }

    pub fn size(self, arena: &Arena) -> usize {
        arena.read_word(self.0)
    }

    pub fn set_size(self, arena: &Arena, size: usize) {
        arena.write_word(self.0, size);
    }

    /// The first offset after this chunk.
    pub fn end(self, arena: &Arena) -> usize {
        self.payload() + self.size(arena)
    }

    /// Turn the chunk into a free one by writing its link.
    pub fn into_free(self, arena: &Arena, next: Option<FreeChunk>) -> FreeChunk {
        let chunk = FreeChunk(self.0);
        chunk.set_next(arena, next);
        chunk
    }
}

/// The state of a chunk as seen by walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// The chunk is registered in the free list.
    Free {
        /// The payload size (excluding the header).
        size: usize,
        /// The offset of the next free chunk by address.
        next: Option<usize>,
    },
    /// The chunk is handed out to a user.
    Allocated {
        /// The payload size (excluding the header).
        size: usize,
    },
}
impl Block {
    /// The payload size of the chunk, regardless of its state.
    pub const fn size(&self) -> usize {
        match *self {
            Self::Free { size, .. } | Self::Allocated { size } => size,
        }
    }

    pub const fn is_free(&self) -> bool {
        matches!(self, Self::Free { .. })
    }
}

/// Iterator over all chunks between the heap start and the break.
///
/// Yields the header offset along with the [`Block`]. Whether a chunk is free
/// is decided by walking the (address-ordered) free list alongside.
pub struct Blocks<'a, 'mem> {
    arena: &'a Arena<'mem>,
    offset: usize,
    limit: usize,
    next_free: Option<FreeChunk>,
}
impl<'a, 'mem> Blocks<'a, 'mem> {
    pub const fn new(arena: &'a Arena<'mem>, first_free: Option<FreeChunk>, limit: usize) -> Self {
        Self {
            arena,
            offset: 0,
            limit,
            next_free: first_free,
        }
    }
}
impl Iterator for Blocks<'_, '_> {
    type Item = (usize, Block);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.limit {
            return None;
        }
        let offset = self.offset;
        let block = match self.next_free {
            Some(free) if free.offset() == offset => {
                let next = free.next(self.arena);
                self.next_free = next;
                Block::Free {
                    size: free.size(self.arena),
                    next: next.map(FreeChunk::offset),
                }
            }
            _ => Block::Allocated {
                size: self.arena.read_word(offset),
            },
        };
        self.offset += HEADER + block.size();
        Some((offset, block))
    }
}
