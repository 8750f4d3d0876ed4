//! The registry of free chunks.
//!
//! The free list is a singly linked list threaded through the free chunks
//! themselves and kept sorted by ascending offset. Two invariants hold after
//! every operation:
//! 1. no two listed chunks are adjacent (adjacent chunks are always merged),
//! 2. the last listed chunk does not end at the break (such a chunk is given
//!    back to virgin memory instead).
use super::arena::Arena;
use super::boundary::Boundary;
use super::chunk::{FreeChunk, UsedChunk, HEADER, MIN_CHUNK};
use super::FreeError;

/// The outcome of a search for a chunk of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// A chunk with exactly the requested size.
    Exact(FreeChunk),
    /// The smallest chunk larger than the requested size.
    Smallest(FreeChunk),
}

/// The address-ordered list of free chunks.
#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    head: Option<FreeChunk>,
}
impl FreeList {
    /// Create an empty free list.
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// The free chunk with the lowest offset.
    pub const fn first(&self) -> Option<FreeChunk> {
        self.head
    }

    /// Iterate over all free chunks in ascending order.
    pub fn iter<'a, 'mem>(&self, arena: &'a Arena<'mem>) -> Iter<'a, 'mem> {
        Iter {
            arena,
            next: self.head,
        }
    }

    /// Search for a chunk with a payload size of `len`.
    ///
    /// A single pass over the list: the first chunk with exactly the requested
    /// size ends the search. Otherwise the smallest chunk seen, that is large
    /// enough, is reported (on ties the lowest offset wins).
    pub fn find(&self, arena: &Arena, len: usize) -> Option<Fit> {
        let mut smallest: Option<(FreeChunk, usize)> = None;
        for chunk in self.iter(arena) {
            let size = chunk.size(arena);
            if size == len {
                return Some(Fit::Exact(chunk));
            }
            if size > len && smallest.map_or(true, |(_, best)| size < best) {
                smallest = Some((chunk, size));
            }
        }
        smallest.map(|(chunk, _)| Fit::Smallest(chunk))
    }

    /// Find the free chunk starting at exactly `offset`.
    pub fn find_at(&self, arena: &Arena, offset: usize) -> Option<FreeChunk> {
        self.iter(arena)
            .take_while(|chunk| chunk.offset() <= offset)
            .find(|chunk| chunk.offset() == offset)
    }

    /// Whether `chunk` overlaps a listed chunk, i.e. is (part of) free memory.
    pub fn overlaps(&self, arena: &Arena, chunk: UsedChunk) -> bool {
        let end = chunk.end(arena);
        self.iter(arena)
            .take_while(|free| free.offset() < end)
            .any(|free| free.end(arena) > chunk.offset())
    }

    /// The listed predecessor of `chunk`, i.e. the chunk linking to it.
    fn predecessor(&self, arena: &Arena, chunk: FreeChunk) -> Option<FreeChunk> {
        self.iter(arena)
            .take_while(|candidate| *candidate < chunk)
            .last()
    }

    /// Make `prev` (or the head, if `None`) link to `next`.
    fn link(&mut self, arena: &Arena, prev: Option<FreeChunk>, next: Option<FreeChunk>) {
        match prev {
            Some(prev) => prev.set_next(arena, next),
            None => self.head = next,
        }
    }

    /// Unlink a listed chunk.
    pub fn remove(&mut self, arena: &Arena, chunk: FreeChunk) {
        debug_assert!(self.iter(arena).any(|c| c == chunk), "chunk not listed");
        let prev = self.predecessor(arena, chunk);
        self.link(arena, prev, chunk.next(arena));
    }

    /// Hand out `len` bytes of a listed chunk.
    ///
    /// If the remainder would be too small to form a chunk on its own, the
    /// whole chunk is unlinked and handed out. Otherwise the upper part of the
    /// chunk is handed out and the lower part stays listed with a reduced size,
    /// so that no links have to be touched.
    pub fn take_or_split(&mut self, arena: &Arena, chunk: FreeChunk, len: usize) -> UsedChunk {
        let size = chunk.size(arena);
        debug_assert!(size >= len, "chunk too small for the request");
        if size - len < MIN_CHUNK {
            self.remove(arena, chunk);
            return chunk.into_used();
        }

        let remaining = size - len - HEADER;
        chunk.set_size(arena, remaining);
        UsedChunk::new(arena, chunk.offset() + HEADER + remaining, len)
    }

    /// Move the start of a listed chunk `by` bytes upwards.
    ///
    /// The lower `by` bytes are no longer part of the free list afterwards,
    /// the rest stays listed at the same position of the list.
    pub fn shift_start(&mut self, arena: &Arena, chunk: FreeChunk, by: usize) -> FreeChunk {
        let size = chunk.size(arena);
        debug_assert!(size >= by + MIN_CHUNK - HEADER, "shifted chunk too small");
        let prev = self.predecessor(arena, chunk);
        let shifted = FreeChunk::new(arena, chunk.offset() + by, size - by, chunk.next(arena));
        self.link(arena, prev, Some(shifted));
        shifted
    }

    /// Put an allocated chunk back into the list.
    ///
    /// The chunk is merged with its free neighbors, if they are adjacent, and
    /// the resulting top of the list is given back to virgin memory if it ends
    /// at the break. A chunk overlapping an already listed chunk is rejected as
    /// a double free, before anything is modified.
    pub fn insert_and_coalesce(
        &mut self,
        arena: &Arena,
        boundary: &mut Boundary,
        chunk: UsedChunk,
    ) -> Result<(), FreeError> {
        let end = chunk.end(arena);
        if self.head.is_none() {
            if end == boundary.current_break() {
                boundary.shrink(end - chunk.offset());
            } else {
                self.head = Some(chunk.into_free(arena, None));
            }
            return Ok(());
        }

        let mut prev = None;
        let mut next = self.head;
        while let Some(candidate) = next {
            if candidate.offset() > chunk.offset() {
                break;
            }
            prev = Some(candidate);
            next = candidate.next(arena);
        }
        let overlaps_prev = prev.map_or(false, |prev| prev.end(arena) > chunk.offset());
        let overlaps_next = next.map_or(false, |next| next.offset() < end);
        if overlaps_prev || overlaps_next {
            return Err(FreeError::DoubleFreeDetected);
        }

        let freed = match next {
            Some(next) if next.offset() == end => {
                let merged = chunk.into_free(arena, next.next(arena));
                merged.set_size(arena, chunk.size(arena) + HEADER + next.size(arena));
                merged
            }
            _ => chunk.into_free(arena, next),
        };
        match prev {
            Some(prev) if prev.end(arena) == freed.offset() => {
                prev.set_size(arena, prev.size(arena) + HEADER + freed.size(arena));
                prev.set_next(arena, freed.next(arena));
            }
            _ => self.link(arena, prev, Some(freed)),
        }

        self.reclaim_top(arena, boundary);
        Ok(())
    }

    /// Give the last listed chunk back to virgin memory, if it ends at the
    /// break.
    fn reclaim_top(&mut self, arena: &Arena, boundary: &mut Boundary) {
        let mut prev = None;
        let mut tail = match self.head {
            Some(head) => head,
            None => return,
        };
        while let Some(next) = tail.next(arena) {
            prev = Some(tail);
            tail = next;
        }
        if tail.end(arena) == boundary.current_break() {
            self.link(arena, prev, None);
            boundary.shrink(boundary.current_break() - tail.offset());
        }
    }

    /// Check the list invariants.
    ///
    /// # Panics
    /// This function panics if any invariant is violated.
    pub fn assert_invariants(&self, arena: &Arena, boundary: &Boundary) {
        let brk = boundary.current_break();
        let mut previous_end = None;
        let mut last_end = None;
        for chunk in self.iter(arena) {
            let end = chunk.end(arena);
            assert!(end <= brk, "free chunk beyond the break");
            if let Some(previous_end) = previous_end {
                assert!(previous_end < chunk.offset(), "free list unordered or not coalesced");
            }
            previous_end = Some(end);
            last_end = Some(end);
        }
        assert!(last_end != Some(brk), "top of the heap kept in the free list");
    }
}

/// Iterator over the chunks of a [`FreeList`].
pub struct Iter<'a, 'mem> {
    arena: &'a Arena<'mem>,
    next: Option<FreeChunk>,
}
impl Iterator for Iter<'_, '_> {
    type Item = FreeChunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.next?;
        self.next = chunk.next(self.arena);
        Some(chunk)
    }
}
