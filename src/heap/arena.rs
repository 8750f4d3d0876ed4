use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};

/// The machine word size. Every chunk offset and every chunk size is a
/// multiple of it.
pub const WORD: usize = mem::size_of::<usize>();

/// Statically allocated heap memory, suitable for a `static` item.
///
/// The memory is left completely uninitialized, so a `static` holding a buffer
/// ends up in `.bss` instead of `.data`. The zero-sized `_align` field forces
/// word alignment of the buffer on every target.
#[repr(C)]
pub struct Buffer<const N: usize> {
    _align: [usize; 0],
    memory: UnsafeCell<[MaybeUninit<u8>; N]>,
}
impl<const N: usize> Buffer<N> {
    /// Create a new, uninitialized buffer.
    pub const fn new() -> Self {
        Self {
            _align: [],
            memory: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }

    /// Obtain an [`Arena`] spanning the whole buffer.
    ///
    /// # Safety
    /// At most one arena of a buffer may be accessed at a time. The caller
    /// has to serialize all calls (e.g. by holding a lock for as long as the
    /// returned arena is alive).
    pub unsafe fn arena(&self) -> Arena<'_> {
        // SAFETY: `UnsafeCell::get()` never returns a null pointer and the
        // memory is valid for `N` bytes as long as `self` is borrowed. The
        // exclusivity is guaranteed by the caller.
        Arena::from_raw_parts(NonNull::new_unchecked(self.memory.get().cast()), N)
    }
}

/// A word-aligned region of raw memory, addressed by byte offsets.
///
/// The arena never creates references to its memory: every access goes
/// through raw pointers and is bounds-checked against the region length. This
/// allows the payload of allocated chunks to be written by the user through
/// the pointers handed out, while the allocator keeps reading and writing
/// chunk headers.
#[derive(Debug)]
pub struct Arena<'mem> {
    start: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'mem mut [MaybeUninit<u8>]>,
}
impl<'mem> Arena<'mem> {
    /// Create an arena over a borrowed memory slice.
    ///
    /// Bytes before the first word boundary and a trailing partial word are
    /// not used.
    pub fn new(memory: &'mem mut [MaybeUninit<u8>]) -> Self {
        let len = memory.len();
        let start = NonNull::from(memory).cast::<u8>();
        // SAFETY: the exclusive borrow covers the whole region for `'mem`
        unsafe { Self::from_raw_parts(start, len) }
    }

    /// Create an arena from a raw start pointer and a length.
    ///
    /// The start is rounded up to the word alignment and the length is trimmed
    /// accordingly.
    ///
    /// # Safety
    /// The memory `start..start + len` has to be valid for reads and writes
    /// for `'mem` and must not be accessed by anything else than this arena
    /// and the holders of pointers this arena hands out.
    pub unsafe fn from_raw_parts(start: NonNull<u8>, len: usize) -> Self {
        let padding = start.as_ptr().align_offset(WORD);
        let (start, len) = if padding > len {
            (start, 0)
        } else {
            // SAFETY: `padding <= len`, so the result is still inside (or one
            // past the end of) the region
            let start = NonNull::new_unchecked(start.as_ptr().add(padding));
            (start, (len - padding) & !(WORD - 1))
        };
        Self {
            start,
            len,
            _memory: PhantomData,
        }
    }

    /// The usable number of bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// The absolute address of offset `0`.
    pub fn start_address(&self) -> usize {
        self.start.as_ptr() as usize
    }

    /// Read the machine word at `offset`.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of the word size
    /// or if the word would be read past the end of the arena.
    pub fn read_word(&self, offset: usize) -> usize {
        self.check_word(offset);
        // SAFETY: the offset is in bounds and aligned (checked above), the
        // start is word-aligned by construction.
        unsafe { self.start.as_ptr().add(offset).cast::<usize>().read() }
    }

    /// Write the machine word at `offset`.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of the word size
    /// or if the word would be written past the end of the arena.
    pub fn write_word(&self, offset: usize, value: usize) {
        self.check_word(offset);
        // SAFETY: same as `read_word()`
        unsafe { self.start.as_ptr().add(offset).cast::<usize>().write(value) }
    }

    fn check_word(&self, offset: usize) {
        assert!(offset % WORD == 0, "unaligned word access");
        assert!(
            offset <= self.len && self.len - offset >= WORD,
            "word access out of bounds"
        );
    }

    /// Convert an offset into a pointer into the arena.
    ///
    /// # Panics
    /// This function panics if the offset lies outside of the arena.
    pub fn pointer(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "offset out of bounds");
        // SAFETY: the offset is at most one past the end of the region
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(offset)) }
    }

    /// Convert a pointer back into an offset.
    ///
    /// Pointers outside of the arena are rejected with `None`.
    pub fn offset_of(&self, pointer: NonNull<u8>) -> Option<usize> {
        let offset = (pointer.as_ptr() as usize).checked_sub(self.start_address())?;
        (offset < self.len).then(|| offset)
    }

    /// Copy `count` bytes from offset `src` to offset `dst`.
    ///
    /// The regions may overlap.
    ///
    /// # Panics
    /// This function panics if either region is not fully inside the arena.
    pub fn copy(&self, src: usize, dst: usize, count: usize) {
        assert!(src <= self.len && self.len - src >= count, "copy source out of bounds");
        assert!(dst <= self.len && self.len - dst >= count, "copy target out of bounds");
        // SAFETY: both regions are in bounds (checked above), `ptr::copy`
        // handles overlapping regions.
        unsafe {
            let start = self.start.as_ptr();
            ptr::copy(start.add(src), start.add(dst), count);
        }
    }
}
