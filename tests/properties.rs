//! The externally observable guarantees of the heap.
use brkalloc::{AllocError, Ceiling, Heap, HEADER_SIZE, MIN_CHUNK_SIZE};
use core::mem::{size_of, MaybeUninit};
use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

const WORD: usize = size_of::<usize>();

/// Heap memory with an alignment, that makes the arena start at offset zero.
#[repr(C, align(16))]
struct Memory<const N: usize>([MaybeUninit<u8>; N]);
impl<const N: usize> Memory<N> {
    fn new() -> Self {
        Self([MaybeUninit::uninit(); N])
    }

    fn heap(&mut self, ceiling: Ceiling) -> Heap<'_> {
        Heap::new(&mut self.0, ceiling)
    }
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

#[test]
fn round_trip_reuses_the_address() {
    for n in [MIN_CHUNK_SIZE, 3 * WORD, 100, 1000] {
        let mut memory = Memory::<2048>::new();
        let mut heap = memory.heap(Ceiling::ArenaEnd);

        let first = heap.allocate(n).unwrap();
        heap.release(Some(first)).unwrap();
        assert_eq!(heap.allocate(n), Ok(first), "size {}", n);
    }
}

#[test]
fn round_trip_with_live_neighbors() {
    let mut memory = Memory::<2048>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let _before = heap.allocate(16).unwrap();
    let first = heap.allocate(40).unwrap();
    let _after = heap.allocate(16).unwrap();

    heap.release(Some(first)).unwrap();
    assert_eq!(heap.allocate(40), Ok(first));
}

#[test]
fn adjacent_chunks_coalesce_in_any_order() {
    const ORDERS: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    let size = 4 * WORD;

    for guarded in [false, true] {
        for order in ORDERS {
            let mut memory = Memory::<1024>::new();
            let mut heap = memory.heap(Ceiling::ArenaEnd);
            let chunks = [
                heap.allocate(size).unwrap(),
                heap.allocate(size).unwrap(),
                heap.allocate(size).unwrap(),
            ];
            if guarded {
                heap.allocate(WORD).unwrap();
            }
            for index in order {
                heap.release(Some(chunks[index])).unwrap();
            }

            let merged = heap.allocate(3 * size + 2 * HEADER_SIZE).unwrap();
            assert!(addr(merged) <= addr(chunks[0]), "order {:?}", order);
        }
    }
}

#[test]
fn releasing_the_top_lowers_the_break() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let _bottom = heap.allocate(32).unwrap();
    let before = heap.current_break();

    let top = heap.allocate(64).unwrap();
    assert!(heap.current_break() > before);
    heap.release(Some(top)).unwrap();
    assert_eq!(heap.current_break(), before);
    assert_eq!(heap.stats().free_chunks, 0);
}

#[test]
fn reallocating_to_the_same_size_is_a_no_op() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let ptr = heap.allocate(48).unwrap();
    let _guard = heap.allocate(8).unwrap();
    let size = heap.usable_size(ptr).unwrap();
    let before = heap.stats();

    assert_eq!(heap.reallocate(Some(ptr), size), Ok(ptr));
    assert_eq!(heap.stats(), before);
    assert_eq!(heap.usable_size(ptr), Some(size));
}

#[test]
fn growing_into_a_released_neighbor_stays_in_place() {
    for guarded in [false, true] {
        let mut memory = Memory::<1024>::new();
        let mut heap = memory.heap(Ceiling::ArenaEnd);
        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(48).unwrap();
        if guarded {
            heap.allocate(8).unwrap();
        }
        let size_a = heap.usable_size(a).unwrap();
        let size_b = heap.usable_size(b).unwrap();
        heap.release(Some(b)).unwrap();

        assert_eq!(heap.reallocate(Some(a), size_a + size_b), Ok(a));
        assert!(heap.usable_size(a).unwrap() >= size_a + size_b);
    }
}

#[test]
fn overflowing_reallocation_leaves_the_block_untouched() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let ptr = heap.allocate(16).unwrap();
    unsafe { ptr.as_ptr().cast::<u64>().write(0x0123_4567_89ab_cdef) };
    let before = heap.stats();

    assert_eq!(heap.reallocate(Some(ptr), usize::MAX), Err(AllocError::SizeOverflow));
    let wrapping = usize::MAX - addr(ptr) + 1;
    assert_eq!(heap.reallocate(Some(ptr), wrapping), Err(AllocError::SizeOverflow));

    assert_eq!(heap.stats(), before);
    assert_eq!(heap.usable_size(ptr), Some(16));
    assert_eq!(unsafe { ptr.as_ptr().cast::<u64>().read() }, 0x0123_4567_89ab_cdef);
}

#[test]
fn exhaustion_happens_exactly_at_the_ceiling() {
    const CEILING: usize = 40 * WORD;
    for n in [WORD, 3 * WORD, 5 * WORD] {
        let mut memory = Memory::<1024>::new();
        let mut heap = memory.heap(Ceiling::Fixed(CEILING));
        loop {
            let fits = heap.current_break() + HEADER_SIZE + n < CEILING;
            let result = heap.allocate(n);
            assert_eq!(result.is_ok(), fits, "size {} at break {}", n, heap.current_break());
            if !fits {
                assert_eq!(result, Err(AllocError::OutOfMemory));
                break;
            }
        }
        assert!(heap.current_break() < CEILING);
    }
}

#[test]
fn absent_pointers() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    assert_eq!(heap.release(None), Ok(()));
    assert_eq!(heap.current_break(), 0);

    let via_realloc = heap.reallocate(None, 24).unwrap();
    heap.release(Some(via_realloc)).unwrap();
    let via_alloc = heap.allocate(24).unwrap();
    assert_eq!(via_realloc, via_alloc);
}

#[test]
fn foreign_pointers_are_rejected() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let _ptr = heap.allocate(24).unwrap();
    let mut foreign = [0_usize; 4];
    let foreign = NonNull::from(&mut foreign).cast::<u8>();

    assert_eq!(heap.release(Some(foreign)), Err(brkalloc::FreeError::AllocationNotFound));
    assert_eq!(heap.reallocate(Some(foreign), 8), Err(AllocError::AllocationNotFound));
    assert_eq!(heap.usable_size(foreign), None);
}

#[test]
fn released_pointers_are_rejected() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let a = heap.allocate(40).unwrap();
    let _guard = heap.allocate(8).unwrap();
    heap.release(Some(a)).unwrap();
    let before = heap.stats();

    assert_eq!(heap.reallocate(Some(a), 8), Err(AllocError::AllocationNotFound));
    assert_eq!(heap.reallocate(Some(a), 200), Err(AllocError::AllocationNotFound));
    assert_eq!(heap.release(Some(a)), Err(brkalloc::FreeError::DoubleFreeDetected));
    assert_eq!(heap.stats(), before);
}

static STACK_POINTER: AtomicUsize = AtomicUsize::new(0);
fn fake_stack_pointer() -> usize {
    STACK_POINTER.load(Ordering::SeqCst)
}

#[test]
fn ceiling_follows_the_stack_pointer() {
    let mut memory = Memory::<1024>::new();
    let start = memory.0.as_ptr() as usize;
    let mut heap = memory.heap(Ceiling::BelowStack {
        margin: 64,
        probe: fake_stack_pointer,
    });

    STACK_POINTER.store(start + 64 + 256, Ordering::SeqCst);
    assert_eq!(heap.ceiling(), 256);
    let a = heap.allocate(128).unwrap();
    assert_eq!(heap.allocate(128), Err(AllocError::OutOfMemory));

    // the stack unwound: the heap may grow further
    STACK_POINTER.store(start + 64 + 512, Ordering::SeqCst);
    let b = heap.allocate(128).unwrap();
    assert!(addr(b) > addr(a));

    // the stack grew again: growing at the top is refused, existing blocks stay
    STACK_POINTER.store(start + 64 + 300, Ordering::SeqCst);
    assert_eq!(heap.reallocate(Some(b), 256), Err(AllocError::OutOfMemory));
    assert_eq!(heap.usable_size(b), Some(128));
}

#[test]
fn walking_the_heap() {
    let mut memory = Memory::<1024>::new();
    let mut heap = memory.heap(Ceiling::ArenaEnd);
    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(32).unwrap();
    heap.release(Some(a)).unwrap();

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].1.is_free());
    assert_eq!(blocks[0].1.size(), 16);
    assert_eq!(blocks[1], (HEADER_SIZE + 16, brkalloc::Block::Allocated { size: 32 }));
    assert_eq!(heap.capacity(), 1024);
}
