//! Random operation sequences against the heap.
//!
//! Every live block is filled with its own tag byte. Any overlap between two
//! blocks (or a block and the heap metadata) shows up as a clobbered tag.
use brkalloc::{Block, Ceiling, Heap, HEADER_SIZE};
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use proptest::prelude::*;

const SIZE: usize = 4096;

#[repr(C, align(16))]
struct Memory([MaybeUninit<u8>; SIZE]);

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Release(usize),
    Reallocate(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..200_usize).prop_map(Op::Allocate),
        any::<usize>().prop_map(Op::Release),
        (any::<usize>(), 0..300_usize).prop_map(|(index, len)| Op::Reallocate(index, len)),
    ]
}

struct Live {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}
impl Live {
    fn fill(&self) {
        unsafe { self.ptr.as_ptr().write_bytes(self.tag, self.len) };
    }

    fn intact(&self, len: usize) -> bool {
        let bytes = unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), len) };
        bytes.iter().all(|byte| *byte == self.tag)
    }
}

/// Check the layout of the whole heap: chunks tile the memory up to the break,
/// no two free chunks are adjacent and the topmost chunk is allocated.
fn check_layout(heap: &Heap, start: usize, live: &[Live]) {
    let mut expected_offset = 0;
    let mut previous_free = false;
    let mut last_free = false;
    let mut allocated = Vec::new();
    for (offset, block) in heap.blocks() {
        assert_eq!(offset, expected_offset, "chunks do not tile the heap");
        assert!(!(previous_free && block.is_free()), "adjacent free chunks");
        if let Block::Allocated { .. } = block {
            allocated.push(start + offset + HEADER_SIZE);
        }
        previous_free = block.is_free();
        last_free = block.is_free();
        expected_offset = offset + HEADER_SIZE + block.size();
    }
    assert_eq!(expected_offset, heap.current_break());
    assert!(!last_free, "top of the heap is kept free");

    let mut live_addresses: Vec<_> = live.iter().map(|l| l.ptr.as_ptr() as usize).collect();
    live_addresses.sort_unstable();
    assert_eq!(allocated, live_addresses);
}

proptest! {
    #[test]
    fn random_operations_keep_blocks_apart(ops in prop::collection::vec(op(), 1..200)) {
        let mut memory = Memory([MaybeUninit::uninit(); SIZE]);
        let start = memory.0.as_ptr() as usize;
        let mut heap = Heap::new(&mut memory.0, Ceiling::Fixed(SIZE / 2));
        let mut live: Vec<Live> = Vec::new();
        let mut next_tag = 0_u8;
        let mut tag = || {
            next_tag = next_tag.wrapping_add(1);
            next_tag
        };

        for op in ops {
            match op {
                Op::Allocate(len) => {
                    if let Ok(ptr) = heap.allocate(len) {
                        prop_assert!(heap.usable_size(ptr).unwrap() >= len);
                        let block = Live { ptr, len, tag: tag() };
                        block.fill();
                        live.push(block);
                    }
                }
                Op::Release(index) if !live.is_empty() => {
                    let block = live.swap_remove(index % live.len());
                    prop_assert_eq!(heap.release(Some(block.ptr)), Ok(()));
                }
                Op::Reallocate(index, len) if !live.is_empty() => {
                    let index = index % live.len();
                    let old = &live[index];
                    match heap.reallocate(Some(old.ptr), len) {
                        Ok(ptr) => {
                            let moved = Live { ptr, len: old.len, tag: old.tag };
                            prop_assert!(moved.intact(old.len.min(len)));
                            let block = Live { ptr, len, tag: tag() };
                            block.fill();
                            live[index] = block;
                        }
                        Err(_) => prop_assert!(old.intact(old.len)),
                    }
                }
                _ => {}
            }

            for block in &live {
                prop_assert!(block.intact(block.len));
            }
            check_layout(&heap, start, &live);
        }

        for block in live.drain(..) {
            prop_assert_eq!(heap.release(Some(block.ptr)), Ok(()));
        }
        prop_assert_eq!(heap.current_break(), 0);
        prop_assert_eq!(heap.stats().free_chunks, 0);
    }
}
