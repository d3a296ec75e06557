//! Sequentially consistent byte copy tolerant of concurrent mutation.
//!
//! The collector copies object payloads while the mutator may still be
//! writing to them. A plain `memcpy` could observe a torn word, so every
//! destination word is installed with a seq-cst `swap` after a seq-cst load
//! of the source: each copied word is either the pre-copy or the post-copy
//! value, never a splice of the two.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

#[inline]
fn aligned_to(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// Copies `len` bytes from `src` to `dst` one atomic word at a time.
///
/// The width of each move is the widest that both cursors are aligned to,
/// falling back to single bytes on misalignment.
///
/// # Safety
///
/// - `src` must be readable and `dst` writable for `len` bytes.
/// - The two regions must not overlap.
/// - Concurrent access to either region must itself be atomic or tolerant
///   of word-granularity tearing (the conservative heap contract).
pub unsafe fn seq_cst_copy(dst: *mut u8, src: *const u8, len: usize) {
    let mut i = 0;
    while i < len {
        let s = src as usize + i;
        let d = dst as usize + i;
        let remaining = len - i;
        if aligned_to(s, 8) && aligned_to(d, 8) && remaining >= 8 {
            let v = unsafe { AtomicU64::from_ptr(s as *mut u64) }.load(Ordering::SeqCst);
            unsafe { AtomicU64::from_ptr(d as *mut u64) }.swap(v, Ordering::SeqCst);
            i += 8;
        } else if aligned_to(s, 4) && aligned_to(d, 4) && remaining >= 4 {
            let v = unsafe { AtomicU32::from_ptr(s as *mut u32) }.load(Ordering::SeqCst);
            unsafe { AtomicU32::from_ptr(d as *mut u32) }.swap(v, Ordering::SeqCst);
            i += 4;
        } else if aligned_to(s, 2) && aligned_to(d, 2) && remaining >= 2 {
            let v = unsafe { AtomicU16::from_ptr(s as *mut u16) }.load(Ordering::SeqCst);
            unsafe { AtomicU16::from_ptr(d as *mut u16) }.swap(v, Ordering::SeqCst);
            i += 2;
        } else {
            let v = unsafe { AtomicU8::from_ptr(s as *mut u8) }.load(Ordering::SeqCst);
            unsafe { AtomicU8::from_ptr(d as *mut u8) }.swap(v, Ordering::SeqCst);
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_aligned_words() {
        let src = [1i32, 2, 3, 4, 5];
        let mut dst = [0i32; 5];
        unsafe {
            seq_cst_copy(
                dst.as_mut_ptr().cast(),
                src.as_ptr().cast(),
                std::mem::size_of_val(&src),
            );
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn copies_mixed_layout_struct() {
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        struct Mixed {
            a: i32,
            b: i64,
            c: u8,
            next: usize,
        }
        let src = Mixed {
            a: 0x1000,
            b: 0xDEAD_BEEF,
            c: 0x12,
            next: 0x1234,
        };
        let mut dst = Mixed::default();
        unsafe {
            seq_cst_copy(
                std::ptr::addr_of_mut!(dst).cast(),
                std::ptr::addr_of!(src).cast(),
                std::mem::size_of::<Mixed>(),
            );
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn copies_odd_lengths_and_offsets() {
        let src: Vec<u8> = (0..=41).collect();
        let mut dst = vec![0u8; 42];
        // shift by one to force the byte-wise path at the edges
        unsafe { seq_cst_copy(dst.as_mut_ptr().add(1), src.as_ptr(), 41) };
        assert_eq!(&dst[1..42], &src[..41]);
    }

    #[test]
    fn zero_length_is_a_noop() {
        let src = [0u8; 1];
        let mut dst = [9u8; 1];
        unsafe { seq_cst_copy(dst.as_mut_ptr(), src.as_ptr(), 0) };
        assert_eq!(dst[0], 9);
    }
}
