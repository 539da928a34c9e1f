//! Stack segments that captured call frames can live on.
//!
//! A context buffer only stays restorable while the stack it references is
//! valid, so callers that want to keep a capture alive past the capturing
//! frame place it on an independently managed [`StackSegment`] instead of
//! the thread's ordinary call stack.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod valgrind;
        mod unix;
        pub use unix::DefaultStackSegment;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::DefaultStackSegment;
    }
}

pub(crate) type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack segment, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

pub use crate::arch::STACK_ALIGNMENT;

/// A region of memory usable as a call stack.
///
/// # Safety
///
/// Implementations must hand out a region that is writable, exclusively
/// owned for the lifetime of the value, and at least [`MIN_STACK_SIZE`]
/// bytes between `bottom` and `top`.
pub unsafe trait StackSegment {
    /// Returns the highest address (start address) of the segment.
    ///
    /// This must be aligned to [`STACK_ALIGNMENT`].
    fn top(&self) -> StackPointer;

    /// Returns the lowest address (maximum limit) of the segment.
    ///
    /// This must include any guard pages and be aligned to
    /// [`STACK_ALIGNMENT`].
    fn bottom(&self) -> StackPointer;
}

/// A mutable reference to a segment can be used as a segment. Anything
/// captured on it is tied to the lifetime of the reference.
unsafe impl<S: StackSegment> StackSegment for &mut S {
    #[inline]
    fn top(&self) -> StackPointer {
        (**self).top()
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        (**self).bottom()
    }
}
