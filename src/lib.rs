//! Capture and restore of a thread's execution state.
//!
//! This crate provides [`Checkpoint`], a fixed-layout buffer holding
//! everything the calling thread needs to resume execution at a previously
//! recorded point: the callee-saved registers, the stack pointer, the frame
//! pointer, and the return address of the recording call.
//! [`Checkpoint::capture`] records that state and returns
//! [`CaptureResult::Fresh`]; [`Checkpoint::restore`] loads the state back
//! into the CPU and makes the original `capture` call return a second time,
//! this time yielding the supplied value. This is the primitive underneath
//! stackful coroutines, green-thread schedulers and exception-style
//! non-local exits.
//!
//! A capture only stays restorable while the stack region it references is
//! valid. Captures that must outlive the capturing call frame are placed on
//! a dedicated [`stack::StackSegment`], entered through [`on_stack`]; a
//! buffer captured on the ordinary call stack becomes stale the moment
//! execution unwinds past the capturing frame.
//!
//! Restoring discards every frame between the capture point and the restore
//! call *without* running `Drop`. Cleanup of anything live in those frames
//! is the caller's job and must happen before the restore.
//!
//! ```
//! use core::num::NonZeroUsize;
//! use checkpoint::{CaptureResult, Checkpoint};
//!
//! let mut cp = Checkpoint::new();
//! // Safety: the capturing frame stays live until the restore below.
//! match unsafe { cp.capture() } {
//!     CaptureResult::Fresh => {
//!         // Safety: `cp` was captured above and its frame is still live.
//!         unsafe { cp.restore(NonZeroUsize::new(42).unwrap()) }
//!     }
//!     CaptureResult::Resumed(value) => assert_eq!(value.get(), 42),
//! }
//! ```

#![cfg_attr(all(not(test), target_os = "none"), no_std)]

mod arch;
pub mod stack;

use core::mem::ManuallyDrop;
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{Ordering, compiler_fence};

use crate::stack::StackSegment;

/// Value observed when a [`Checkpoint::capture`] call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureResult {
    /// The state was just recorded; execution continues normally.
    Fresh,

    /// A [`Checkpoint::restore`] jumped back here, carrying this value.
    Resumed(NonZeroUsize),
}

impl CaptureResult {
    /// Returns whether this is a fresh capture rather than a resumption.
    #[must_use]
    pub fn is_fresh(self) -> bool {
        matches!(self, CaptureResult::Fresh)
    }

    /// Returns the resumption value as an `Option<NonZeroUsize>`.
    #[must_use]
    pub fn into_resumed(self) -> Option<NonZeroUsize> {
        match self {
            CaptureResult::Fresh => None,
            CaptureResult::Resumed(value) => Some(value),
        }
    }
}

/// A recorded execution state that can be jumped back to.
///
/// The buffer is written once per [`capture`] and may be restored from any
/// number of times while the stack region it references remains valid;
/// repeated restores from one capture are the basis of replay patterns. The
/// layout is an internal contract between the capture and restore halves of
/// one build: treat the buffer as an opaque blob tied to one
/// architecture/ABI, never as portable data.
///
/// A `Checkpoint` is plain memory. Dropping it is always fine; it is the
/// *restore* that must not happen once the referenced stack is gone.
///
/// [`capture`]: Checkpoint::capture
pub struct Checkpoint(arch::Context);

impl Checkpoint {
    /// Creates an empty checkpoint. It records nothing until
    /// [`capture`](Checkpoint::capture) runs.
    #[must_use]
    pub const fn new() -> Self {
        Self(arch::Context::new())
    }

    /// Records the calling thread's resumable state into this buffer.
    ///
    /// Returns [`CaptureResult::Fresh`] when called; returns
    /// [`CaptureResult::Resumed`] with the restored value every time a
    /// matching [`restore`](Checkpoint::restore) jumps back here.
    ///
    /// # Safety
    ///
    /// This is `setjmp` with another name, and the `setjmp` rules apply:
    ///
    /// - A later `restore` must only run while the stack region holding the
    ///   capturing frame is still valid and untouched since the capture.
    /// - A restore rolls the callee-saved registers back to their
    ///   capture-time contents. The capture site declares them as clobbered,
    ///   so everything live here is spilled to memory first and the rollback
    ///   cannot revert it. State *mutated* between the capture and a restore
    ///   must additionally live in memory the optimizer cannot prove private
    ///   to the discarded path (a heap allocation, or anything reached
    ///   through a reference that has crossed an opaque boundary); the jump
    ///   back is invisible to the compiler, the same way `setjmp` demands
    ///   `volatile` for locals changed before a `longjmp`.
    #[inline(always)]
    pub unsafe fn capture(&mut self) -> CaptureResult {
        // Safety: `self.0` is a valid, exclusively borrowed buffer.
        let value = unsafe { arch::capture(&mut self.0) };
        match NonZeroUsize::new(value) {
            None => CaptureResult::Fresh,
            Some(value) => CaptureResult::Resumed(value),
        }
    }

    /// Jumps back to the matching [`capture`](Checkpoint::capture) call,
    /// which returns a second time yielding `value`.
    ///
    /// Control leaves permanently through the recorded return address; every
    /// frame between the capture point and this call is discarded without
    /// running `Drop`.
    ///
    /// # Safety
    ///
    /// - The buffer must have been filled by a previous `capture`.
    /// - The stack region referenced by the capture must still be valid and
    ///   unmodified since the capture (see
    ///   [`stack::StackSegment`] for captures that outlive their frame).
    /// - Anything needing cleanup in the discarded frames must have been
    ///   torn down before this call.
    #[inline(always)]
    pub unsafe fn restore(&mut self, value: NonZeroUsize) -> ! {
        compiler_fence(Ordering::SeqCst);
        // Safety: ensured by caller
        unsafe { arch::restore(&mut self.0, value.get()) }
    }

    /// Returns the contents of the result slot: 0 after a fresh capture,
    /// the delivered value after a restore.
    #[must_use]
    pub fn result(&self) -> usize {
        self.0.result
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `f` on the given stack segment, returning once `f` returns.
///
/// This is the hook for placing a capture on an independently managed stack:
/// a [`Checkpoint`] captured inside `f` references the segment rather than
/// the thread stack, so it stays restorable for as long as the segment is
/// alive and untouched, even after `on_stack` itself has returned by way of
/// a restore.
///
/// # Safety
///
/// - The segment must be large enough for everything `f` calls; nothing
///   catches an overflow beyond the segment's guard page.
/// - `f` must not unwind. A panic crossing the stack switch aborts the
///   process at the `extern "C"` boundary.
/// - On Windows the TEB's stack bounds are not updated for the switch and
///   keep describing the thread stack. Anything that validates the stack
///   pointer against them while `f` runs, SEH exception dispatch in
///   particular, will misbehave on the segment.
pub unsafe fn on_stack<S: StackSegment, F: FnOnce()>(stack: &S, f: F) {
    unsafe extern "C" fn shim<F: FnOnce()>(obj: *mut u8) {
        // Safety: `obj` points to the initialized closure written by
        // `on_stack` below and is consumed exactly once.
        let f = unsafe { ManuallyDrop::take(&mut *obj.cast::<ManuallyDrop<F>>()) };
        f();
    }

    let mut f = ManuallyDrop::new(f);
    // Safety: the segment top is aligned per the StackSegment contract; the
    // caller guarantees the segment can hold the frames of `f`.
    unsafe {
        arch::switch_stack_and_call(
            ptr::from_mut(&mut f).cast::<u8>(),
            shim::<F>,
            stack.top().get(),
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::stack::{DefaultStackSegment, MIN_STACK_SIZE, STACK_ALIGNMENT, StackSegment};
    use crate::{CaptureResult, Checkpoint, on_stack};
    use core::num::NonZeroUsize;
    use std::cell::Cell;
    use std::hint::black_box;

    fn nz(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    // Burn through the register file so a restore visibly rewinds it.
    #[inline(never)]
    fn churn() {
        let mut acc = 0_usize;
        for i in 0..64_usize {
            acc = acc.wrapping_mul(0x9e37_79b9).wrapping_add(black_box(i));
        }
        black_box(acc);
    }

    #[test]
    fn fresh_capture_is_sentinel() {
        let mut cp = Checkpoint::new();
        assert!(unsafe { cp.capture() }.is_fresh());
        assert_eq!(cp.result(), 0);
    }

    #[test]
    fn round_trip() {
        let mut cp = Checkpoint::new();
        match unsafe { cp.capture() } {
            CaptureResult::Fresh => unsafe { cp.restore(nz(42)) },
            CaptureResult::Resumed(value) => {
                assert_eq!(value.get(), 42);
                assert_eq!(cp.result(), 42);
            }
        }
    }

    #[test]
    fn repeated_resume_observes_values_in_order() {
        let mut cp = Checkpoint::new();
        let hits = Cell::new(0_u32);
        let seen = Cell::new(0_usize);
        // The jump back into `capture` is an edge the optimizer never sees;
        // state carried across it has to sit in memory it cannot prove
        // private to the discarded path.
        let hits = black_box(&hits);
        let seen = black_box(&seen);

        match unsafe { cp.capture() } {
            CaptureResult::Fresh => {}
            CaptureResult::Resumed(value) => {
                assert_eq!(value.get(), seen.get() + 1);
                seen.set(value.get());
                hits.set(hits.get() + 1);
            }
        }
        if seen.get() < 3 {
            unsafe { cp.restore(nz(seen.get() + 1)) };
        }

        assert_eq!(hits.get(), 3);
        assert_eq!(seen.get(), 3);
        assert_eq!(cp.result(), 3);
    }

    #[test]
    fn locals_survive_resume() {
        let a = black_box(0x1234_5678_9abc_def0_usize);
        let b = black_box(core::f64::consts::PI);

        let mut cp = Checkpoint::new();
        if unsafe { cp.capture() }.is_fresh() {
            churn();
            unsafe { cp.restore(nz(1)) };
        }

        assert_eq!(black_box(a), 0x1234_5678_9abc_def0);
        assert!(black_box(b) == core::f64::consts::PI);
    }

    #[test]
    fn live_values_survive_resume() {
        // Enough live values that several land in callee-saved registers,
        // all of which the capture site must force into memory.
        let a = black_box(0x0123_4567_89ab_cdef_usize);
        let b = black_box(0xfedc_ba98_7654_3210_usize);
        let c = black_box(0x0f0f_0f0f_0f0f_0f0f_usize);
        let d = black_box(0xf0f0_f0f0_f0f0_f0f0_usize);
        let e = black_box(0x5555_aaaa_5555_aaaa_usize);
        let f = black_box(0xaaaa_5555_aaaa_5555_usize);
        let x = black_box(core::f64::consts::E);
        let y = black_box(core::f64::consts::SQRT_2);

        let mut cp = Checkpoint::new();
        if unsafe { cp.capture() }.is_fresh() {
            churn();
            unsafe { cp.restore(nz(1)) };
        }

        assert_eq!(a, 0x0123_4567_89ab_cdef);
        assert_eq!(b, 0xfedc_ba98_7654_3210);
        assert_eq!(c, 0x0f0f_0f0f_0f0f_0f0f);
        assert_eq!(d, 0xf0f0_f0f0_f0f0_f0f0);
        assert_eq!(e, 0x5555_aaaa_5555_aaaa);
        assert_eq!(f, 0xaaaa_5555_aaaa_5555);
        assert!(x == core::f64::consts::E);
        assert!(y == core::f64::consts::SQRT_2);
    }

    #[test]
    fn discarded_frames_do_not_run_their_tails() {
        fn dive(cp: *mut Checkpoint, depth: usize, reached: &Cell<bool>) {
            if depth == 0 {
                unsafe { (*cp).restore(NonZeroUsize::new(7).unwrap()) };
            }
            dive(cp, depth - 1, reached);
            // Only reachable if the restore above never fired.
            reached.set(true);
        }

        let mut cp = Checkpoint::new();
        let reached = Cell::new(false);
        let reached = black_box(&reached);
        match unsafe { cp.capture() } {
            CaptureResult::Fresh => {
                dive(&mut cp, 8, reached);
                unreachable!("the innermost frame always restores");
            }
            CaptureResult::Resumed(value) => {
                assert_eq!(value.get(), 7);
                assert!(!reached.get());
            }
        }
    }

    #[test]
    fn runs_on_the_provided_stack() {
        let stack = DefaultStackSegment::new(64 * 1024).unwrap();
        let bottom = stack.bottom().get();
        let top = stack.top().get();

        let mut on_segment = false;
        unsafe {
            on_stack(&stack, || {
                let probe = 0_u8;
                let addr = core::ptr::from_ref(&probe) as usize;
                on_segment = (bottom..top).contains(&addr);
            });
        }
        assert!(on_segment);
    }

    #[test]
    fn restore_from_unrelated_call_path() {
        struct Shared {
            parent: Checkpoint,
            inner: Checkpoint,
            observed: usize,
        }

        let stack = DefaultStackSegment::default();
        let mut shared = Shared {
            parent: Checkpoint::new(),
            inner: Checkpoint::new(),
            observed: 0,
        };
        let s: *mut Shared = &mut shared;

        match unsafe { (*s).parent.capture() } {
            CaptureResult::Fresh => {
                unsafe {
                    on_stack(&stack, move || {
                        // Runs on the segment. The capture below references
                        // segment memory, so it outlives the hop back to
                        // the parent context.
                        match (*s).inner.capture() {
                            CaptureResult::Fresh => (*s).parent.restore(nz(1)),
                            CaptureResult::Resumed(value) => {
                                (*s).observed = value.get();
                                (*s).parent.restore(nz(2))
                            }
                        }
                    });
                }
                unreachable!("the closure never returns normally");
            }
            CaptureResult::Resumed(value) if value.get() == 1 => {
                // Second, unrelated call path: jump back into the segment.
                unsafe { (*s).inner.restore(nz(42)) }
            }
            CaptureResult::Resumed(value) => {
                assert_eq!(value.get(), 2);
                assert_eq!(unsafe { (*s).observed }, 42);
            }
        }
    }

    #[test]
    fn segment_bounds_are_aligned() {
        let stack = DefaultStackSegment::new(MIN_STACK_SIZE).unwrap();
        assert_eq!(stack.top().get() % STACK_ALIGNMENT, 0);
        assert_eq!(stack.bottom().get() % STACK_ALIGNMENT, 0);
        assert!(stack.top().get() - stack.bottom().get() >= MIN_STACK_SIZE);
    }
}
