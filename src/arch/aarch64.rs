// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AAPCS64 implementation.
//!
//! ## Buffer layout
//!
//! ```text
//! +--------+-----------+
//! | Offset | Slot      |
//! +--------+-----------+
//! | 0x00   | result    |
//! | 0x08   | X19-X28   |
//! | 0x58   | X29 (FP)  |
//! | 0x60   | SP        |
//! | 0x68   | PC        |
//! | 0x70   | Q8-Q15    |
//! +--------+-----------+
//! ```
//!
//! AAPCS64 designates X19-X28, the frame pointer X29 and the low halves of
//! V8-V15 as callee-saved. The buffer stores the vector registers at their
//! full 128-bit width; restoring the upper halves as well is harmless since
//! callers may not rely on them anyway. There is no return address on the
//! stack to read: the PC slot is taken from the link register.

use core::arch::{asm, naked_asm};
use core::mem::offset_of;
use static_assertions::const_assert_eq;

pub const STACK_ALIGNMENT: usize = 16;

/// Saved execution state, one slot per piece of state that must survive the
/// jump.
#[repr(C, align(16))]
pub struct Context {
    pub(crate) result: usize,
    x19: usize,
    x20: usize,
    x21: usize,
    x22: usize,
    x23: usize,
    x24: usize,
    x25: usize,
    x26: usize,
    x27: usize,
    x28: usize,
    x29: usize,
    sp: usize,
    pc: usize,
    v: [u128; 8],
}

const_assert_eq!(size_of::<Context>(), 240);
const_assert_eq!(offset_of!(Context, v) % 16, 0);

impl Context {
    pub const fn new() -> Self {
        Self {
            result: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            x29: 0,
            sp: 0,
            pc: 0,
            v: [0; 8],
        }
    }
}

/// Records the caller's resumable state into `ctx`, forcing every live
/// value out of the register file first.
///
/// A later [`restore`] rolls the callee-saved registers back to the values
/// recorded here, so anything live across this point must sit in memory
/// rather than a register. Listing the callee-saved registers as clobbers
/// makes the compiler spill around the call and reload afterwards, on the
/// resumed path as well as the normal one.
#[inline(always)]
pub unsafe fn capture(ctx: *mut Context) -> usize {
    let value: usize;
    // Safety: capture_raw writes only through `ctx`; every register the
    // resumed path re-enters with is covered by the operands and clobbers.
    unsafe {
        asm!(
            // Execution continues from here twice: once when capture_raw
            // returns, and again when restore() jumps to the link register
            // value capture_raw saved.
            "bl {capture_raw}",
            capture_raw = sym capture_raw,
            inout("x0") ctx => value,
            // Mark all registers as clobbered. clobber_abi covers the
            // volatile set including V8-V15, whose upper halves are not
            // preserved anyway; the remaining callee-saved registers are
            // listed here. X19 and X29 are LLVM reserved registers and
            // cannot be listed; restore() reloads both with their exact
            // capture-time values instead, which is what a call site
            // expects of a preserved register.
            lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
            lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
            lateout("x28") _,
            clobber_abi("C"),
        );
    }
    value
}

/// Records the caller's resumable state into `ctx` and returns 0.
///
/// The PC stored in the buffer is the link register at entry, the
/// instruction after the call to this routine; [`restore`] re-enters
/// there. Callers go through [`capture`], which declares the register
/// state that re-entry clobbers.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_raw(ctx: *mut Context) -> usize {
    naked_asm!(
        ".balign 4",
        // A fresh capture reads as 0 through the result slot.
        "str xzr, [x0, #{result}]",
        "stp x19, x20, [x0, #{x19}]",
        "stp x21, x22, [x0, #{x21}]",
        "stp x23, x24, [x0, #{x23}]",
        "stp x25, x26, [x0, #{x25}]",
        "stp x27, x28, [x0, #{x27}]",
        "str x29, [x0, #{x29}]",
        "mov x9, sp",
        "str x9, [x0, #{sp}]",
        // The link register is where restore() will jump to.
        "str lr, [x0, #{pc}]",
        "stp q8, q9, [x0, #{v8}]",
        "stp q10, q11, [x0, #{v10}]",
        "stp q12, q13, [x0, #{v12}]",
        "stp q14, q15, [x0, #{v14}]",
        "mov x0, #0",
        "ret",
        result = const offset_of!(Context, result),
        x19 = const offset_of!(Context, x19),
        x21 = const offset_of!(Context, x21),
        x23 = const offset_of!(Context, x23),
        x25 = const offset_of!(Context, x25),
        x27 = const offset_of!(Context, x27),
        x29 = const offset_of!(Context, x29),
        sp = const offset_of!(Context, sp),
        pc = const offset_of!(Context, pc),
        v8 = const offset_of!(Context, v),
        v10 = const offset_of!(Context, v) + 32,
        v12 = const offset_of!(Context, v) + 64,
        v14 = const offset_of!(Context, v) + 96,
    )
}

/// Reloads the state saved in `ctx` and makes the matching `capture` call
/// return a second time, with X0 holding `value`.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(ctx: *mut Context, value: usize) -> ! {
    naked_asm!(
        ".balign 4",
        // The result slot must read back as the delivered value.
        "str x1, [x0, #{result}]",
        "ldp x19, x20, [x0, #{x19}]",
        "ldp x21, x22, [x0, #{x21}]",
        "ldp x23, x24, [x0, #{x23}]",
        "ldp x25, x26, [x0, #{x25}]",
        "ldp x27, x28, [x0, #{x27}]",
        "ldr x29, [x0, #{x29}]",
        "ldr x9, [x0, #{sp}]",
        "mov sp, x9",
        "ldr lr, [x0, #{pc}]",
        "ldp q8, q9, [x0, #{v8}]",
        "ldp q10, q11, [x0, #{v10}]",
        "ldp q12, q13, [x0, #{v12}]",
        "ldp q14, q15, [x0, #{v14}]",
        "mov x0, x1",
        "ret",
        result = const offset_of!(Context, result),
        x19 = const offset_of!(Context, x19),
        x21 = const offset_of!(Context, x21),
        x23 = const offset_of!(Context, x23),
        x25 = const offset_of!(Context, x25),
        x27 = const offset_of!(Context, x27),
        x29 = const offset_of!(Context, x29),
        sp = const offset_of!(Context, sp),
        pc = const offset_of!(Context, pc),
        v8 = const offset_of!(Context, v),
        v10 = const offset_of!(Context, v) + 32,
        v12 = const offset_of!(Context, v) + 64,
        v14 = const offset_of!(Context, v) + 96,
    )
}

/// Calls `f(arg)` on the stack whose top is `stack_top`, switching back once
/// `f` returns.
///
/// The old stack pointer is parked in X29 across the call, which `f` must
/// preserve per the ABI.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stack_and_call(
    arg: *mut u8,
    f: unsafe extern "C" fn(*mut u8),
    stack_top: usize,
) {
    naked_asm!(
        ".balign 4",
        "stp x29, x30, [sp, #-16]!",
        "mov x29, sp",
        "mov sp, x2",
        "blr x1",
        "mov sp, x29",
        "ldp x29, x30, [sp], #16",
        "ret",
    )
}
