// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RV64 LP64D implementation.
//!
//! ## Buffer layout
//!
//! ```text
//! +--------+-----------+
//! | Offset | Slot      |
//! +--------+-----------+
//! | 0x00   | result    |
//! | 0x08   | S1-S11    |
//! | 0x60   | S0 (FP)   |
//! | 0x68   | SP        |
//! | 0x70   | PC        |
//! | 0x78   | FS0-FS11  |
//! +--------+-----------+
//! ```
//!
//! The LP64D calling convention designates S0-S11 and FS0-FS11 as
//! callee-saved; the FP slots are 64-bit since RV64 preserves scalar
//! doubles, not vectors. As on AArch64 the PC slot is taken from the link
//! register RA, not from the stack. Requires the D extension (riscv64gc).

use core::arch::{asm, naked_asm};
use core::mem::offset_of;
use static_assertions::const_assert_eq;

pub const STACK_ALIGNMENT: usize = 16;

/// Saved execution state, one slot per piece of state that must survive the
/// jump.
#[repr(C)]
pub struct Context {
    pub(crate) result: usize,
    s1: usize,
    s2: usize,
    s3: usize,
    s4: usize,
    s5: usize,
    s6: usize,
    s7: usize,
    s8: usize,
    s9: usize,
    s10: usize,
    s11: usize,
    s0: usize,
    sp: usize,
    pc: usize,
    fs: [u64; 12],
}

const_assert_eq!(size_of::<Context>(), 216);

impl Context {
    pub const fn new() -> Self {
        Self {
            result: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
            s0: 0,
            sp: 0,
            pc: 0,
            fs: [0; 12],
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
            // returns, and again when restore() jumps to the return address
            // capture_raw saved from RA.
            "call {capture_raw}",
            capture_raw = sym capture_raw,
            inout("a0") ctx => value,
            // Mark all registers as clobbered. clobber_abi covers the
            // volatile set, the remaining callee-saved registers are listed
            // here. S0 and S1 are LLVM reserved registers and cannot be
            // listed; restore() reloads both with their exact capture-time
            // values instead, which is what a call site expects of a
            // preserved register.
            lateout("s2") _, lateout("s3") _, lateout("s4") _, lateout("s5") _,
            lateout("s6") _, lateout("s7") _, lateout("s8") _, lateout("s9") _,
            lateout("s10") _, lateout("s11") _,
            lateout("fs0") _, lateout("fs1") _, lateout("fs2") _, lateout("fs3") _,
            lateout("fs4") _, lateout("fs5") _, lateout("fs6") _, lateout("fs7") _,
            lateout("fs8") _, lateout("fs9") _, lateout("fs10") _, lateout("fs11") _,
            clobber_abi("C"),
        );
    }
    value
}

/// Records the caller's resumable state into `ctx` and returns 0.
///
/// The PC stored in the buffer is RA at entry, the instruction after the
/// call to this routine; [`restore`] re-enters there. Callers go through
/// [`capture`], which declares the register state that re-entry clobbers.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_raw(ctx: *mut Context) -> usize {
    naked_asm!(
        ".balign 4",
        // A fresh capture reads as 0 through the result slot.
        "sd zero, {result}(a0)",
        "sd s1, {s1}(a0)",
        "sd s2, {s2}(a0)",
        "sd s3, {s3}(a0)",
        "sd s4, {s4}(a0)",
        "sd s5, {s5}(a0)",
        "sd s6, {s6}(a0)",
        "sd s7, {s7}(a0)",
        "sd s8, {s8}(a0)",
        "sd s9, {s9}(a0)",
        "sd s10, {s10}(a0)",
        "sd s11, {s11}(a0)",
        "sd s0, {s0}(a0)",
        "sd sp, {sp}(a0)",
        // The return address register is where restore() will jump to.
        "sd ra, {pc}(a0)",
        "fsd fs0, {f0}(a0)",
        "fsd fs1, {f1}(a0)",
        "fsd fs2, {f2}(a0)",
        "fsd fs3, {f3}(a0)",
        "fsd fs4, {f4}(a0)",
        "fsd fs5, {f5}(a0)",
        "fsd fs6, {f6}(a0)",
        "fsd fs7, {f7}(a0)",
        "fsd fs8, {f8}(a0)",
        "fsd fs9, {f9}(a0)",
        "fsd fs10, {f10}(a0)",
        "fsd fs11, {f11}(a0)",
        "li a0, 0",
        "ret",
        result = const offset_of!(Context, result),
        s1 = const offset_of!(Context, s1),
        s2 = const offset_of!(Context, s2),
        s3 = const offset_of!(Context, s3),
        s4 = const offset_of!(Context, s4),
        s5 = const offset_of!(Context, s5),
        s6 = const offset_of!(Context, s6),
        s7 = const offset_of!(Context, s7),
        s8 = const offset_of!(Context, s8),
        s9 = const offset_of!(Context, s9),
        s10 = const offset_of!(Context, s10),
        s11 = const offset_of!(Context, s11),
        s0 = const offset_of!(Context, s0),
        sp = const offset_of!(Context, sp),
        pc = const offset_of!(Context, pc),
        f0 = const offset_of!(Context, fs),
        f1 = const offset_of!(Context, fs) + 8,
        f2 = const offset_of!(Context, fs) + 16,
        f3 = const offset_of!(Context, fs) + 24,
        f4 = const offset_of!(Context, fs) + 32,
        f5 = const offset_of!(Context, fs) + 40,
        f6 = const offset_of!(Context, fs) + 48,
        f7 = const offset_of!(Context, fs) + 56,
        f8 = const offset_of!(Context, fs) + 64,
        f9 = const offset_of!(Context, fs) + 72,
        f10 = const offset_of!(Context, fs) + 80,
        f11 = const offset_of!(Context, fs) + 88,
    )
}

/// Reloads the state saved in `ctx` and makes the matching `capture` call
/// return a second time, with A0 holding `value`.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(ctx: *mut Context, value: usize) -> ! {
    naked_asm!(
        ".balign 4",
        // The result slot must read back as the delivered value.
        "sd a1, {result}(a0)",
        "ld s1, {s1}(a0)",
        "ld s2, {s2}(a0)",
        "ld s3, {s3}(a0)",
        "ld s4, {s4}(a0)",
        "ld s5, {s5}(a0)",
        "ld s6, {s6}(a0)",
        "ld s7, {s7}(a0)",
        "ld s8, {s8}(a0)",
        "ld s9, {s9}(a0)",
        "ld s10, {s10}(a0)",
        "ld s11, {s11}(a0)",
        "ld s0, {s0}(a0)",
        "ld sp, {sp}(a0)",
        "ld ra, {pc}(a0)",
        "fld fs0, {f0}(a0)",
        "fld fs1, {f1}(a0)",
        "fld fs2, {f2}(a0)",
        "fld fs3, {f3}(a0)",
        "fld fs4, {f4}(a0)",
        "fld fs5, {f5}(a0)",
        "fld fs6, {f6}(a0)",
        "fld fs7, {f7}(a0)",
        "fld fs8, {f8}(a0)",
        "fld fs9, {f9}(a0)",
        "fld fs10, {f10}(a0)",
        "fld fs11, {f11}(a0)",
        "mv a0, a1",
        "ret",
        result = const offset_of!(Context, result),
        s1 = const offset_of!(Context, s1),
        s2 = const offset_of!(Context, s2),
        s3 = const offset_of!(Context, s3),
        s4 = const offset_of!(Context, s4),
        s5 = const offset_of!(Context, s5),
        s6 = const offset_of!(Context, s6),
        s7 = const offset_of!(Context, s7),
        s8 = const offset_of!(Context, s8),
        s9 = const offset_of!(Context, s9),
        s10 = const offset_of!(Context, s10),
        s11 = const offset_of!(Context, s11),
        s0 = const offset_of!(Context, s0),
        sp = const offset_of!(Context, sp),
        pc = const offset_of!(Context, pc),
        f0 = const offset_of!(Context, fs),
        f1 = const offset_of!(Context, fs) + 8,
        f2 = const offset_of!(Context, fs) + 16,
        f3 = const offset_of!(Context, fs) + 24,
        f4 = const offset_of!(Context, fs) + 32,
        f5 = const offset_of!(Context, fs) + 40,
        f6 = const offset_of!(Context, fs) + 48,
        f7 = const offset_of!(Context, fs) + 56,
        f8 = const offset_of!(Context, fs) + 64,
        f9 = const offset_of!(Context, fs) + 72,
        f10 = const offset_of!(Context, fs) + 80,
        f11 = const offset_of!(Context, fs) + 88,
    )
}

/// Calls `f(arg)` on the stack whose top is `stack_top`, switching back once
/// `f` returns.
///
/// The old stack pointer is parked in S0 across the call, which `f` must
/// preserve per the ABI.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stack_and_call(
    arg: *mut u8,
    f: unsafe extern "C" fn(*mut u8),
    stack_top: usize,
) {
    naked_asm!(
        ".balign 4",
        "addi sp, sp, -16",
        "sd ra, 8(sp)",
        "sd s0, 0(sp)",
        "mv s0, sp",
        "mv sp, a2",
        "jalr a1",
        "mv sp, s0",
        "ld s0, 0(sp)",
        "ld ra, 8(sp)",
        "addi sp, sp, 16",
        "ret",
    )
}
