// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System V AMD64 implementation.
//!
//! ## Buffer layout
//!
//! ```text
//! +--------+--------+
//! | Offset | Slot   |
//! +--------+--------+
//! | 0x00   | result |
//! | 0x08   | RBX    |
//! | 0x10   | RBP    |
//! | 0x18   | R12    |
//! | 0x20   | R13    |
//! | 0x28   | R14    |
//! | 0x30   | R15    |
//! | 0x38   | RSP    |
//! | 0x40   | RIP    |
//! +--------+--------+
//! ```
//!
//! The System V ABI designates RBX, RBP, RSP and R12-R15 as callee-saved and
//! treats every vector register as call-clobbered, so this layout carries no
//! vector area. The saved RSP is the value the caller observes *after* the
//! capture call has returned; `restore` can therefore jump through the saved
//! RIP directly without popping a return address first.

use core::arch::{asm, naked_asm};
use core::mem::offset_of;
use static_assertions::const_assert_eq;

pub const STACK_ALIGNMENT: usize = 16;

/// Saved execution state, one slot per piece of state that must survive the
/// jump.
#[repr(C)]
pub struct Context {
    pub(crate) result: usize,
    rbx: usize,
    rbp: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
    rsp: usize,
    rip: usize,
}

const_assert_eq!(size_of::<Context>(), 72);

impl Context {
    pub const fn new() -> Self {
        Self {
            result: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
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
            // capture_raw saved.
            "call {capture_raw}",
            capture_raw = sym capture_raw,
            inout("rdi") ctx => _,
            lateout("rax") value,
            // Mark all registers as clobbered. Most of the work is done by
            // clobber_abi, we just add the remaining callee-saved registers
            // here. RBX and RBP are LLVM reserved registers and cannot be
            // listed; restore() reloads both with their exact capture-time
            // values instead, which is what a call site expects of a
            // preserved register.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        );
    }
    value
}

/// Records the caller's resumable state into `ctx` and returns 0.
///
/// The return address stored in the buffer is the instruction after the
/// call to this routine; [`restore`] re-enters there. Callers go through
/// [`capture`], which declares the register state that re-entry clobbers.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_raw(ctx: *mut Context) -> usize {
    naked_asm!(
        ".balign 16",
        // The return address of this call is where restore() will jump to.
        "mov rax, [rsp]",
        // A fresh capture reads as 0 through the result slot.
        "mov qword ptr [rdi + {result}], 0",
        "mov [rdi + {rbx}], rbx",
        "mov [rdi + {rbp}], rbp",
        "mov [rdi + {r12}], r12",
        "mov [rdi + {r13}], r13",
        "mov [rdi + {r14}], r14",
        "mov [rdi + {r15}], r15",
        // RSP as the caller will see it once this call has returned.
        "lea rcx, [rsp + 8]",
        "mov [rdi + {rsp}], rcx",
        "mov [rdi + {rip}], rax",
        "xor eax, eax",
        "ret",
        result = const offset_of!(Context, result),
        rbx = const offset_of!(Context, rbx),
        rbp = const offset_of!(Context, rbp),
        r12 = const offset_of!(Context, r12),
        r13 = const offset_of!(Context, r13),
        r14 = const offset_of!(Context, r14),
        r15 = const offset_of!(Context, r15),
        rsp = const offset_of!(Context, rsp),
        rip = const offset_of!(Context, rip),
    )
}

/// Reloads the state saved in `ctx` and makes the matching `capture` call
/// return a second time, with RAX holding `value`.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(ctx: *mut Context, value: usize) -> ! {
    naked_asm!(
        ".balign 16",
        // The result slot must read back as the delivered value.
        "mov [rdi + {result}], rsi",
        "mov rbx, [rdi + {rbx}]",
        "mov rbp, [rdi + {rbp}]",
        "mov r12, [rdi + {r12}]",
        "mov r13, [rdi + {r13}]",
        "mov r14, [rdi + {r14}]",
        "mov r15, [rdi + {r15}]",
        "mov rsp, [rdi + {rsp}]",
        "mov rax, rsi",
        "jmp qword ptr [rdi + {rip}]",
        result = const offset_of!(Context, result),
        rbx = const offset_of!(Context, rbx),
        rbp = const offset_of!(Context, rbp),
        r12 = const offset_of!(Context, r12),
        r13 = const offset_of!(Context, r13),
        r14 = const offset_of!(Context, r14),
        r15 = const offset_of!(Context, r15),
        rsp = const offset_of!(Context, rsp),
        rip = const offset_of!(Context, rip),
    )
}

/// Calls `f(arg)` on the stack whose top is `stack_top`, switching back once
/// `f` returns.
///
/// The old stack pointer is parked in RBP across the call, which `f` must
/// preserve per the ABI.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stack_and_call(
    arg: *mut u8,
    f: unsafe extern "C" fn(*mut u8),
    stack_top: usize,
) {
    naked_asm!(
        ".balign 16",
        "push rbp",
        "mov rbp, rsp",
        // The segment top is STACK_ALIGNMENT-aligned, so the CALL below
        // leaves the stack in the state the ABI expects at function entry.
        "mov rsp, rdx",
        "call rsi",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
    )
}
