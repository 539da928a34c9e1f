// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Windows x64 implementation.
//!
//! ## Buffer layout
//!
//! ```text
//! +--------+-------------+
//! | Offset | Slot        |
//! +--------+-------------+
//! | 0x00   | result      |
//! | 0x08   | RBX         |
//! | 0x10   | RBP         |
//! | 0x18   | RDI         |
//! | 0x20   | RSI         |
//! | 0x28   | R12         |
//! | 0x30   | R13         |
//! | 0x38   | R14         |
//! | 0x40   | R15         |
//! | 0x48   | RSP         |
//! | 0x50   | RIP         |
//! | 0x60   | XMM6-XMM15  |
//! +--------+-------------+
//! ```
//!
//! Unlike System V, the Windows x64 ABI additionally designates RDI, RSI and
//! the full 128 bits of XMM6-XMM15 as callee-saved, so the buffer carries ten
//! 16-byte vector slots. Arguments arrive in RCX and RDX.

use core::arch::{asm, naked_asm};
use core::mem::offset_of;
use static_assertions::const_assert_eq;

pub const STACK_ALIGNMENT: usize = 16;

/// Saved execution state, one slot per piece of state that must survive the
/// jump.
#[repr(C, align(16))]
pub struct Context {
    pub(crate) result: usize,
    rbx: usize,
    rbp: usize,
    rdi: usize,
    rsi: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
    rsp: usize,
    rip: usize,
    xmm: [u128; 10],
}

const_assert_eq!(size_of::<Context>(), 256);
const_assert_eq!(offset_of!(Context, xmm) % 16, 0);

impl Context {
    pub const fn new() -> Self {
        Self {
            result: 0,
            rbx: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            xmm: [0; 10],
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
            inout("rcx") ctx => _,
            lateout("rax") value,
            // Mark all registers as clobbered. clobber_abi covers the
            // volatile set, the remaining callee-saved registers are listed
            // here. RBX and RBP are LLVM reserved registers and cannot be
            // listed; restore() reloads both with their exact capture-time
            // values instead, which is what a call site expects of a
            // preserved register.
            lateout("rdi") _, lateout("rsi") _,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            lateout("xmm6") _, lateout("xmm7") _, lateout("xmm8") _,
            lateout("xmm9") _, lateout("xmm10") _, lateout("xmm11") _,
            lateout("xmm12") _, lateout("xmm13") _, lateout("xmm14") _,
            lateout("xmm15") _,
            clobber_abi("win64"),
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
        "mov qword ptr [rcx + {result}], 0",
        "mov [rcx + {rbx}], rbx",
        "mov [rcx + {rbp}], rbp",
        "mov [rcx + {rdi}], rdi",
        "mov [rcx + {rsi}], rsi",
        "mov [rcx + {r12}], r12",
        "mov [rcx + {r13}], r13",
        "mov [rcx + {r14}], r14",
        "mov [rcx + {r15}], r15",
        // RSP as the caller will see it once this call has returned.
        "lea rdx, [rsp + 8]",
        "mov [rcx + {rsp}], rdx",
        "mov [rcx + {rip}], rax",
        "movups [rcx + {xmm6}], xmm6",
        "movups [rcx + {xmm7}], xmm7",
        "movups [rcx + {xmm8}], xmm8",
        "movups [rcx + {xmm9}], xmm9",
        "movups [rcx + {xmm10}], xmm10",
        "movups [rcx + {xmm11}], xmm11",
        "movups [rcx + {xmm12}], xmm12",
        "movups [rcx + {xmm13}], xmm13",
        "movups [rcx + {xmm14}], xmm14",
        "movups [rcx + {xmm15}], xmm15",
        "xor eax, eax",
        "ret",
        result = const offset_of!(Context, result),
        rbx = const offset_of!(Context, rbx),
        rbp = const offset_of!(Context, rbp),
        rdi = const offset_of!(Context, rdi),
        rsi = const offset_of!(Context, rsi),
        r12 = const offset_of!(Context, r12),
        r13 = const offset_of!(Context, r13),
        r14 = const offset_of!(Context, r14),
        r15 = const offset_of!(Context, r15),
        rsp = const offset_of!(Context, rsp),
        rip = const offset_of!(Context, rip),
        xmm6 = const offset_of!(Context, xmm),
        xmm7 = const offset_of!(Context, xmm) + 16,
        xmm8 = const offset_of!(Context, xmm) + 32,
        xmm9 = const offset_of!(Context, xmm) + 48,
        xmm10 = const offset_of!(Context, xmm) + 64,
        xmm11 = const offset_of!(Context, xmm) + 80,
        xmm12 = const offset_of!(Context, xmm) + 96,
        xmm13 = const offset_of!(Context, xmm) + 112,
        xmm14 = const offset_of!(Context, xmm) + 128,
        xmm15 = const offset_of!(Context, xmm) + 144,
    )
}

/// Reloads the state saved in `ctx` and makes the matching `capture` call
/// return a second time, with RAX holding `value`.
#[unsafe(naked)]
pub unsafe extern "C" fn restore(ctx: *mut Context, value: usize) -> ! {
    naked_asm!(
        ".balign 16",
        // The result slot must read back as the delivered value.
        "mov [rcx + {result}], rdx",
        "mov rbx, [rcx + {rbx}]",
        "mov rbp, [rcx + {rbp}]",
        "mov rdi, [rcx + {rdi}]",
        "mov rsi, [rcx + {rsi}]",
        "mov r12, [rcx + {r12}]",
        "mov r13, [rcx + {r13}]",
        "mov r14, [rcx + {r14}]",
        "mov r15, [rcx + {r15}]",
        "movups xmm6, [rcx + {xmm6}]",
        "movups xmm7, [rcx + {xmm7}]",
        "movups xmm8, [rcx + {xmm8}]",
        "movups xmm9, [rcx + {xmm9}]",
        "movups xmm10, [rcx + {xmm10}]",
        "movups xmm11, [rcx + {xmm11}]",
        "movups xmm12, [rcx + {xmm12}]",
        "movups xmm13, [rcx + {xmm13}]",
        "movups xmm14, [rcx + {xmm14}]",
        "movups xmm15, [rcx + {xmm15}]",
        "mov rsp, [rcx + {rsp}]",
        "mov rax, rdx",
        "jmp qword ptr [rcx + {rip}]",
        result = const offset_of!(Context, result),
        rbx = const offset_of!(Context, rbx),
        rbp = const offset_of!(Context, rbp),
        rdi = const offset_of!(Context, rdi),
        rsi = const offset_of!(Context, rsi),
        r12 = const offset_of!(Context, r12),
        r13 = const offset_of!(Context, r13),
        r14 = const offset_of!(Context, r14),
        r15 = const offset_of!(Context, r15),
        rsp = const offset_of!(Context, rsp),
        rip = const offset_of!(Context, rip),
        xmm6 = const offset_of!(Context, xmm),
        xmm7 = const offset_of!(Context, xmm) + 16,
        xmm8 = const offset_of!(Context, xmm) + 32,
        xmm9 = const offset_of!(Context, xmm) + 48,
        xmm10 = const offset_of!(Context, xmm) + 64,
        xmm11 = const offset_of!(Context, xmm) + 80,
        xmm12 = const offset_of!(Context, xmm) + 96,
        xmm13 = const offset_of!(Context, xmm) + 112,
        xmm14 = const offset_of!(Context, xmm) + 128,
        xmm15 = const offset_of!(Context, xmm) + 144,
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
        "mov rsp, r8",
        // Shadow space for the callee; also keeps the CALL below at the
        // alignment the ABI expects at function entry.
        "sub rsp, 32",
        "call rdx",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
    )
}
