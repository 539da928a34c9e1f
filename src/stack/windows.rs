// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{MIN_STACK_SIZE, StackPointer, StackSegment};
use std::io::Error;
use std::ptr;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc, VirtualFree,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// A VirtualAlloc-backed stack segment with a reserved-only guard page at
/// its low end.
///
/// The usable range is committed up front, so stack probes land on
/// committed pages without PAGE_GUARD growth. The TEB's stack bounds are
/// not updated when execution moves onto the segment; see the safety notes
/// on [`crate::on_stack`].
pub struct DefaultStackSegment {
    top: StackPointer,
    alloc_len: usize,
}

impl DefaultStackSegment {
    /// Creates a new segment with at least the given usable capacity.
    ///
    /// # Errors
    ///
    /// Returns the OS error if reserving or committing the allocation fails.
    pub fn new(size: usize) -> std::io::Result<Self> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let alloc_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // Safety: standard VirtualAlloc usage on a fresh reservation.
        unsafe {
            // Reserve address space for the segment.
            let alloc_base = VirtualAlloc(ptr::null(), alloc_len, MEM_RESERVE, PAGE_READWRITE);
            if alloc_base.is_null() {
                return Err(Error::last_os_error());
            }

            // Construct the result before committing so a failure below
            // releases the reservation on drop.
            let out = Self {
                top: StackPointer::new(alloc_base as usize + alloc_len).unwrap(),
                alloc_len,
            };

            // Commit everything except the bottom page, which stays
            // reserved-only and faults on overflow.
            if VirtualAlloc(
                alloc_base.cast::<u8>().add(page_size).cast(),
                alloc_len - page_size,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
            .is_null()
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }
}

impl Default for DefaultStackSegment {
    fn default() -> Self {
        Self::new(1024 * 1024).expect("failed to allocate stack")
    }
}

impl Drop for DefaultStackSegment {
    fn drop(&mut self) {
        // Safety: we own the allocation.
        unsafe {
            let alloc_base = (self.top.get() - self.alloc_len) as *mut _;
            let ret = VirtualFree(alloc_base, 0, MEM_RELEASE);
            debug_assert!(ret != 0);
        }
    }
}

// Safety: the allocation is exclusively owned and VirtualAlloc returns
// page-aligned addresses, which satisfies STACK_ALIGNMENT.
unsafe impl StackSegment for DefaultStackSegment {
    #[inline]
    fn top(&self) -> StackPointer {
        self.top
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.alloc_len).unwrap()
    }
}

fn page_size() -> usize {
    // Safety: GetSystemInfo writes the full SYSTEM_INFO struct.
    unsafe {
        let mut sysinfo: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut sysinfo);
        assert!(sysinfo.dwPageSize.is_power_of_two());
        sysinfo.dwPageSize as usize
    }
}
