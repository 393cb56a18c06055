//! Foreign process reads through `ReadProcessMemory`

use std::ffi::c_void;
use std::io;
use std::os::windows::io::{AsRawHandle, BorrowedHandle};

use windows_sys::Win32::Foundation::{FALSE, HANDLE};
use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;

use super::ProcessMemory;

/// Another process, through a handle opened by the caller with `PROCESS_VM_READ`.
///
/// The handle is only borrowed and is never closed here.
#[derive(Debug, Clone, Copy)]
pub struct RemoteProcess<'a> {
    /// Borrowed process handle
    handle: BorrowedHandle<'a>,
}

impl<'a> RemoteProcess<'a> {
    /// Wraps a borrowed process handle
    pub fn new(handle: BorrowedHandle<'a>) -> Self {
        Self { handle }
    }
}

impl ProcessMemory for RemoteProcess<'_> {
    fn read_chunk(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut read = 0usize;
        // SAFETY: `buf` is valid for `buf.len()` bytes and the handle is kept alive by the borrow
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.as_raw_handle() as HANDLE,
                address as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut read,
            )
        };
        // a partial copy still reports how much made it across
        if ok == FALSE && read == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(read)
    }
}
