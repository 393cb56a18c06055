//! Foreign process reads through `process_vm_readv`

use std::io;

use super::ProcessMemory;

/// Another process, identified by pid.
///
/// The caller needs ptrace-level access to the target (same user with a permissive
/// `ptrace_scope`, or `CAP_SYS_PTRACE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteProcess {
    /// Target process id
    pid: libc::pid_t,
}

impl RemoteProcess {
    /// Wraps a process id. Nothing is opened, so there is nothing to close.
    pub fn from_pid(pid: u32) -> Self {
        Self {
            pid: pid as libc::pid_t,
        }
    }

    /// The wrapped process id
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }
}

impl ProcessMemory for RemoteProcess {
    fn read_chunk(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: buf.len(),
        };

        // SAFETY: `local` covers exactly `buf`; the remote side is validated by the kernel
        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(read as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use region::Protection;

    use super::RemoteProcess;
    use crate::process::read_bytes;

    #[test]
    /// Reading ourselves through the foreign-process path
    fn test_read_self() {
        let data = *b"nearpatch";
        let mut buffer = [0u8; 9];
        let process = RemoteProcess::from_pid(std::process::id());

        assert_eq!(read_bytes(&process, data.as_ptr() as usize, &mut buffer), 9);
        assert_eq!(&buffer, b"nearpatch");
    }

    #[test]
    fn test_read_self_partial() {
        let page_size = region::page::size();
        let mut alloc = region::alloc(page_size * 2, Protection::READ_WRITE).unwrap();
        let base = alloc.as_mut_ptr::<u8>();
        unsafe {
            ptr::write_bytes(base, 0x11, page_size * 2);
            region::protect(base.add(page_size), page_size, Protection::NONE).unwrap();
        }

        let process = RemoteProcess::from_pid(std::process::id());
        let mut buffer = vec![0xffu8; 32];
        let n = read_bytes(&process, base as usize + page_size - 8, &mut buffer);

        assert_eq!(n, 8);
        assert_eq!(buffer[..8], [0x11; 8]);
        assert!(buffer[8..].iter().all(|b| *b == 0));
    }
}
