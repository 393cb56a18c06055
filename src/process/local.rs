//! Reads from our own address space

use std::io;
use std::ptr;

use region::Protection;

use super::ProcessMemory;

/// The calling process.
///
/// Every chunk is checked to be mapped and readable before it's copied, so unmapped or
/// no-access pages end the read instead of faulting.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentProcess;

impl CurrentProcess {
    /// Creates a reader for the current process
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessMemory for CurrentProcess {
    fn read_chunk(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let region = region::query(address as *const u8)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        if region.is_guarded() || !region.protection().contains(Protection::READ) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{:#x} is not readable", address),
            ));
        }

        let len = buf.len().min(region.as_range().end - address);
        // SAFETY: the region was just reported as mapped and readable for `len` bytes from `address`
        unsafe { ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), len) };
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use region::Protection;

    use super::CurrentProcess;
    use crate::process::{read_bytes, read_exact};

    #[test]
    fn test_read_local() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut buffer = [0u8; 8];

        let n = read_bytes(&CurrentProcess::new(), data.as_ptr() as usize, &mut buffer);

        assert_eq!(n, 8);
        assert_eq!(buffer, data);
    }

    #[test]
    /// The second page is no-access, so only the first one is read and the rest is zeroed
    fn test_read_past_mapping() {
        let page_size = region::page::size();
        let mut alloc = region::alloc(page_size * 2, Protection::READ_WRITE).unwrap();
        let base = alloc.as_mut_ptr::<u8>();
        unsafe {
            ptr::write_bytes(base, 0x5a, page_size * 2);
            region::protect(base.add(page_size), page_size, Protection::NONE).unwrap();
        }

        let mut buffer = vec![0xffu8; 64];
        let start = base as usize + page_size - 16;
        let n = read_bytes(&CurrentProcess, start, &mut buffer);

        assert_eq!(n, 16);
        assert!(buffer[..16].iter().all(|b| *b == 0x5a));
        assert!(buffer[16..].iter().all(|b| *b == 0));
        assert!(read_exact(&CurrentProcess, start, &mut buffer).is_err());
    }

    #[test]
    fn test_read_unmapped() {
        let mut buffer = [0xffu8; 16];
        assert_eq!(read_bytes(&CurrentProcess, 0, &mut buffer), 0);
        assert_eq!(buffer, [0; 16]);
    }
}
