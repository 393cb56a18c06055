//! # Process
//!
//! Best-effort copies out of a process's address space, either our own or a foreign one.
//!
//! Reads are chunked at page boundaries and stop at the first chunk that can't be read,
//! so the bytes transferred are always a contiguous prefix of the request.

use std::io;

use log::debug;
use thiserror::Error;

mod local;
pub use local::CurrentProcess;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::RemoteProcess;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::RemoteProcess;

/// A process whose memory can be read.
///
/// Implementors only borrow the underlying process reference; they never close it.
pub trait ProcessMemory {
    /// Reads up to `buf.len()` bytes starting at `address`.
    ///
    /// `address..address + buf.len()` never crosses a page boundary when called from [`read_bytes`].
    /// Returns the number of bytes copied into the front of `buf`.
    fn read_chunk(&self, address: usize, buf: &mut [u8]) -> io::Result<usize>;
}

impl<P: ProcessMemory + ?Sized> ProcessMemory for &P {
    fn read_chunk(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_chunk(address, buf)
    }
}

/// Errors for strict reads
#[derive(Debug, Error)]
pub enum ReadError {
    /// Only part of the requested range could be read
    #[error("read {transferred:#x} of {requested:#x} bytes at {address:#x}")]
    Partial {
        /// Start of the requested range
        address: usize,
        /// Bytes requested
        requested: usize,
        /// Bytes that were actually read
        transferred: usize,
    },
}

/// Copies `buffer.len()` bytes starting at `source` in `process` into `buffer`.
///
/// This never fails. It returns the number of bytes that were transferred; those are always
/// `buffer[..n]`, and everything after them is zero-filled.
pub fn read_bytes<P>(process: &P, source: usize, buffer: &mut [u8]) -> usize
where
    P: ProcessMemory + ?Sized,
{
    let page_size = region::page::size();
    let mut transferred = 0;

    while transferred < buffer.len() {
        let address = match source.checked_add(transferred) {
            Some(address) => address,
            None => break,
        };
        let page_left = page_size - (address & (page_size - 1));
        let len = page_left.min(buffer.len() - transferred);

        match process.read_chunk(address, &mut buffer[transferred..transferred + len]) {
            Ok(n) => {
                transferred += n.min(len);
                if n < len {
                    break;
                }
            }
            Err(error) => {
                debug!("read at {:#x} failed: {}", address, error);
                break;
            }
        }
    }

    if transferred < buffer.len() {
        debug!(
            "short read at {:#x}: {:#x} of {:#x} bytes",
            source,
            transferred,
            buffer.len()
        );
        buffer[transferred..].fill(0);
    }
    transferred
}

/// Like [`read_bytes`], but fails unless every byte was read
pub fn read_exact<P>(process: &P, source: usize, buffer: &mut [u8]) -> Result<(), ReadError>
where
    P: ProcessMemory + ?Sized,
{
    let transferred = read_bytes(process, source, buffer);
    if transferred == buffer.len() {
        Ok(())
    } else {
        Err(ReadError::Partial {
            address: source,
            requested: buffer.len(),
            transferred,
        })
    }
}
