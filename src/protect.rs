//! # Protect
//!
//! Temporarily elevates a region to read+write+execute, runs a mutation, then puts the original protection back

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};

use log::debug;
use region::Protection;
use thiserror::Error;

/// Errors when changing memory protections around a mutation
#[derive(Debug, Error)]
pub enum ProtectError {
    /// The region could not be made writable. The mutation was not run.
    #[error("failed to elevate protection of {size:#x} bytes at {address:#x}")]
    Elevate {
        /// Start of the requested region
        address: usize,
        /// Size of the requested region
        size: usize,
        /// Underlying protection error
        #[source]
        source: region::Error,
    },
    /// The mutation ran but the original protection could not be put back.
    ///
    /// The region is left in an unknown protection state, so the enclosing patch must be treated as failed.
    #[error("failed to restore protection of {size:#x} bytes at {address:#x}")]
    Restore {
        /// Start of the requested region
        address: usize,
        /// Size of the requested region
        size: usize,
        /// Underlying protection error
        #[source]
        source: region::Error,
    },
    /// Zero-sized regions have no protection to change
    #[error("cannot change protection of an empty region at {0:#x}")]
    EmptyRegion(usize),
}

/// Protection flags captured before an elevation, one entry per mapped region overlapping the request
struct ProtectionToken {
    /// Page-aligned sub-ranges with the protection they had before elevation
    regions: Vec<(Range<usize>, Protection)>,
}

impl ProtectionToken {
    /// Records the protection of every page touched by `address..address + size`.
    ///
    /// Fails with [`region::Error::UnmappedRegion`] if any page in the range is not mapped.
    fn capture(address: *const u8, size: usize) -> Result<Self, region::Error> {
        let pages = page_range(address as usize, size);
        let mut regions = Vec::new();
        let mut covered = pages.start;

        for region in region::query_range(address, size)? {
            let region = region?;
            let range = region.as_range();
            if range.start > covered {
                // gap in the mapping
                return Err(region::Error::UnmappedRegion);
            }
            let start = range.start.max(pages.start);
            let end = range.end.min(pages.end);
            if start < end {
                regions.push((start..end, region.protection()));
                covered = end;
            }
        }

        if covered < pages.end {
            return Err(region::Error::UnmappedRegion);
        }
        Ok(Self { regions })
    }

    /// Puts every captured region back to its original protection.
    ///
    /// All regions are attempted even after a failure; the first error is returned.
    fn restore(self) -> Result<(), region::Error> {
        let mut result = Ok(());
        for (range, protection) in self.regions {
            // SAFETY: the range was mapped when captured and we only ever hand back its own flags
            let restored =
                unsafe { region::protect(range.start as *const u8, range.len(), protection) };
            if let Err(error) = restored {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        result
    }
}

/// Rounds `address..address + size` out to page boundaries
fn page_range(address: usize, size: usize) -> Range<usize> {
    let page_size = region::page::size();
    let start = address & !(page_size - 1);
    let end = address
        .saturating_add(size)
        .saturating_add(page_size - 1)
        & !(page_size - 1);
    start..end
}

/// Makes `address..address + size` read+write+execute, runs `mutation`, then restores the previous protection.
///
/// Returns `Ok(())` only when both the elevation and the restoration succeed.
/// The mutation's own outcome is not reported; capture a flag in the closure if it matters.
///
/// If elevation fails, `mutation` is never called.
/// If `mutation` panics, the previous protection is restored before the panic resumes.
///
/// This does not serialize against other threads. Two overlapping calls running at the same time can
/// interleave both protections and written bytes, so callers installing patches must take turns
/// (see [`PermissionWrapper`](crate::patcher::mem::PermissionWrapper)).
///
/// # Safety
///
/// - `address` must point into the caller's own address space
/// - changing protection affects whole pages; nothing else may rely on those pages' protection for the duration of the call
/// - `mutation` must only write within memory it is entitled to modify
pub unsafe fn scoped_protect<F>(address: *const u8, size: usize, mutation: F) -> Result<(), ProtectError>
where
    F: FnOnce(),
{
    if size == 0 {
        return Err(ProtectError::EmptyRegion(address as usize));
    }

    let elevate_error = |source| ProtectError::Elevate {
        address: address as usize,
        size,
        source,
    };
    let token = ProtectionToken::capture(address, size).map_err(elevate_error)?;
    region::protect(address, size, Protection::READ_WRITE_EXECUTE).map_err(elevate_error)?;
    debug!("elevated {:#x} bytes at {:p} to rwx", size, address);

    let outcome = panic::catch_unwind(AssertUnwindSafe(mutation));

    let restored = token.restore().map_err(|source| ProtectError::Restore {
        address: address as usize,
        size,
        source,
    });
    if restored.is_ok() {
        debug!("restored protection of {:#x} bytes at {:p}", size, address);
    }

    if let Err(payload) = outcome {
        panic::resume_unwind(payload);
    }
    restored
}
