//! This module contains a byte patcher

use std::convert::Infallible;
use std::ptr;

use super::{PatchGuard, Patcher};

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails, and it never touches memory protections.
#[derive(Debug, Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;
    type Guard<'a> = BytePatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}
/// Guard for byte-patches
///
/// See [`BytePatcher`].
#[derive(Debug)]
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let mut original = vec![0; patch.len()];

        // Safety: caller must pass in a `location` pointer that is valid for the full length of the patch
        ptr::copy_nonoverlapping(location, original.as_mut_ptr(), patch.len());

        let guard = Self { original, location };

        // Safety: caller must ensure that `location` is writable
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());

        guard
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn original(&self) -> &[u8] {
        &self.original
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe {
            ptr::copy_nonoverlapping(self.original.as_ptr(), self.location, self.original.len());
        }
    }
}
