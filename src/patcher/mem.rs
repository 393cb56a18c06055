//! This module contains a patcher which adjusts memory permissions to patch read-only code

use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::error;
use thiserror::Error;

use super::{PatchGuard, Patcher};
use crate::protect::{scoped_protect, ProtectError};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("error setting memory protections")]
    ProtectionError(#[from] ProtectError),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by elevating the target to read+write+execute with [`scoped_protect`], triggering the patch, and then reverting the permissions.
///
/// Installs and restores going through the same wrapper are serialized, so one wrapper can be shared as the single installer for a process.
/// Patching the same memory through separate wrappers (or directly) at the same time is not coordinated.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
#[derive(Debug, Default)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
    /// Held for the duration of every protection change made through this wrapper
    lock: Mutex<()>,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self {
            patcher,
            lock: Mutex::new(()),
        }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// It is **NOT** safe to treat the returned value as mutable, as this function does not change memory permissions.
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

/// Takes the installer lock. A panic elsewhere doesn't leave anything half-done behind the lock, so poisoning is ignored.
fn install_lock(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops `guard` (which writes the original bytes back) with the location made writable.
///
/// If the location can't be made writable the guard is leaked, since dropping it would write to protected memory.
unsafe fn release<G: PatchGuard>(location: *const u8, len: usize, guard: G) -> Result<(), ProtectError> {
    let mut guard = Some(guard);
    let result = scoped_protect(location, len, || drop(guard.take()));
    if let Some(guard) = guard {
        mem::forget(guard);
    }
    result
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<'a, P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        let _lock = install_lock(&self.lock);

        let mut patched = None;
        let protected = scoped_protect(location, patch.len(), || {
            patched = Some(self.patcher.patch(location, patch));
        });

        match (protected, patched) {
            (Ok(()), Some(Ok(guard))) => Ok(PermissionWrapperGuard {
                guard: Some(guard),
                location,
                len: patch.len(),
                lock: &self.lock,
            }),
            (Err(protect_error), Some(Ok(guard))) => {
                // the bytes went in but the protection didn't come back, so undo the write
                if let Err(error) = release(location, patch.len(), guard) {
                    error!("failed to roll back patch at {:p}: {}", location, error);
                }
                Err(protect_error.into())
            }
            (_, Some(Err(error))) => Err(PermissionError::CustomError(error)),
            (Err(protect_error), None) => Err(protect_error.into()),
            (Ok(()), None) => unreachable!("scoped_protect succeeded without running the patch"),
        }
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<'a, G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
    /// Installer lock of the wrapper that created this guard
    lock: &'a Mutex<()>,
}
impl<G: PatchGuard> PermissionWrapperGuard<'_, G> {
    /// Restores the original bytes, reporting a protection failure instead of logging it
    pub fn try_restore(mut self) -> Result<(), ProtectError> {
        match self.guard.take() {
            Some(guard) => {
                let _lock = install_lock(self.lock);
                // SAFETY: the location was valid and writable through `scoped_protect` when the guard was created
                unsafe { release(self.location, self.len, guard) }
            }
            None => Ok(()),
        }
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<'_, G> {
    fn original(&self) -> &[u8] {
        self.guard.as_ref().map(|g| g.original()).unwrap_or(&[])
    }

    fn keep(mut self) {
        // the inner guard is forgotten too, so nothing gets written back
        if let Some(guard) = self.guard.take() {
            guard.keep();
        }
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<'_, G> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let _lock = install_lock(self.lock);
            // SAFETY: the location was valid and writable through `scoped_protect` when the guard was created
            if let Err(error) = unsafe { release(self.location, self.len, guard) } {
                error!("failed to restore patch at {:p}: {}", self.location, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::convert::Infallible;
    use std::ptr;
    use std::slice;
    use std::thread;

    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::{to_mut, PermissionError, PermissionWrapper};
    use crate::patcher::PatchGuard;
    use crate::patcher::Patcher;
    use crate::protect::ProtectError;

    /// Allocates a read+execute page starting with `data`
    fn code_page(data: &[u8]) -> region::Allocation {
        let mut page = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), page.as_mut_ptr::<u8>(), data.len());
            region::protect(page.as_ptr::<u8>(), page.len(), Protection::READ_EXECUTE).unwrap();
        }
        page
    }

    fn protection(ptr: *const u8) -> Protection {
        region::query(ptr).unwrap().protection()
    }

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let page = code_page(&[1, 2, 3, 4]);
        let ptr = page.as_ptr::<u8>();

        // create the patcher and wrapper
        let patcher = BytePatcher::new();
        let wrapper = PermissionWrapper::new(patcher);

        // patch the page
        let patch = unsafe { wrapper.patch(to_mut(ptr), &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);
        assert_eq!(patch.original(), [1, 2, 3, 4]);

        // restore the patch
        patch.restore();

        // make sure the patch was restored
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests to ensure permissions are actually set and reverted
    fn test_perms() {
        let page = code_page(b"1234");
        let ptr = page.as_ptr::<u8>();

        // sanity check
        // writing here directly would fault
        assert_eq!(protection(ptr), Protection::READ_EXECUTE);

        let wrapper = PermissionWrapper::new(BytePatcher::new());
        let patch = unsafe { wrapper.patch(to_mut(ptr), &[4, 3, 2, 1]).unwrap() };

        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the patch
        assert_eq!(protection(ptr), Protection::READ_EXECUTE);

        // restore through the fallible path
        patch.try_restore().unwrap();

        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, *b"1234");
        assert_eq!(protection(ptr), Protection::READ_EXECUTE);
    }

    #[test]
    /// Dropping the guard unpatches
    fn test_drop_restores() {
        let page = code_page(&[0xc3; 4]);
        let ptr = page.as_ptr::<u8>();
        let wrapper = PermissionWrapper::new(BytePatcher::new());

        {
            let _patch = unsafe { wrapper.patch(to_mut(ptr), &[0x90, 0x90]).unwrap() };
            assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [0x90, 0x90, 0xc3, 0xc3]);
        }

        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [0xc3; 4]);
        assert_eq!(protection(ptr), Protection::READ_EXECUTE);
    }

    #[test]
    fn test_keep() {
        let page = code_page(&[0xc3; 4]);
        let ptr = page.as_ptr::<u8>();
        let wrapper = PermissionWrapper::new(BytePatcher::new());

        let patch = unsafe { wrapper.patch(to_mut(ptr), &[0xcc]).unwrap() };
        patch.keep();

        assert_eq!(unsafe { slice::from_raw_parts(ptr, 2) }, [0xcc, 0xc3]);
        assert_eq!(protection(ptr), Protection::READ_EXECUTE);
    }

    #[test]
    /// Unmapped targets fail without writing anything
    fn test_unmapped() {
        let wrapper = PermissionWrapper::new(BytePatcher::new());

        let result = unsafe { wrapper.patch(ptr::null_mut(), &[0x90]) };

        assert!(matches!(
            result,
            Err(PermissionError::ProtectionError(ProtectError::Elevate { .. }))
        ));
    }

    #[test]
    /// Threads sharing one wrapper take turns, so the page always ends up read+execute with its bytes back
    fn test_shared_installer() {
        const THREADS: usize = 8;
        let page = code_page(&[0xc3; THREADS * 4]);
        let base = page.as_ptr::<u8>() as usize;
        let wrapper = PermissionWrapper::new(BytePatcher::new());

        thread::scope(|scope| {
            for i in 0..THREADS {
                let wrapper = &wrapper;
                scope.spawn(move || {
                    let location = (base + i * 4) as *mut u8;
                    for _ in 0..200 {
                        let patch = unsafe { wrapper.patch(location, &[i as u8; 4]).unwrap() };
                        assert_eq!(unsafe { slice::from_raw_parts(location, 4) }, [i as u8; 4]);
                        patch.restore();
                    }
                });
            }
        });

        let ptr = base as *const u8;
        assert_eq!(unsafe { slice::from_raw_parts(ptr, THREADS * 4) }, [0xc3; THREADS * 4]);
        assert_eq!(protection(ptr), Protection::READ_EXECUTE);
    }

    /// Patcher that unmaps the page it's given, so the protection can't be put back
    struct UnmappingPatcher(RefCell<Option<region::Allocation>>);
    /// Guard for [`UnmappingPatcher`]; there is nothing left to restore
    struct UnmappedGuard;
    unsafe impl PatchGuard for UnmappedGuard {
        fn original(&self) -> &[u8] {
            &[]
        }
    }
    unsafe impl Patcher for UnmappingPatcher {
        type Error = Infallible;
        type Guard<'a> = UnmappedGuard;

        unsafe fn patch<'a>(&'a self, _: *mut u8, _: &[u8]) -> Result<UnmappedGuard, Infallible> {
            drop(self.0.borrow_mut().take());
            Ok(UnmappedGuard)
        }
    }

    #[test]
    /// A write whose protection can't be restored is reported as a failed install
    fn test_restore_failure() {
        let page = code_page(&[0xc3]);
        let ptr = page.as_ptr::<u8>();
        let wrapper = PermissionWrapper::new(UnmappingPatcher(RefCell::new(Some(page))));

        let result = unsafe { wrapper.patch(to_mut(ptr), &[0x90]) };

        assert!(matches!(
            result,
            Err(PermissionError::ProtectionError(ProtectError::Restore { .. }))
        ));
    }
}
