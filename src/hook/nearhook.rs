//! # Near Hook
//!
//! This hook type uses a near `call`/`jmp` with a 32-bit displacement to redirect execution

use log::info;

use crate::{
    code::InstructionBuffer,
    patcher::{PatchGuard, Patcher},
    process::{read_bytes, CurrentProcess},
};

use super::{Branch, Hook, HookError, HookGuard, HookOptions, PatchSite};

/// Single-byte `nop`
const NOP: u8 = 0x90;

/// Near branch hook
///
/// The destination has to be within ±2 GiB of the site. No trampoline is built, so whatever
/// instructions the branch overwrites are gone until the hook is removed.
#[derive(Debug)]
pub struct NearHook<P> {
    /// Underlying patcher to be used to hook
    patcher: P,
    /// Branch written at the site
    branch: Branch,
    /// Install options
    options: HookOptions,
}
impl<P: Patcher> NearHook<P> {
    /// Creates a new near hook with default options
    pub fn new(patcher: P, branch: Branch) -> Self {
        Self::with_options(patcher, branch, HookOptions::default())
    }

    /// Creates a new near hook
    pub fn with_options(patcher: P, branch: Branch, options: HookOptions) -> Self {
        Self {
            patcher,
            branch,
            options,
        }
    }

    /// The bytes that would be written at `site` to reach `destination`
    pub fn assemble(&self, site: PatchSite, destination: usize) -> Result<Vec<u8>, HookError<P::Error>> {
        if site.len < InstructionBuffer::LEN {
            return Err(HookError::SiteTooShort {
                address: site.address,
                len: site.len,
            });
        }

        let code = if self.options.strict_displacement {
            self.branch.try_encode(site.address, destination)?
        } else {
            self.branch.encode(site.address, destination)
        };

        let mut patch = code.to_vec();
        if self.options.pad_with_nops {
            patch.resize(site.len, NOP);
        }
        Ok(patch)
    }
}
unsafe impl<P: Patcher> Hook for NearHook<P> {
    type Error = HookError<P::Error>;
    type Guard<'a> = NearHookGuard<P::Guard<'a>>
    where
        Self: 'a;

    unsafe fn hook(
        &self,
        site: PatchSite,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error> {
        let destination = destination as usize;
        let patch = self.assemble(site, destination)?;

        let guard = self
            .patcher
            .patch(site.address as *mut u8, &patch)
            .map_err(HookError::Patch)?;

        if self.options.verify {
            let mut installed = vec![0; patch.len()];
            let transferred = read_bytes(&CurrentProcess, site.address, &mut installed);
            if installed != patch {
                // `guard` is dropped on the way out, which unpatches the site
                return Err(HookError::Verify {
                    address: site.address,
                    transferred,
                });
            }
        }

        info!(
            "hooked {:#x} with {} to {:#x}",
            site.address, self.branch, destination
        );
        Ok(NearHookGuard {
            guard: Some(guard),
            site,
            destination,
        })
    }
}

/// Guard for near hooks
pub struct NearHookGuard<G: PatchGuard> {
    /// Underlying patch guard that we're wrapping. `Option` so that [`NearHookGuard::keep`] can take it
    guard: Option<G>,
    /// Site that was hooked
    site: PatchSite,
    /// Where the site branches to
    destination: usize,
}
impl<G: PatchGuard> NearHookGuard<G> {
    /// Get the underlying patch guard in case info is needed
    pub fn patch(&self) -> Option<&G> {
        self.guard.as_ref()
    }

    /// The bytes the hook replaced
    pub fn original(&self) -> &[u8] {
        self.guard.as_ref().map(|g| g.original()).unwrap_or(&[])
    }

    /// Site that was hooked
    pub fn site(&self) -> PatchSite {
        self.site
    }

    /// Where the site branches to
    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Leaves the hook installed for good
    pub fn keep(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.keep();
        }
    }
}
unsafe impl<G: PatchGuard> HookGuard for NearHookGuard<G> {}

impl<G: PatchGuard> Drop for NearHookGuard<G> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.restore();
            info!("unhooked {:#x}", self.site.address);
        }
    }
}
