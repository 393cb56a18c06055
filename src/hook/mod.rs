//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another

use std::fmt;

use thiserror::Error;

use crate::code::{x86, EncodeError, InstructionBuffer};

pub mod nearhook;

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; it is up to the hook to document what makes a site and destination valid
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;
    /// Hook guard to allow functions to be automatcially unhooked when the guard goes out of scope
    type Guard<'a>: HookGuard + 'a
    where
        Self: 'a;

    /// Creates a hook which redirects `site` to `destination`.
    ///
    /// # Safety
    ///
    /// - `site` must be valid memory in this process for its full length, starting on an instruction boundary
    /// - nothing may be executing inside `site` while it is being patched
    /// - `destination` must be valid executable code
    unsafe fn hook(
        &self,
        site: PatchSite,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error>;
}

/// Guard for a currently active hook
///
/// # Safety
///
/// Must ensure that the guard fully unhooks whether dropped or unhooked via `unhook`
pub unsafe trait HookGuard: Sized {
    /// Manually unhooks the hook rather than letting the guard go out of scope
    fn unhook(self) {
        // most guards will implement all functionality in [`Drop::drop`]
    }
}

/// A location to patch: where it starts and how many bytes of it may be overwritten.
///
/// The bytes belong to the caller; the hook only reads and writes through the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchSite {
    /// First byte of the site
    pub address: usize,
    /// Number of bytes that may be overwritten
    pub len: usize,
}

impl PatchSite {
    /// A site of `len` bytes at `address`
    pub fn new(address: usize, len: usize) -> Self {
        Self { address, len }
    }

    /// A site exactly the size of a near branch
    pub fn branch(address: usize) -> Self {
        Self::new(address, InstructionBuffer::LEN)
    }

    /// A site at a pointer
    pub fn from_ptr<T>(ptr: *const T, len: usize) -> Self {
        Self::new(ptr as usize, len)
    }
}

/// Which near branch to write at a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    /// `call rel32`: the destination can return to the instruction after the site
    Call,
    /// `jmp rel32`: execution continues at the destination without a return address
    Jmp,
}

impl Branch {
    /// Encodes this branch, wrapping the displacement if `to` is out of range
    pub fn encode(self, from: usize, to: usize) -> InstructionBuffer {
        match self {
            Branch::Call => x86::make_near_call(from, to),
            Branch::Jmp => x86::make_near_jmp(from, to),
        }
    }

    /// Encodes this branch, failing if `to` is out of range
    pub fn try_encode(self, from: usize, to: usize) -> Result<InstructionBuffer, EncodeError> {
        match self {
            Branch::Call => x86::try_make_near_call(from, to),
            Branch::Jmp => x86::try_make_near_jmp(from, to),
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Call => f.write_str("call"),
            Branch::Jmp => f.write_str("jmp"),
        }
    }
}

/// Options for installing near hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOptions {
    /// Fill the rest of a site longer than the branch with `nop`s
    pub pad_with_nops: bool,
    /// Read the site back after patching and fail (unpatching it again) if it doesn't hold the expected bytes
    pub verify: bool,
    /// Refuse destinations out of `rel32` range instead of writing a wrapped displacement
    pub strict_displacement: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            pad_with_nops: true,
            verify: false,
            strict_displacement: false,
        }
    }
}

/// Errors while installing a hook
#[derive(Debug, Error)]
pub enum HookError<E> {
    /// The site can't hold the branch
    #[error("patch site at {address:#x} is {len} bytes, need at least {}", InstructionBuffer::LEN)]
    SiteTooShort {
        /// Site address
        address: usize,
        /// Site length
        len: usize,
    },
    /// The branch couldn't be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Error from the underlying patcher
    #[error("{0}")]
    Patch(E),
    /// The site didn't read back as what was written
    #[error("patch at {address:#x} did not verify ({transferred} bytes readable)")]
    Verify {
        /// Site address
        address: usize,
        /// How many bytes of the site could be read back
        transferred: usize,
    },
}
