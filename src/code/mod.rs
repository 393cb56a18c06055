//! # Code
//!
//! Machine code generated for patch sites

use std::fmt;
use std::ops::Deref;

use thiserror::Error;

pub mod x86;

/// Errors while generating code
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The destination is too far from the patch site for a 32-bit relative displacement
    #[error("displacement from {from:#x} to {to:#x} does not fit in 32 bits")]
    DisplacementOverflow {
        /// Address the instruction will be written to
        from: usize,
        /// Address the instruction should branch to
        to: usize,
    },
}

/// A ready-to-write relative branch instruction: one opcode byte followed by a little-endian `rel32`.
///
/// This is kept apart from ordinary byte slices so it's clear the bytes are meant to be executed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionBuffer([u8; InstructionBuffer::LEN]);

impl InstructionBuffer {
    /// Size of a near branch with a 32-bit displacement
    pub const LEN: usize = 5;

    /// Builds an instruction from its opcode and displacement
    pub(crate) fn new(opcode: u8, displacement: i32) -> Self {
        let mut bytes = [opcode, 0, 0, 0, 0];
        bytes[1..].copy_from_slice(&displacement.to_le_bytes());
        Self(bytes)
    }

    /// The opcode byte
    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    /// The signed displacement, relative to the end of the instruction
    pub fn displacement(&self) -> i32 {
        i32::from_le_bytes([self.0[1], self.0[2], self.0[3], self.0[4]])
    }

    /// Where this instruction branches to when written at `from`
    pub fn destination(&self, from: usize) -> usize {
        from.wrapping_add(Self::LEN)
            .wrapping_add(self.displacement() as isize as usize)
    }

    /// The encoded bytes
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        self.0
    }
}

impl Deref for InstructionBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for InstructionBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for InstructionBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstructionBuffer({:02x?})", self.0)
    }
}
