//! Near relative branches (`E8 rel32` / `E9 rel32`)
//!
//! The displacement is relative to the address right after the 5-byte instruction.
//! Only 32-bit displacements are generated, so the destination must be within ±2 GiB of the patch site.

use super::{EncodeError, InstructionBuffer};

/// `call rel32`
pub const CALL_REL32: u8 = 0xe8;
/// `jmp rel32`
pub const JMP_REL32: u8 = 0xe9;

/// Truncated displacement from `from` to `to`. Wraps instead of failing.
fn displacement(from: usize, to: usize) -> i32 {
    to.wrapping_sub(from).wrapping_sub(InstructionBuffer::LEN) as u32 as i32
}

/// Exact displacement from `from` to `to`, if it fits in 32 bits
fn checked_displacement(from: usize, to: usize) -> Result<i32, EncodeError> {
    let delta = (to as i128) - (from as i128) - InstructionBuffer::LEN as i128;
    i32::try_from(delta).map_err(|_| EncodeError::DisplacementOverflow { from, to })
}

/// Generates a near call at `from` that calls `to`.
///
/// Out-of-range displacements silently wrap; use [`try_make_near_call`] to reject them.
pub fn make_near_call(from: usize, to: usize) -> InstructionBuffer {
    InstructionBuffer::new(CALL_REL32, displacement(from, to))
}

/// Generates a near jmp at `from` that jumps to `to`.
///
/// Out-of-range displacements silently wrap; use [`try_make_near_jmp`] to reject them.
pub fn make_near_jmp(from: usize, to: usize) -> InstructionBuffer {
    InstructionBuffer::new(JMP_REL32, displacement(from, to))
}

/// Same as [`make_near_call`], but fails if `to` is out of range of `from`
pub fn try_make_near_call(from: usize, to: usize) -> Result<InstructionBuffer, EncodeError> {
    checked_displacement(from, to).map(|d| InstructionBuffer::new(CALL_REL32, d))
}

/// Same as [`make_near_jmp`], but fails if `to` is out of range of `from`
pub fn try_make_near_jmp(from: usize, to: usize) -> Result<InstructionBuffer, EncodeError> {
    checked_displacement(from, to).map(|d| InstructionBuffer::new(JMP_REL32, d))
}
