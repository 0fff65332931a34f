/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Linear scan register allocation for SSA-form flow graphs.
//!
//! The allocator consumes a [`FlowGraph`] in strict SSA form together with
//! per-instruction location summaries and produces a concrete machine
//! location for every use of every virtual register: a CPU register, an FPU
//! register, a constant pool reference or a numbered spill slot. Data flow
//! between split live ranges and across block boundaries is realized with
//! parallel move instructions which are serialized at the very end.

mod alloc;
mod bitset;
mod checker;
mod ir;
mod liveness;
mod liverange;
mod location;
mod parallel_move;
mod target;

#[cfg(test)]
mod tests;

pub use crate::alloc::{allocate_registers, Allocator, AllocatorOptions};
pub use crate::bitset::BitSet;
pub use crate::ir::*;
pub use crate::location::{BaseReg, ConstId, Location, RegisterKind, SlotId};
pub use crate::parallel_move::{MoveOperands, ParallelMove, SerializedMove};
pub use crate::target::FrameLayout;

use std::fmt;

/// Failures visible to the caller. Everything else is a compiler bug and
/// fires an assertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAllocError {
  /// Allocation ran out of registers while compiling an intrinsic, where
  /// spilling is not permitted. The intrinsic IR must be rewritten to use
  /// fewer simultaneously live values.
  OutOfRegisters(RegisterKind),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::OutOfRegisters(kind) => {
        write!(fmt, "out of {:?} registers in intrinsic mode", kind)
      }
    }
  }
}
