/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Locations describe where an instruction expects or produces a value.
//!
//! Before allocation a location slot holds a *policy* (one of the
//! unallocated variants below); after allocation every policy slot has been
//! overwritten with a concrete location. Slots live in an arena owned by
//! the flow graph and are addressed by [`SlotId`] so that several parties
//! (instruction summaries, parallel moves, use positions, hints) can write
//! through the same cell.

use crate::target::{cpu_reg_name, FrameLayout};
use std::fmt;

/// Index of a mutable location cell in the flow graph's slot arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

impl fmt::Debug for SlotId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "slot{}", self.0)
  }
}

/// Index of a constant in the flow graph's constant pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstId(pub u32);

impl fmt::Debug for ConstId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "c{}", self.0)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum RegisterKind {
  Cpu,
  Fpu,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum BaseReg {
  Fp,
  Sp,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
  Invalid,

  // Unallocated policies.
  Any,
  PrefersRegister,
  RequiresRegister,
  RequiresFpuRegister,
  RequiresStack,
  WritableRegister,
  SameAsFirstInput,
  SameAsFirstOrSecondInput,
  MayBeSameAsFirstInput,

  // Concrete locations.
  Constant { cid: ConstId, pair_index: u8 },
  Register(usize),
  FpuRegister(usize),
  StackSlot { index: i32, base: BaseReg },
  DoubleStackSlot { index: i32, base: BaseReg },
  QuadStackSlot { index: i32, base: BaseReg },

  /// Two halves of a pair-represented value; each half is its own slot.
  Pair(SlotId, SlotId),
}

impl Location {
  pub fn constant(cid: ConstId) -> Location {
    Location::Constant { cid, pair_index: 0 }
  }

  pub fn machine_register(kind: RegisterKind, reg: usize) -> Location {
    match kind {
      RegisterKind::Cpu => Location::Register(reg),
      RegisterKind::Fpu => Location::FpuRegister(reg),
    }
  }

  pub fn stack_slot(index: i32) -> Location {
    Location::StackSlot { index, base: BaseReg::Fp }
  }

  pub fn is_invalid(&self) -> bool {
    matches!(self, Location::Invalid)
  }

  pub fn is_unallocated(&self) -> bool {
    matches!(
      self,
      Location::Any
        | Location::PrefersRegister
        | Location::RequiresRegister
        | Location::RequiresFpuRegister
        | Location::RequiresStack
        | Location::WritableRegister
        | Location::SameAsFirstInput
        | Location::SameAsFirstOrSecondInput
        | Location::MayBeSameAsFirstInput
    )
  }

  /// An unallocated policy for which the allocator should try to find a
  /// register even when it is not strictly required.
  pub fn is_register_beneficial(&self) -> bool {
    self.is_unallocated()
      && !matches!(self, Location::Any | Location::RequiresStack)
  }

  pub fn is_machine_register(&self) -> bool {
    matches!(self, Location::Register(_) | Location::FpuRegister(_))
  }

  pub fn is_register(&self) -> bool {
    matches!(self, Location::Register(_))
  }

  pub fn is_fpu_register(&self) -> bool {
    matches!(self, Location::FpuRegister(_))
  }

  pub fn is_constant(&self) -> bool {
    matches!(self, Location::Constant { .. })
  }

  pub fn is_pair(&self) -> bool {
    matches!(self, Location::Pair(_, _))
  }

  pub fn register_code(&self) -> usize {
    match self {
      Location::Register(reg) | Location::FpuRegister(reg) => *reg,
      _ => unreachable!("{:?} is not a machine register", self),
    }
  }

  pub fn register_kind(&self) -> RegisterKind {
    match self {
      Location::Register(_) => RegisterKind::Cpu,
      Location::FpuRegister(_) => RegisterKind::Fpu,
      _ => unreachable!("{:?} is not a machine register", self),
    }
  }

  pub fn has_stack_index(&self) -> bool {
    matches!(
      self,
      Location::StackSlot { .. }
        | Location::DoubleStackSlot { .. }
        | Location::QuadStackSlot { .. }
    )
  }

  pub fn stack_index(&self) -> i32 {
    match self {
      Location::StackSlot { index, .. }
      | Location::DoubleStackSlot { index, .. }
      | Location::QuadStackSlot { index, .. } => *index,
      _ => unreachable!("{:?} has no stack index", self),
    }
  }

  pub fn base_reg(&self) -> BaseReg {
    match self {
      Location::StackSlot { base, .. }
      | Location::DoubleStackSlot { base, .. }
      | Location::QuadStackSlot { base, .. } => *base,
      _ => unreachable!("{:?} has no base register", self),
    }
  }

  /// Rebase an FP-relative parameter slot to be relative to the SP at
  /// function entry. Used when the frame is elided.
  pub fn to_entry_sp_relative(&self, layout: &FrameLayout) -> Location {
    debug_assert_eq!(self.base_reg(), BaseReg::Fp);
    let index = layout.entry_sp_slot_for_frame_slot(self.stack_index());
    match self {
      Location::StackSlot { .. } => {
        Location::StackSlot { index, base: BaseReg::Sp }
      }
      Location::DoubleStackSlot { .. } => {
        Location::DoubleStackSlot { index, base: BaseReg::Sp }
      }
      Location::QuadStackSlot { .. } => {
        Location::QuadStackSlot { index, base: BaseReg::Sp }
      }
      _ => unreachable!(),
    }
  }
}

impl fmt::Debug for Location {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Location::Invalid => write!(fmt, "invalid"),
      Location::Any => write!(fmt, "any"),
      Location::PrefersRegister => write!(fmt, "prefers-register"),
      Location::RequiresRegister => write!(fmt, "requires-register"),
      Location::RequiresFpuRegister => write!(fmt, "requires-fpu-register"),
      Location::RequiresStack => write!(fmt, "requires-stack"),
      Location::WritableRegister => write!(fmt, "writable-register"),
      Location::SameAsFirstInput => write!(fmt, "same-as-first-input"),
      Location::SameAsFirstOrSecondInput => {
        write!(fmt, "same-as-first-or-second-input")
      }
      Location::MayBeSameAsFirstInput => {
        write!(fmt, "may-be-same-as-first-input")
      }
      Location::Constant { cid, pair_index: 0 } => write!(fmt, "{:?}", cid),
      Location::Constant { cid, pair_index } => {
        write!(fmt, "{:?}#{}", cid, pair_index)
      }
      Location::Register(reg) => write!(fmt, "{}", cpu_reg_name(*reg)),
      Location::FpuRegister(reg) => write!(fmt, "f{}", reg),
      Location::StackSlot { index, base } => {
        write!(fmt, "S{:?}[{}]", base, index)
      }
      Location::DoubleStackSlot { index, base } => {
        write!(fmt, "DS{:?}[{}]", base, index)
      }
      Location::QuadStackSlot { index, base } => {
        write!(fmt, "QS{:?}[{}]", base, index)
      }
      Location::Pair(lo, hi) => write!(fmt, "pair({:?}, {:?})", lo, hi),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn policy_classification() {
    assert!(Location::Any.is_unallocated());
    assert!(!Location::Any.is_register_beneficial());
    assert!(!Location::RequiresStack.is_register_beneficial());
    assert!(Location::PrefersRegister.is_register_beneficial());
    assert!(Location::RequiresRegister.is_register_beneficial());
    assert!(!Location::Register(0).is_unallocated());
    assert!(Location::Register(0).is_machine_register());
  }

  #[test]
  fn entry_sp_rebase() {
    let layout = FrameLayout::default();
    let loc = Location::StackSlot { index: 3, base: BaseReg::Fp };
    let rebased = loc.to_entry_sp_relative(&layout);
    assert_eq!(rebased.base_reg(), BaseReg::Sp);
    assert_eq!(rebased.stack_index(), 1);
  }
}
