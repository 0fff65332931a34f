/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Parallel moves and the resolver that serializes them.
//!
//! A parallel move is a set of `(dst <- src)` transfers that conceptually
//! execute simultaneously. The resolver orders them so no move clobbers the
//! source of a later one and breaks cycles through a scratch register of
//! the appropriate register class.

use crate::ir::FlowGraph;
use crate::location::{Location, RegisterKind, SlotId};
use crate::target::{FPU_TMP, TMP_REG};
use log::trace;
use std::fmt;

/// One transfer of a parallel move. Source and destination are slots so
/// the allocator can fill them in after the move was created.
#[derive(Clone, Copy)]
pub struct MoveOperands {
  pub dst: SlotId,
  pub src: SlotId,
}

/// Handle to one just-added transfer.
#[derive(Clone, Copy)]
pub struct MoveRef {
  pub dst: SlotId,
  pub src: SlotId,
}

pub struct ParallelMove {
  pub moves: Vec<MoveOperands>,
  /// Serialized form, produced by [`ParallelMove::schedule`].
  pub scheduled: Vec<SerializedMove>,
}

impl ParallelMove {
  pub fn new() -> Self {
    Self { moves: Vec::new(), scheduled: Vec::new() }
  }
}

impl Default for ParallelMove {
  fn default() -> Self {
    Self::new()
  }
}

impl FlowGraph {
  /// Append a `(dst <- src)` transfer to the given parallel move,
  /// allocating fresh slots for both ends.
  pub fn add_move(
    &mut self,
    pmove: crate::ir::MoveId,
    to: Location,
    from: Location,
  ) -> MoveRef {
    let dst = self.new_slot(to);
    let src = self.new_slot(from);
    self.pmove_mut(pmove).moves.push(MoveOperands { dst, src });
    MoveRef { dst, src }
  }
}

/// A primitive move in the serialized schedule.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SerializedMove {
  pub dst: Location,
  pub src: Location,
}

impl fmt::Debug for SerializedMove {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?} <- {:?}", self.dst, self.src)
  }
}

struct MoveOp {
  dst: Location,
  src: Location,
  kind: RegisterKind,
  cycle_begin: Option<usize>,
  cycle_end: Option<usize>,
}

impl fmt::Debug for MoveOp {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?} <- {:?}", self.dst, self.src)?;
    if let Some(begin) = self.cycle_begin {
      write!(fmt, ", starts cycle #{}", begin)?;
    }
    if let Some(end) = self.cycle_end {
      write!(fmt, ", ends cycle #{}", end)?;
    }
    Ok(())
  }
}

fn move_kind(dst: &Location, src: &Location) -> RegisterKind {
  let fpu = |loc: &Location| {
    matches!(
      loc,
      Location::FpuRegister(_)
        | Location::DoubleStackSlot { .. }
        | Location::QuadStackSlot { .. }
    )
  };
  if fpu(dst) || fpu(src) {
    RegisterKind::Fpu
  } else {
    RegisterKind::Cpu
  }
}

fn scratch_for(kind: RegisterKind) -> Location {
  match kind {
    RegisterKind::Cpu => Location::Register(TMP_REG),
    RegisterKind::Fpu => Location::FpuRegister(FPU_TMP),
  }
}

fn find_blocking_move(
  pending: &[MoveOp],
  last: &MoveOp,
) -> Option<usize> {
  pending.iter().position(|other| other.src == last.dst)
}

fn find_cycled_move<'a>(
  stack: &'a mut [MoveOp],
  from: &mut usize,
  blocking: &Location,
) -> Option<&'a mut MoveOp> {
  for i in *from..stack.len() {
    *from += 1;
    if stack[i].src == *blocking {
      return Some(&mut stack[i]);
    }
  }
  None
}

/// Order the pending moves so that no move overwrites the source of a move
/// that has not executed yet. Moves participating in a cycle are marked
/// with matching cycle begin/end tags.
fn schedule_moves(mut pending: Vec<MoveOp>) -> Vec<MoveOp> {
  let mut ordered = Vec::with_capacity(pending.len());
  let mut cur_cycles = 0;

  while let Some(pm) = pending.pop() {
    debug_assert!(pm.src != pm.dst, "redundant moves were filtered");
    let mut stack = vec![pm];

    while !stack.is_empty() {
      let blocking_idx = find_blocking_move(&pending, stack.last().unwrap());

      if let Some(blocking_idx) = blocking_idx {
        let blocking_dst = pending[blocking_idx].dst;
        trace!("move blocked by {:?}", pending[blocking_idx]);

        let mut stack_cur = 0;
        let has_cycle = {
          let mut found = false;
          while let Some(cycled) =
            find_cycled_move(&mut stack, &mut stack_cur, &blocking_dst)
          {
            trace!("cycle closes at {:?}", cycled);
            debug_assert!(cycled.cycle_end.is_none());
            cycled.cycle_end = Some(cur_cycles);
            found = true;
          }
          found
        };
        if has_cycle {
          let blocking = &mut pending[blocking_idx];
          debug_assert!(blocking.cycle_begin.is_none());
          blocking.cycle_begin = Some(cur_cycles);
          cur_cycles += 1;
        }

        let blocking = pending.remove(blocking_idx);
        stack.push(blocking);
      } else {
        // Nothing blocks the top of the stack; it can execute.
        ordered.push(stack.pop().unwrap());
      }
    }
  }

  ordered
}

fn emit_moves(ordered: Vec<MoveOp>) -> Vec<SerializedMove> {
  let mut out = Vec::with_capacity(ordered.len());
  // At most one cycle is open at any point in the schedule.
  let mut saved: Option<Location> = None;

  for mov in ordered {
    let scratch = scratch_for(mov.kind);

    if mov.cycle_end.is_some() {
      // The closing move of a cycle reads the value saved when the cycle
      // was opened.
      let saved_in = saved.take().expect("cycle end without begin");
      emit_one(&mut out, mov.dst, saved_in, scratch);
      continue;
    }

    if mov.cycle_begin.is_some() {
      debug_assert!(saved.is_none());
      // Save the destination before it is overwritten; the cycle's last
      // move restores it.
      out.push(SerializedMove { dst: scratch, src: mov.dst });
      saved = Some(scratch);
    }

    emit_one(&mut out, mov.dst, mov.src, scratch);
  }

  debug_assert!(saved.is_none());
  out
}

fn emit_one(
  out: &mut Vec<SerializedMove>,
  dst: Location,
  src: Location,
  scratch: Location,
) {
  let mem = |loc: &Location| loc.has_stack_index();
  if mem(&dst) && mem(&src) && src != scratch {
    // Memory to memory transfers go through the scratch register.
    out.push(SerializedMove { dst: scratch, src });
    out.push(SerializedMove { dst, src: scratch });
  } else {
    out.push(SerializedMove { dst, src });
  }
}

impl ParallelMove {
  /// Serialize this parallel move given the current slot values. Transfers
  /// that are still unpopulated or already satisfied are dropped.
  pub fn schedule(&mut self, loc_slots: &[Location]) {
    let mut pending: Vec<MoveOp> = Vec::new();
    for mov in &self.moves {
      let dst = loc_slots[mov.dst.0 as usize];
      let src = loc_slots[mov.src.0 as usize];
      if dst.is_invalid() || src.is_invalid() || dst == src {
        continue;
      }
      debug_assert!(!dst.is_unallocated() && !src.is_unallocated());
      pending.push(MoveOp {
        dst,
        src,
        kind: move_kind(&dst, &src),
        cycle_begin: None,
        cycle_end: None,
      });
    }

    if pending.is_empty() {
      self.scheduled = Vec::new();
      return;
    }
    trace!("scheduling {} parallel moves", pending.len());
    self.scheduled = emit_moves(schedule_moves(pending));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn run(moves: &[(Location, Location)]) -> Vec<SerializedMove> {
    let mut slots = Vec::new();
    let mut pm = ParallelMove::new();
    for &(dst, src) in moves {
      let d = SlotId(slots.len() as u32);
      slots.push(dst);
      let s = SlotId(slots.len() as u32);
      slots.push(src);
      pm.moves.push(MoveOperands { dst: d, src: s });
    }
    pm.schedule(&slots);
    pm.scheduled
  }

  fn reg(r: usize) -> Location {
    Location::Register(r)
  }

  fn slot(i: i32) -> Location {
    Location::stack_slot(i)
  }

  #[test]
  fn independent_moves_pass_through() {
    let out = run(&[(reg(0), reg(1)), (reg(2), reg(3))]);
    assert_eq!(out.len(), 2);
  }

  #[test]
  fn redundant_moves_are_dropped() {
    let out = run(&[(reg(0), reg(0)), (reg(1), reg(2))]);
    assert_eq!(out, vec![SerializedMove { dst: reg(1), src: reg(2) }]);
  }

  #[test]
  fn chain_is_ordered() {
    // r1 <- r0 and r2 <- r1 must execute r2 <- r1 first.
    let out = run(&[(reg(1), reg(0)), (reg(2), reg(1))]);
    assert_eq!(
      out,
      vec![
        SerializedMove { dst: reg(2), src: reg(1) },
        SerializedMove { dst: reg(1), src: reg(0) },
      ]
    );
  }

  #[test]
  fn swap_uses_scratch() {
    let out = run(&[(reg(0), reg(1)), (reg(1), reg(0))]);
    let scratch = Location::Register(TMP_REG);
    assert_eq!(out.len(), 3);
    // First move of the cycle saves one end into the scratch, the last
    // restores it.
    assert_eq!(out[0].dst, scratch);
    assert_eq!(out[2].src, scratch);
    assert!(out.iter().all(|m| m.dst != m.src));
  }

  #[test]
  fn memory_to_memory_goes_through_scratch() {
    let out = run(&[(slot(1), slot(2))]);
    assert_eq!(
      out,
      vec![
        SerializedMove { dst: Location::Register(TMP_REG), src: slot(2) },
        SerializedMove { dst: slot(1), src: Location::Register(TMP_REG) },
      ]
    );
  }

  #[test]
  fn fpu_cycle_uses_fpu_scratch() {
    let f = Location::FpuRegister;
    let out = run(&[(f(0), f(1)), (f(1), f(0))]);
    assert_eq!(out[0].dst, Location::FpuRegister(FPU_TMP));
  }
}
