/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Control flow resolution.
//!
//! After allocation, split siblings of one virtual register may live in
//! different locations. Touching siblings inside a block are connected
//! with a move at the split position; values crossing block edges are
//! reconciled through the edge parallel moves, sinking identical incoming
//! moves into the successor when no predecessor clobbers their source.
//! Finally every parallel move is serialized.

use crate::ir::{BlockId, DefKind, InstrKind, Pos, Representation, Vreg};
use crate::liverange::RangeId;
use crate::location::{BaseReg, Location};
use crate::target::RETURN_ADDRESS_ON_STACK;
use log::trace;

use super::{exception_location, stacktrace_location, Allocator};

impl<'a> Allocator<'a> {
  pub(crate) fn parent_range(&self, vreg: Vreg) -> RangeId {
    self.live_ranges[vreg as usize].expect("no live range for vreg")
  }

  /// The sibling of `parent`'s chain covering `pos`.
  pub(crate) fn find_cover(&self, parent: RangeId, pos: Pos) -> RangeId {
    let mut current = Some(parent);
    while let Some(range) = current {
      if self.arena.can_cover(range, pos) {
        return range;
      }
      current = self.arena.range(range).next_sibling;
    }
    unreachable!(
      "range v{} is not covered at {}",
      self.arena.range(parent).vreg,
      pos
    );
  }

  /// True if the target location is the spill slot of the range's vreg.
  pub(crate) fn target_location_is_spill_slot(
    &self,
    range: RangeId,
    target: Location,
  ) -> bool {
    let parent = self.parent_range(self.arena.range(range).vreg);
    self.arena.range(parent).spill_slot == target
  }

  fn emit_move_on_edge(
    &mut self,
    succ: BlockId,
    pred: BlockId,
    dst: Location,
    src: Location,
  ) {
    let last = self.fg.last_instruction(pred);
    let use_pred = match last {
      Some(last) => {
        matches!(self.fg.instr(last).kind, InstrKind::Goto { .. })
          && !self.fg.block(pred).is_graph_entry()
      }
      None => false,
    };
    if use_pred {
      let last = last.unwrap();
      debug_assert_eq!(self.fg.instr(last).successors().len(), 1);
      let pmove = self.goto_parallel_move(last);
      self.fg.add_move(pmove, dst, src);
    } else {
      let pmove = self.block_parallel_move(succ);
      self.fg.add_move(pmove, dst, src);
    }
  }

  fn goto_parallel_move(&mut self, instr: crate::ir::InstrId)
    -> crate::ir::MoveId
  {
    let existing = match &self.fg.instr(instr).kind {
      InstrKind::Goto { parallel_move, .. }
      | InstrKind::TryEntry { parallel_move, .. } => *parallel_move,
      _ => unreachable!(),
    };
    match existing {
      Some(pmove) => pmove,
      None => {
        let pmove = self.fg.new_pmove();
        match &mut self.fg.instr_mut(instr).kind {
          InstrKind::Goto { parallel_move, .. }
          | InstrKind::TryEntry { parallel_move, .. } => {
            *parallel_move = Some(pmove)
          }
          _ => unreachable!(),
        }
        pmove
      }
    }
  }

  pub(crate) fn resolve_control_flow(&mut self) {
    // Resolve linear control flow between touching split siblings inside
    // basic blocks.
    for vreg in 0..self.vreg_count {
      let mut range = match self.live_ranges[vreg] {
        Some(range) => range,
        None => continue,
      };

      while let Some(sibling) = self.arena.range(range).next_sibling {
        let range_end = self.arena.end(range);
        let sibling_start = self.arena.start(sibling);
        let range_loc = self.assigned_loc(range);
        let sibling_loc = self.assigned_loc(sibling);
        trace!(
          "connecting [{}, {}) [{:?}] to [{}, {}) [{:?}]",
          self.arena.start(range),
          range_end,
          range_loc,
          sibling_start,
          self.arena.end(sibling),
          sibling_loc
        );

        // A constant flowing into a catch entry has no position where the
        // linear connection could happen before the entry; it is emitted
        // right after the entry instead.
        let constant_to_catch_block = self
          .is_catch_block_entry(sibling_start)
          && range_loc.is_constant();
        if (range_end == sibling_start || constant_to_catch_block)
          && !self.target_location_is_spill_slot(range, sibling_loc)
          && range_loc != sibling_loc
          && (!self.is_block_entry(range_end) || constant_to_catch_block)
        {
          if self.is_catch_block_entry(sibling_start) {
            debug_assert!(!range_loc.is_register());
          }
          let at = sibling_start
            + if self.is_catch_block_entry(sibling_start) { 1 } else { 0 };
          self.add_move_at(at, sibling_loc, range_loc);
        }
        range = sibling;
      }
    }

    // Resolve non-linear control flow across branches. At joins, moves
    // identical on every incoming edge are sunk into the join itself as
    // long as no predecessor's own moves destroy their source.
    let mut pending: Vec<(Location, Location)> = Vec::new();
    for i in 1..self.fg.block_order.len() {
      let block_id = self.fg.block_order[i];
      let is_catch_entry = self.fg.block(block_id).is_catch_block_entry();
      let block_start = self.fg.block(block_id).start_pos;
      let live: Vec<usize> =
        self.liveness.live_in(self.fg, block_id).iter().collect();

      for vreg in live {
        let range = self.parent_range(vreg as Vreg);
        if self.arena.range(range).next_sibling.is_none() && !is_catch_entry {
          // Nothing to connect; the whole range has one location.
          continue;
        }

        let dst_cover = self.find_cover(range, block_start);
        let dst = self.assigned_loc(dst_cover);
        trace!(
          "v{} is in {:?} on entry to {:?} covered by [{}, {})",
          vreg,
          dst,
          block_id,
          self.arena.start(dst_cover),
          self.arena.end(dst_cover)
        );

        if self.target_location_is_spill_slot(range, dst) {
          // Eagerly spilled: the slot already holds the value.
          trace!("  no resolution necessary, range is spilled");
          continue;
        }

        if is_catch_entry {
          // Values arrive in the catch through spill slots; registers are
          // refilled right after the entry.
          if dst != exception_location() && dst != stacktrace_location() {
            if dst.is_register() || dst.is_fpu_register() {
              let spill_slot = self.arena.range(range).spill_slot;
              debug_assert!(!spill_slot.is_invalid());
              if dst != spill_slot {
                let pmove = self.block_parallel_move(block_id);
                self.fg.add_move(pmove, dst, spill_slot);
              }
            }
          }
          continue;
        }

        let preds = self.fg.block(block_id).preds.clone();
        let mut src_locs = Vec::with_capacity(preds.len());
        for &pred in &preds {
          let pred_exit = self.fg.block(pred).end_pos - 1;
          let src_cover = self.find_cover(range, pred_exit);
          let src = self.assigned_loc(src_cover);
          trace!(
            "| incoming value in {:?} on exit from {:?} covered by [{}, {})",
            src,
            pred,
            self.arena.start(src_cover),
            self.arena.end(src_cover)
          );
          src_locs.push(src);
        }

        // If the source location is the same on every incoming edge, a
        // single move at the join start might do, provided no incoming
        // edge destroys it; that is only known once all live-in values of
        // this block have been processed.
        if src_locs.len() > 1 && src_locs.iter().all(|&s| s == src_locs[0]) {
          if dst != src_locs[0] {
            pending.push((dst, src_locs[0]));
          }
          continue;
        }

        for (j, &pred) in preds.iter().enumerate() {
          if dst == src_locs[j] {
            continue; // Redundant move.
          }
          self.emit_move_on_edge(block_id, pred, dst, src_locs[j]);
        }
      }

      if !pending.is_empty() {
        let mut can_emit = vec![true; pending.len()];

        // A pending move is blocked when some predecessor's edge moves
        // overwrite its source.
        let mut changed = false;
        let preds = self.fg.block(block_id).preds.clone();
        for (j, &(_, src)) in pending.iter().enumerate() {
          'preds: for &pred in &preds {
            let last = self.fg.last_instruction(pred).unwrap();
            let pmove = match &self.fg.instr(last).kind {
              InstrKind::Goto { parallel_move, .. }
              | InstrKind::TryEntry { parallel_move, .. } => {
                match parallel_move {
                  Some(pmove) => *pmove,
                  None => continue,
                }
              }
              _ => unreachable!(),
            };
            for mv in self.fg.pmove(pmove).moves.clone() {
              let mv_dst = self.fg.loc(mv.dst);
              let mv_src = self.fg.loc(mv.src);
              let redundant = mv_dst.is_invalid()
                || mv_src.is_invalid()
                || mv_dst == mv_src;
              if !redundant && mv_dst == src {
                can_emit[j] = false;
                changed = true;
                break 'preds;
              }
            }
          }
        }

        // Blocked moves block the moves whose source they overwrite;
        // propagate transitively.
        while changed {
          changed = false;
          for j in 0..pending.len() {
            if !can_emit[j] {
              continue;
            }
            for k in 0..pending.len() {
              if !can_emit[k] && pending[k].0 == pending[j].1 {
                can_emit[j] = false;
                changed = true;
                break;
              }
            }
          }
        }

        // Unblocked moves sink into the join; blocked ones are duplicated
        // onto every incoming edge.
        for (j, &(dst, src)) in pending.clone().iter().enumerate() {
          if can_emit[j] {
            let pmove = self.block_parallel_move(block_id);
            self.fg.add_move(pmove, dst, src);
          } else {
            for &pred in &preds {
              self.emit_move_on_edge(block_id, pred, dst, src);
            }
          }
        }
        pending.clear();
      }
    }

    // Eagerly spill values so that their spill slot holds the value for
    // the whole lifetime of the vreg.
    for i in 0..self.spilled.len() {
      let range = self.spilled[i];
      let assigned = self.assigned_loc(range);
      let spill_slot = self.arena.range(range).spill_slot;
      if assigned == spill_slot {
        continue;
      }
      if self.arena.start(range) == 0 {
        // Constants are spilled by placing the move into every function
        // entry succeeding the graph entry.
        assert!(assigned.is_constant());
        let succs = self.fg.block(self.fg.graph_entry()).succs.clone();
        for block in succs {
          if self.fg.block(block).is_function_entry() {
            let at = self.fg.block(block).start_pos + 1;
            self.add_move_at(at, spill_slot, assigned);
          }
        }
      } else {
        trace!(
          "inserting eager spill to {:?} at {} for v{} allocated to {:?}",
          spill_slot,
          self.arena.start(range) + 1,
          self.arena.range(range).vreg,
          assigned
        );
        let at = self.arena.start(range) + 1;
        self.add_move_at(at, spill_slot, assigned);
      }
    }
  }

  // ---------------------------------------------------------------------
  // Frame elision.

  /// Mark the function frameless when it cannot observe a frame: no
  /// spills, no calls except at most one on a shared slow path (and at
  /// most one write barrier on link-register targets), and rebase
  /// parameter locations from FP to the entry SP.
  pub(crate) fn remove_frame_if_not_needed(&mut self) {
    // Intrinsics are naturally frameless.
    if self.opts.intrinsic_mode {
      self.fg.frameless = true;
      return;
    }

    // Outside of precompiled code the caller pool pointer must be
    // preserved, so a frame is always required.
    if !self.opts.precompiled_mode {
      return;
    }

    // Parameter copying rewrites frame-relative accesses; keep the frame.
    if self.fg.makes_copy_of_parameters {
      return;
    }

    if self.fg.spill_slot_count > 0 {
      return;
    }

    let mut calls_on_shared_slow_path = 0;
    let mut has_write_barrier_call = false;
    for i in 0..self.fg.block_order.len() {
      let block_id = self.fg.block_order[i];
      for &instr_id in &self.fg.block(block_id).body {
        let instr = self.fg.instr(instr_id);
        if instr.summary.can_call() {
          if !instr.summary.call_on_shared_slow_path {
            // A real call needs a frame.
            return;
          }
          // The frame for a shared slow path call can be created inside
          // the slow path itself; allow only one to bound code size.
          calls_on_shared_slow_path += 1;
          if calls_on_shared_slow_path > 1 {
            return;
          }
        }

        // On targets keeping the return address in a link register the
        // write barrier stub call must spill and restore it; more than
        // one such site costs more than the frame.
        if !RETURN_ADDRESS_ON_STACK && instr.emits_write_barrier {
          if has_write_barrier_call {
            return;
          }
          has_write_barrier_call = true;
        }
      }
    }

    self.fg.frameless = true;

    let succs = self.fg.block(self.fg.graph_entry()).succs.clone();
    for block in succs {
      if !self.fg.block(block).is_function_entry() {
        continue;
      }
      let initial_defs = self.fg.block(block).initial_defs().to_vec();
      for def_id in initial_defs {
        if !self.fg.def(def_id).is_param() {
          continue;
        }
        let vreg = self.fg.def(def_id).vreg;
        self.fix_frameless_param_location(def_id, vreg, 0);
        if self.fg.def(def_id).has_pair_representation() {
          let second = self.fg.def(def_id).second_vreg;
          self.fix_frameless_param_location(def_id, second, 1);
        }
      }
    }
  }

  fn fix_frameless_param_location(
    &mut self,
    def_id: crate::ir::DefId,
    vreg: Vreg,
    pair_index: usize,
  ) {
    let mut location = match &self.fg.def(def_id).kind {
      DefKind::Param { location, .. } => *location,
      _ => unreachable!(),
    };
    if let Location::Pair(lo, hi) = location {
      debug_assert!(self.fg.def(def_id).has_pair_representation());
      location = self.fg.loc(if pair_index == 0 { lo } else { hi });
    }
    if !location.has_stack_index() || location.base_reg() != BaseReg::Fp {
      return;
    }

    let fp_relative = location;
    let sp_relative = fp_relative.to_entry_sp_relative(&self.opts.frame_layout);

    let mut range = Some(self.parent_range(vreg));
    while let Some(r) = range {
      if self.assigned_loc(r) == fp_relative {
        self.set_assigned_loc(r, sp_relative);
        self.arena.range_mut(r).spill_slot = sp_relative;
        let mut use_pos = self.arena.range(r).first_use;
        while let Some(u) = use_pos {
          let slot = self.arena.use_pos(u).slot;
          debug_assert_eq!(self.fg.loc(slot), fp_relative);
          self.fg.set_loc(slot, sp_relative);
          use_pos = self.arena.use_pos(u).next;
        }
      }
      range = self.arena.range(r).next_sibling;
    }
  }

  // ---------------------------------------------------------------------
  // Outgoing arguments.

  /// Outgoing arguments live at the top of the stack in direct order
  /// (last argument on top), below all spill slots.
  pub(crate) fn allocate_outgoing_arguments(&mut self) {
    let total_spill_slot_count = self.fg.spill_slot_count as i32;
    let layout = self.opts.frame_layout;

    for i in 0..self.fg.block_order.len() {
      let block_id = self.fg.block_order[i];
      let body = self.fg.block(block_id).body.clone();
      for instr_id in body {
        let move_arguments = self.fg.instr(instr_id).move_arguments.clone();
        for move_arg in move_arguments {
          let (location_slot, sp_relative_index, is_register_move) =
            match &self.fg.def(move_arg).kind {
              DefKind::MoveArgument {
                location_slot,
                sp_relative_index,
                is_register_move,
                ..
              } => (*location_slot, *sp_relative_index, *is_register_move),
              _ => unreachable!(),
            };
          // Register arguments were handled as fixed register inputs.
          if is_register_move {
            continue;
          }

          let spill_index = (total_spill_slot_count - 1) - sp_relative_index;
          let slot_index = layout.frame_slot_for_variable_index(-spill_index);
          let rep = self.fg.def(move_arg).representation;
          let loc = if rep == Representation::UnboxedDouble {
            Location::DoubleStackSlot { index: slot_index, base: BaseReg::Fp }
          } else {
            Location::StackSlot { index: slot_index, base: BaseReg::Fp }
          };
          self.fg.set_loc(location_slot, loc);
        }
      }
    }
  }

  // ---------------------------------------------------------------------
  // Parallel move scheduling.

  /// Serialize every parallel move in the graph: block entry moves, moves
  /// inserted at split points, and the edge moves on gotos and try
  /// entries.
  pub(crate) fn schedule_parallel_moves(&mut self) {
    let (pmoves, loc_slots) = (&mut self.fg.pmoves, &self.fg.loc_slots);
    for pmove in pmoves.iter_mut() {
      pmove.schedule(loc_slots);
    }
  }
}
