/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Instruction numbering and live range construction.
//!
//! Numbering assigns every real instruction a pair of lifetime positions
//! (`2n` start, `2n + 1` end) in linear block order and creates the empty
//! parallel moves phi resolution will fill in. Construction then walks the
//! blocks in reverse linear order and instructions in reverse, so use
//! intervals are prepended in monotonically decreasing order and merge in
//! constant time.
//!
//! When describing live range shapes in comments below:
//!
//! ```text
//!   i i'  start and end of an instruction
//!   [--)  a use interval
//!   *     a use position
//! ```

use crate::ir::{
  BlockId, DefId, DefKind, InstrId, InstrKind, LocationSummary, Pos,
  Representation, SafepointSite, Vreg, TEMP_VREG,
};
use crate::liverange::{
  has_only_unconstrained_uses, has_only_unconstrained_uses_in_loop,
  is_instruction_start_position, RangeId,
};
use crate::location::{Location, RegisterKind, SlotId};
use crate::parallel_move::MoveRef;
use crate::target::{
  ALL_CPU_REGS, ALL_FPU_REGS, AVAILABLE_CPU_REGS, VOLATILE_CPU_REGS,
  VOLATILE_FPU_REGS,
};
use log::trace;

use super::{Allocator, ExtraLoopInfo, PosItem};

/// Position of the first instruction after the graph entry.
pub(crate) const NORMAL_ENTRY_POS: Pos = 2;

fn register_kind_from_policy(loc: Location) -> RegisterKind {
  if loc == Location::RequiresFpuRegister {
    RegisterKind::Fpu
  } else {
    RegisterKind::Cpu
  }
}

impl<'a> Allocator<'a> {
  // ---------------------------------------------------------------------
  // Representation collection.

  pub(crate) fn collect_representations(&mut self) {
    let record = |reps: &mut Vec<Representation>, def: &crate::ir::Def| {
      if def.vreg < 0 {
        return;
      }
      reps[def.vreg as usize] = def.representation.for_range();
      if def.has_pair_representation() {
        reps[def.second_vreg as usize] = def.representation.for_range();
      }
    };

    for block in &self.fg.blocks {
      for &def_id in block.initial_defs() {
        record(&mut self.value_representations, self.fg.def(def_id));
      }
      for &phi in block.phis() {
        record(&mut self.value_representations, self.fg.def(phi));
      }
      for &instr_id in &block.body {
        if let Some(def_id) = self.fg.instr(instr_id).def {
          record(&mut self.value_representations, self.fg.def(def_id));
        }
      }
    }
  }

  // ---------------------------------------------------------------------
  // Instruction numbering.

  pub(crate) fn number_instructions(&mut self) {
    let mut pos: Pos = 0;

    for idx in 0..self.fg.block_order.len() {
      let block_id = self.fg.block_order[idx];
      self.instructions.push(PosItem::Entry(block_id));
      self.block_entries.push(block_id);
      self.fg.block_mut(block_id).start_pos = pos;
      pos += 2;

      let body = self.fg.block(block_id).body.clone();
      for instr_id in body {
        // Parallel moves carry no position of their own.
        if self.fg.instr(instr_id).is_parallel_move() {
          continue;
        }
        self.instructions.push(PosItem::Instr(instr_id));
        self.block_entries.push(block_id);
        self.fg.instr_mut(instr_id).lifetime_pos = pos;
        pos += 2;
      }
      self.fg.block_mut(block_id).end_pos = pos;
    }

    // Create phi resolution moves in join predecessors. This must happen
    // after all instructions are numbered.
    for idx in 0..self.fg.block_order.len() {
      let block_id = self.fg.block_order[idx];
      if !self.fg.block(block_id).is_join() {
        continue;
      }
      let mut move_count = 0;
      for &phi in self.fg.block(block_id).phis() {
        move_count +=
          if self.fg.def(phi).has_pair_representation() { 2 } else { 1 };
      }
      let preds = self.fg.block(block_id).preds.clone();
      for pred in preds {
        let last = self
          .fg
          .last_instruction(pred)
          .expect("predecessor of a join must have a terminator");
        let pmove = self.terminator_parallel_move(last);
        for _ in 0..move_count {
          self.fg.add_move(pmove, Location::Invalid, Location::Invalid);
        }
      }
    }

    // Extra information for each loop: positions it spans and, later, its
    // back-edge interference set.
    for i in 0..self.fg.loops.len() {
      let header = self.fg.loops[i].header;
      let start = self.fg.block(header).start_pos;
      let mut end = start;
      for &back_edge in &self.fg.loops[i].back_edges {
        end = end.max(self.fg.block(back_edge).end_pos);
      }
      self.extra_loop_info.push(ExtraLoopInfo {
        start,
        end,
        backedge_interference: None,
      });
    }
  }

  fn terminator_parallel_move(&mut self, instr: InstrId) -> crate::ir::MoveId {
    let existing = match &self.fg.instr(instr).kind {
      InstrKind::Goto { parallel_move, .. }
      | InstrKind::TryEntry { parallel_move, .. } => *parallel_move,
      _ => unreachable!("terminator without a parallel move slot"),
    };
    if let Some(pmove) = existing {
      return pmove;
    }
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

  pub(crate) fn block_parallel_move(
    &mut self,
    block: BlockId,
  ) -> crate::ir::MoveId {
    if let Some(pmove) = self.fg.block(block).parallel_move {
      return pmove;
    }
    let pmove = self.fg.new_pmove();
    self.fg.block_mut(block).parallel_move = Some(pmove);
    pmove
  }

  // ---------------------------------------------------------------------
  // Parallel move placement.

  fn body_index_of(&self, instr: InstrId) -> (BlockId, usize) {
    let block = self.fg.instr(instr).block;
    let index = self
      .fg
      .block(block)
      .body
      .iter()
      .position(|&i| i == instr)
      .expect("instruction not in its block");
    (block, index)
  }

  fn new_parallel_move_instr(&mut self, block: BlockId, pos: Pos) -> InstrId {
    let pmove = self.fg.new_pmove();
    let instr = self.fg.new_instr(block, InstrKind::ParallelMove(pmove));
    self.fg.instr_mut(instr).lifetime_pos = pos;
    instr
  }

  fn parallel_move_of(&self, instr: InstrId) -> crate::ir::MoveId {
    match self.fg.instr(instr).kind {
      InstrKind::ParallelMove(pmove) => pmove,
      _ => unreachable!(),
    }
  }

  fn create_parallel_move_before(
    &mut self,
    instr: InstrId,
    pos: Pos,
  ) -> crate::ir::MoveId {
    let (block, index) = self.body_index_of(instr);
    if index > 0 {
      let prev = self.fg.block(block).body[index - 1];
      if self.fg.instr(prev).is_parallel_move()
        && self.fg.instr(prev).lifetime_pos == pos
      {
        return self.parallel_move_of(prev);
      }
    }
    let move_instr = self.new_parallel_move_instr(block, pos);
    self.fg.block_mut(block).body.insert(index, move_instr);
    self.parallel_move_of(move_instr)
  }

  fn create_parallel_move_after(
    &mut self,
    instr: InstrId,
    pos: Pos,
  ) -> crate::ir::MoveId {
    let (block, index) = self.body_index_of(instr);
    if index + 1 < self.fg.block(block).body.len() {
      let next = self.fg.block(block).body[index + 1];
      if self.fg.instr(next).is_parallel_move()
        && self.fg.instr(next).lifetime_pos == pos
      {
        return self.parallel_move_of(next);
      }
    }
    let move_instr = self.new_parallel_move_instr(block, pos);
    self.fg.block_mut(block).body.insert(index + 1, move_instr);
    self.parallel_move_of(move_instr)
  }

  fn parallel_move_at_block_start(
    &mut self,
    block: BlockId,
    pos: Pos,
  ) -> crate::ir::MoveId {
    if let Some(&first) = self.fg.block(block).body.first() {
      if self.fg.instr(first).is_parallel_move()
        && self.fg.instr(first).lifetime_pos == pos
      {
        return self.parallel_move_of(first);
      }
    }
    let move_instr = self.new_parallel_move_instr(block, pos);
    self.fg.block_mut(block).body.insert(0, move_instr);
    self.parallel_move_of(move_instr)
  }

  /// Create (or reuse) a parallel move at the given lifetime position and
  /// append a `(to <- from)` transfer to it.
  pub(crate) fn add_move_at(
    &mut self,
    pos: Pos,
    to: Location,
    from: Location,
  ) -> MoveRef {
    debug_assert!(!self.is_block_entry(pos) || self.is_catch_block_entry(pos));
    // The graph entry hosts no moves.
    debug_assert!(pos >= NORMAL_ENTRY_POS);

    let pmove = match self.instruction_at(pos) {
      PosItem::Entry(block) => {
        // Moves attached to a block entry execute right after it.
        self.parallel_move_at_block_start(block, pos)
      }
      PosItem::Instr(instr) => {
        if is_instruction_start_position(pos) {
          self.create_parallel_move_before(instr, pos)
        } else {
          self.create_parallel_move_after(instr, pos)
        }
      }
    };
    self.fg.add_move(pmove, to, from)
  }

  // ---------------------------------------------------------------------
  // Live range construction.

  pub(crate) fn build_live_ranges(&mut self) {
    let block_count = self.fg.block_order.len();
    debug_assert!(self.fg.block(self.fg.block_order[0]).is_graph_entry());

    // While processing a loop's back edge blocks this holds the loop id
    // whose interference set accumulates values live across the edge.
    let mut interference: Option<usize> = None;

    for x in (1..block_count).rev() {
      let block_id = self.fg.block_order[x];
      let block_start = self.fg.block(block_id).start_pos;
      let block_end = self.fg.block(block_id).end_pos;
      debug_assert_eq!(self.block_entry_at(block_start), block_id);

      // For every value live out of the block, optimistically create an
      // interval covering the whole block; a definition inside the block
      // will shorten it.
      let live_out: Vec<usize> =
        self.liveness.live_out(self.fg, block_id).iter().collect();
      for vreg in live_out {
        let range = self.get_live_range(vreg as Vreg);
        self.arena.add_use_interval(range, block_start, block_end);
      }

      let loop_id = self.fg.block(block_id).loop_id;
      if let Some(lid) = loop_id {
        if self.fg.loops[lid].is_back_edge(block_id) {
          if self.extra_loop_info[lid].backedge_interference.is_none() {
            // All values flowing into the loop header are live at the
            // back edge and can interfere with phi moves.
            let header = self.fg.loops[lid].header;
            let mut set = crate::bitset::BitSet::new(self.fg.max_vreg);
            set.add_all(self.liveness.live_in(self.fg, header));
            self.extra_loop_info[lid].backedge_interference = Some(set);
          }
          interference = Some(lid);
        }
      }

      // Connect outgoing phi moves created during numbering, then process
      // the remaining instructions in reverse order.
      let body = self.fg.block(block_id).body.clone();
      let mut upper = body.len();
      if let Some(&last) = body.last() {
        if let InstrKind::Goto { parallel_move, .. } = self.fg.instr(last).kind
        {
          upper -= 1;
          if parallel_move.is_some() {
            self.connect_outgoing_phi_moves(block_id, last, interference);
          }
        }
      }

      let mut surrounding_catch = self
        .fg
        .block(block_id)
        .try_index
        .map(|ti| self.fg.get_catch_block_by_try_index(ti));

      for i in (0..upper).rev() {
        let instr_id = body[i];
        // Skip parallel moves inserted while processing instructions.
        if self.fg.instr(instr_id).is_parallel_move() {
          continue;
        }

        if let Some(catch_block) = surrounding_catch {
          if self.fg.instr(instr_id).may_throw {
            // Everything live into the catch must survive up to (and
            // including) the throwing instruction.
            let current_pos = self.fg.instr(instr_id).lifetime_pos;
            let live: Vec<usize> =
              self.liveness.live_in(self.fg, catch_block).iter().collect();
            for vreg in live {
              let range = self.get_live_range(vreg as Vreg);
              self.arena.add_use_interval(range, block_start, current_pos + 1);
            }
            surrounding_catch = None;
          }
        }

        self.process_one_instruction(block_id, instr_id, interference);
      }

      // Check which values live into the loop can be spilled for free.
      if self.fg.is_loop_header(block_id) {
        let lid = loop_id.unwrap();
        interference = None;
        let loop_end = self.extra_loop_info[lid].end;
        let live: Vec<usize> =
          self.liveness.live_in(self.fg, block_id).iter().collect();
        for vreg in live {
          let range = self.get_live_range(vreg as Vreg);
          if has_only_unconstrained_uses_in_loop(
            &self.arena,
            &self.fg.loc_slots,
            range,
            loop_end,
          ) {
            self
              .arena
              .range_mut(range)
              .mark_has_only_unconstrained_uses_in_loop(lid);
          }
        }
      }

      if self.fg.block(block_id).is_join() {
        self.connect_incoming_phi_moves(block_id);
      } else if self.fg.block(block_id).is_catch_block_entry() {
        // Catch entries are briefly safepoints after the catch moves
        // execute and before control reaches the handler.
        self.safepoints.push(SafepointSite::CatchEntry(block_id));

        let initial_defs = self.fg.block(block_id).initial_defs().to_vec();
        for (i, def_id) in initial_defs.into_iter().enumerate() {
          let vreg = self.fg.def(def_id).vreg;
          let range = self.get_live_range(vreg);
          self.arena.define_at(range, block_start);
          self.process_initial_definition(def_id, range, block_id, i, false);
        }
      } else if self.fg.block(block_id).is_function_entry()
        || self.fg.block(block_id).is_osr_entry()
      {
        let initial_defs = self.fg.block(block_id).initial_defs().to_vec();
        for (i, def_id) in initial_defs.into_iter().enumerate() {
          if self.fg.def(def_id).has_pair_representation() {
            // The low half is pushed after the high half.
            let second = self.fg.def(def_id).second_vreg;
            let range = self.get_live_range(second);
            self.arena.add_use_interval(range, block_start, block_start + 2);
            self.arena.define_at(range, block_start);
            self.process_initial_definition(def_id, range, block_id, i, true);
          }
          let vreg = self.fg.def(def_id).vreg;
          let range = self.get_live_range(vreg);
          self.arena.add_use_interval(range, block_start, block_start + 2);
          self.arena.define_at(range, block_start);
          self.process_initial_definition(def_id, range, block_id, i, false);
        }
      }
    }

    // Process incoming parameters and constants last, so that safepoints
    // for all calls have already been collected.
    let graph_entry = self.fg.graph_entry();
    let entry_start = self.fg.block(graph_entry).start_pos;
    let entry_end = self.fg.block(graph_entry).end_pos;
    let initial_defs = self.fg.block(graph_entry).initial_defs().to_vec();
    for (i, def_id) in initial_defs.into_iter().enumerate() {
      if self.fg.def(def_id).has_pair_representation() {
        let second = self.fg.def(def_id).second_vreg;
        let range = self.get_live_range(second);
        self.arena.add_use_interval(range, entry_start, entry_end);
        self.arena.define_at(range, entry_start);
        self.process_initial_definition(def_id, range, graph_entry, i, true);
      }
      let vreg = self.fg.def(def_id).vreg;
      let range = self.get_live_range(vreg);
      self.arena.add_use_interval(range, entry_start, entry_end);
      self.arena.define_at(range, entry_start);
      self.process_initial_definition(def_id, range, graph_entry, i, false);
    }
  }

  // ---------------------------------------------------------------------
  // Phi wiring.

  /// Populate the predecessor's parallel move so that move `i` reads the
  /// phi's `i`-th input; the move's destination will be wired to the phi
  /// itself by `connect_incoming_phi_moves`.
  fn connect_outgoing_phi_moves(
    &mut self,
    block_id: BlockId,
    goto_instr: InstrId,
    interference: Option<usize>,
  ) {
    // All uses are recorded at the position of the parallel move
    // preceding the goto.
    let pos = self.fg.instr(goto_instr).lifetime_pos;
    let block_start = self.fg.block(block_id).start_pos;

    let (join, pmove) = match &self.fg.instr(goto_instr).kind {
      InstrKind::Goto { succ, parallel_move } => {
        (*succ, parallel_move.unwrap())
      }
      _ => unreachable!(),
    };
    let pred_index = self
      .fg
      .block(join)
      .preds
      .iter()
      .position(|&p| p == block_id)
      .expect("goto target must list this block as a predecessor");

    let phis = self.fg.block(join).phis().to_vec();
    let mut move_index = 0;
    for phi in phis {
      let val = self.fg.def(phi).as_phi().unwrap()[pred_index];
      let is_pair = self.fg.def(val).has_pair_representation();
      let mv = self.fg.pmove(pmove).moves[move_index];
      move_index += 1;

      if let Some(cid) = self.fg.def(val).as_constant() {
        self
          .fg
          .set_loc(mv.src, Location::Constant { cid, pair_index: 0 });
        if is_pair {
          let mv = self.fg.pmove(pmove).moves[move_index];
          move_index += 1;
          self
            .fg
            .set_loc(mv.src, Location::Constant { cid, pair_index: 1 });
        }
        continue;
      }

      // Expected shape of live ranges:
      //
      //                 g  g'
      //      value    --*
      //
      let vreg = self.fg.def(val).vreg;
      let range = self.get_live_range(vreg);
      self.record_interference(interference, vreg);
      self.arena.add_use_interval(range, block_start, pos);
      let phi_vreg = self.fg.def(phi).vreg;
      let hint = self.phi_location_slot(phi_vreg);
      self.arena.add_hinted_use(range, pos, mv.src, hint);
      self.fg.set_loc(mv.src, Location::PrefersRegister);

      if is_pair {
        let mv = self.fg.pmove(pmove).moves[move_index];
        move_index += 1;
        let second = self.fg.def(val).second_vreg;
        let range = self.get_live_range(second);
        self.record_interference(interference, second);
        self.arena.add_use_interval(range, block_start, pos);
        let phi_second = self.fg.def(phi).second_vreg;
        let hint = self.phi_location_slot(phi_second);
        self.arena.add_hinted_use(range, pos, mv.src, hint);
        self.fg.set_loc(mv.src, Location::PrefersRegister);
      }
    }
  }

  fn phi_location_slot(&mut self, vreg: Vreg) -> SlotId {
    let range = self.get_live_range(vreg);
    self.arena.range(range).assigned_location_slot
  }

  fn record_interference(&mut self, interference: Option<usize>, vreg: Vreg) {
    if let Some(lid) = interference {
      self.extra_loop_info[lid]
        .backedge_interference
        .as_mut()
        .unwrap()
        .add(vreg as usize);
    }
  }

  /// Define each phi at the join's start and add one use per predecessor
  /// pointing at the corresponding parallel move destination.
  fn connect_incoming_phi_moves(&mut self, join: BlockId) {
    // All uses are recorded at the start position of the join.
    let pos = self.fg.block(join).start_pos;
    let is_loop_header = self.fg.is_loop_header(join);

    let phis = self.fg.block(join).phis().to_vec();
    let preds = self.fg.block(join).preds.clone();
    let mut move_idx = 0;
    for phi in phis {
      let vreg = self.fg.def(phi).vreg;
      debug_assert!(vreg >= 0);
      let is_pair = self.fg.def(phi).has_pair_representation();

      // Expected shape of live range:
      //
      //                 B
      //      phi        [--------
      //
      let range = self.get_live_range(vreg);
      self.arena.define_at(range, pos);
      if is_loop_header {
        self.arena.range_mut(range).is_loop_phi = true;
      }
      let second_range = if is_pair {
        let second = self.fg.def(phi).second_vreg;
        let range = self.get_live_range(second);
        self.arena.define_at(range, pos);
        if is_loop_header {
          self.arena.range_mut(range).is_loop_phi = true;
        }
        Some(range)
      } else {
        None
      };

      for &pred in &preds {
        let last = self.fg.last_instruction(pred).unwrap();
        let pmove = match &self.fg.instr(last).kind {
          InstrKind::Goto { parallel_move, .. } => parallel_move.unwrap(),
          _ => unreachable!("phi predecessor must end in a goto"),
        };
        let mv = self.fg.pmove(pmove).moves[move_idx];
        self.fg.set_loc(mv.dst, Location::PrefersRegister);
        self.arena.add_use(range, pos, mv.dst);
        if let Some(second_range) = second_range {
          let mv = self.fg.pmove(pmove).moves[move_idx + 1];
          self.fg.set_loc(mv.dst, Location::PrefersRegister);
          self.arena.add_use(second_range, pos, mv.dst);
        }
      }

      // All phi resolution moves are connected; the phi's range is
      // complete.
      let kind = self.fg.def(phi).register_kind_for_result();
      self.assign_safepoints(phi, range);
      self.complete_range_of_kind(range, kind);
      if let Some(second_range) = second_range {
        self.assign_safepoints(phi, second_range);
        self.complete_range_of_kind(second_range, kind);
      }

      move_idx += if is_pair { 2 } else { 1 };
    }
  }

  // ---------------------------------------------------------------------
  // Environments and materializations.

  /// Any value mentioned in the deoptimization environment must survive
  /// to the end of the instruction, but does not need a register.
  ///
  /// Expected shape of live range:
  ///
  /// ```text
  ///                 i  i'
  ///      value    -----*
  /// ```
  fn process_environment_uses(&mut self, block_id: BlockId, instr_id: InstrId) {
    let block_start = self.fg.block(block_id).start_pos;
    let use_pos = self.fg.instr(instr_id).lifetime_pos + 1;

    let mut env = self.fg.instr(instr_id).env;
    while let Some(env_id) = env {
      let values = self.fg.env(env_id).values.clone();
      let is_outermost = self.fg.env(env_id).outer.is_none();
      if values.is_empty() {
        env = self.fg.env(env_id).outer;
        continue;
      }

      let mut locations: Vec<SlotId> = Vec::with_capacity(values.len());
      for (i, &value) in values.iter().enumerate() {
        if is_outermost && self.fg.suspend_state_env_index == Some(i) {
          // The synthetic suspend-state variable has a fixed location on
          // the stack frame; deoptimization relies on it.
          let slot_index = self.suspend_state_frame_slot();
          locations.push(self.fg.new_slot(Location::stack_slot(slot_index)));
          if self.fg.def(value).as_constant().is_none() {
            debug_assert!(
              self.fg.def(value).is_param() || self.fg.def(value).is_phi()
            );
            debug_assert!(!self.fg.def(value).has_pair_representation());
            let vreg = self.fg.def(value).vreg;
            let range = self.get_live_range(vreg);
            self.arena.add_use_interval(range, block_start, use_pos);
          }
          continue;
        }

        if self.fg.def(value).is_move_argument() {
          // Frame size is unknown until after allocation.
          locations.push(self.fg.new_slot(Location::Invalid));
          continue;
        }

        if let Some(cid) = self.fg.def(value).as_constant() {
          locations.push(self.fg.new_slot(Location::constant(cid)));
          continue;
        }

        if self.fg.def(value).is_materialization() {
          // The materialization itself produces no value; its inputs are
          // allocated and used when building deoptimization data.
          locations.push(self.fg.new_slot(Location::Invalid));
          self.process_materialization_uses(block_start, use_pos, value);
          continue;
        }

        if self.fg.def(value).has_pair_representation() {
          let pair = self.fg.new_pair_slot(Location::Any, Location::Any);
          let (lo, hi) = self.fg.pair_halves(pair).unwrap();
          locations.push(pair);
          let vreg = self.fg.def(value).vreg;
          let range = self.get_live_range(vreg);
          self.arena.add_use_interval(range, block_start, use_pos);
          self.arena.add_use(range, use_pos, lo);
          let second = self.fg.def(value).second_vreg;
          let range = self.get_live_range(second);
          self.arena.add_use_interval(range, block_start, use_pos);
          self.arena.add_use(range, use_pos, hi);
        } else {
          let slot = self.fg.new_slot(Location::Any);
          locations.push(slot);
          let vreg = self.fg.def(value).vreg;
          let range = self.get_live_range(vreg);
          self.arena.add_use_interval(range, block_start, use_pos);
          self.arena.add_use(range, use_pos, slot);
        }
      }

      self.fg.env_mut(env_id).locations = Some(locations);
      env = self.fg.env(env_id).outer;
    }
  }

  /// Materializations can appear several times in the same environment
  /// chain and may reference each other; each is allocated at most once.
  fn process_materialization_uses(
    &mut self,
    block_start: Pos,
    use_pos: Pos,
    mat: DefId,
  ) {
    let inputs = match &self.fg.def(mat).kind {
      DefKind::Materialize { inputs, locations, .. } => {
        if locations.is_some() {
          return; // Already processed.
        }
        inputs.clone()
      }
      _ => unreachable!(),
    };

    // Publish the location array up front so recursive references (and
    // cycles) terminate.
    let locations: Vec<SlotId> = inputs
      .iter()
      .map(|_| self.fg.new_slot(Location::Invalid))
      .collect();
    match &mut self.fg.def_mut(mat).kind {
      DefKind::Materialize { locations: slot, .. } => {
        *slot = Some(locations.clone())
      }
      _ => unreachable!(),
    }

    for (i, &input) in inputs.iter().enumerate() {
      if let Some(cid) = self.fg.def(input).as_constant() {
        self.fg.set_loc(locations[i], Location::constant(cid));
      } else if self.fg.def(input).has_pair_representation() {
        let lo = self.fg.new_slot(Location::Any);
        let hi = self.fg.new_slot(Location::Any);
        self.fg.set_loc(locations[i], Location::Pair(lo, hi));
        let vreg = self.fg.def(input).vreg;
        let range = self.get_live_range(vreg);
        self.arena.add_use_interval(range, block_start, use_pos);
        self.arena.add_use(range, use_pos, lo);
        let second = self.fg.def(input).second_vreg;
        let range = self.get_live_range(second);
        self.arena.add_use_interval(range, block_start, use_pos);
        self.arena.add_use(range, use_pos, hi);
      } else if self.fg.def(input).is_materialization() {
        self.process_materialization_uses(block_start, use_pos, input);
      } else {
        self.fg.set_loc(locations[i], Location::Any);
        let vreg = self.fg.def(input).vreg;
        let range = self.get_live_range(vreg);
        self.arena.add_use_interval(range, block_start, use_pos);
        self.arena.add_use(range, use_pos, locations[i]);
      }
    }
  }

  // ---------------------------------------------------------------------
  // Inputs, temps, outputs.

  fn process_one_input(
    &mut self,
    block_id: BlockId,
    pos: Pos,
    slot: SlotId,
    vreg: Vreg,
    live_registers_of: Option<InstrId>,
  ) {
    let in_loc = self.fg.loc(slot);
    debug_assert!(!in_loc.is_pair());
    let block_start = self.fg.block(block_id).start_pos;
    let range = self.get_live_range(vreg);

    if in_loc.is_machine_register() {
      // Input is expected in a fixed register. Expected shape of live
      // ranges:
      //
      //                 j' i  i'
      //      value    --*
      //      register   [-----)
      //
      if let Some(instr) = live_registers_of {
        let rep = self.arena.range(range).representation;
        self
          .fg
          .instr_mut(instr)
          .summary
          .live_registers
          .push((in_loc, rep));
      }
      debug_assert!(
        !in_loc.is_register()
          || AVAILABLE_CPU_REGS & (1 << in_loc.register_code()) != 0
      );
      let mv = self.add_move_at(pos - 1, in_loc, Location::Any);
      self.block_location(in_loc, pos - 1, pos + 1);
      self.arena.add_use_interval(range, block_start, pos - 1);
      self.arena.add_hinted_use(range, pos - 1, mv.src, slot);
    } else if in_loc.is_unallocated() {
      if in_loc == Location::WritableRegister {
        // Writable unallocated input. The value is copied into a fresh
        // one-instruction temporary the instruction may clobber.
        //
        //                 i  i'
        //      value    --*
        //      temp       [--)
        //
        let mv = self.add_move_at(
          pos,
          Location::RequiresRegister,
          Location::PrefersRegister,
        );

        self.arena.add_use_interval(range, block_start, pos);
        self.arena.add_use(range, pos, mv.src);

        let temp = self.make_live_range_for_temporary();
        self.arena.add_use_interval(temp, pos, pos + 1);
        self.arena.add_hinted_use(temp, pos, slot, mv.src);
        self.arena.add_use(temp, pos, mv.dst);
        self.fg.set_loc(slot, Location::RequiresRegister);
        self.complete_range_of_kind(
          temp,
          register_kind_from_policy(Location::RequiresRegister),
        );
      } else {
        if in_loc == Location::RequiresStack {
          self.arena.range_mut(range).has_uses_which_require_stack = true;
        }

        // Normal unallocated input. Expected shape of live ranges:
        //
        //                 i  i'
        //      value    -----*
        //
        self.arena.add_use_interval(range, block_start, pos + 1);
        self.arena.add_use(range, pos + 1, slot);
      }
    } else {
      debug_assert!(in_loc.is_constant());
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn process_one_output(
    &mut self,
    block_id: BlockId,
    pos: Pos,
    out_slot: SlotId,
    def_id: DefId,
    vreg: Vreg,
    output_same_as_first_input: bool,
    in_slot: Option<SlotId>,
    input_vreg: Vreg,
    interference: Option<usize>,
  ) {
    let out_loc = self.fg.loc(out_slot);
    debug_assert!(!out_loc.is_pair());
    let block_start = self.fg.block(block_id).start_pos;

    let range = if vreg >= 0 {
      self.get_live_range(vreg)
    } else {
      self.make_live_range_for_temporary()
    };

    if out_loc.is_machine_register() {
      // Fixed output location. Expected shape of live range:
      //
      //                    i  i' j  j'
      //    register        [--)
      //    output             [-------
      //
      debug_assert!(
        !out_loc.is_register()
          || AVAILABLE_CPU_REGS & (1 << out_loc.register_code()) != 0
      );
      self.block_location(out_loc, pos, pos + 1);

      if self.arena.range(range).vreg == TEMP_VREG {
        return;
      }

      // If the value has no uses it does not need to be allocated.
      if self.arena.range(range).first_use.is_none() {
        return;
      }

      // Connect the fixed output to all uses that immediately follow, to
      // avoid allocating an intermediary register.
      while let Some(use_id) = self.arena.range(range).first_use {
        let use_pos = self.arena.use_pos(use_id).pos;
        if use_pos == pos + 1 {
          let slot = self.arena.use_pos(use_id).slot;
          debug_assert!(self.fg.loc(slot).is_unallocated());
          self.fg.set_loc(slot, out_loc);
          let next = self.arena.use_pos(use_id).next;
          self.arena.range_mut(range).first_use = next;
        } else {
          debug_assert!(use_pos > pos + 1); // sorted
          break;
        }
      }

      // Shorten the range to the point of definition; this may leave it
      // empty if the only use immediately followed. Otherwise connect the
      // fixed register to an unallocated location with a move.
      self.arena.define_at(range, pos + 1);
      if self.arena.start(range) == self.arena.end(range) {
        return;
      }

      let mv = self.add_move_at(pos + 1, Location::Any, out_loc);
      self.arena.add_hinted_use(range, pos + 1, mv.dst, out_slot);
    } else if output_same_as_first_input {
      // The output register holds the value of the first input at the
      // instruction's start. Expected shape of live ranges:
      //
      //                 i  i'
      //    input #0   --*
      //    output       [----
      //
      let in_slot = in_slot.unwrap();
      let in_loc = self.fg.loc(in_slot);
      debug_assert!(
        in_loc == Location::RequiresRegister
          || in_loc == Location::RequiresFpuRegister
      );
      self.fg.set_loc(out_slot, in_loc);

      // Inside loops prefer a register for the copied value, but do not
      // require one.
      let src_policy = if self.fg.block(block_id).loop_id.is_some() {
        Location::PrefersRegister
      } else {
        Location::Any
      };
      let mv = self.add_move_at(pos, Location::RequiresRegister, src_policy);

      let input_range = self.get_live_range(input_vreg);
      self.arena.add_use_interval(input_range, block_start, pos);
      self.arena.add_use(input_range, pos, mv.src);

      self.arena.define_at(range, pos);
      self.arena.add_hinted_use(range, pos, out_slot, mv.src);
      self.arena.add_use(range, pos, mv.dst);
      self.arena.add_use(range, pos, in_slot);

      if vreg >= 0 {
        if let Some(lid) = interference {
          let set =
            self.extra_loop_info[lid].backedge_interference.as_mut().unwrap();
          if set.contains(vreg as usize) {
            set.add(input_vreg as usize);
          }
        }
      }
    } else {
      // Normal unallocated location requiring a register. Expected shape
      // of live range:
      //
      //                    i  i'
      //    output          [-------
      //
      debug_assert!(
        out_loc == Location::RequiresRegister
          || out_loc == Location::RequiresFpuRegister
      );
      self.arena.define_at(range, pos);
      self.arena.add_use(range, pos, out_slot);
    }

    let kind = self.fg.def(def_id).register_kind_for_result();
    self.assign_safepoints(def_id, range);
    self.complete_range_of_kind(range, kind);
  }

  /// True if `def` has no uses after the current instruction. Only valid
  /// during range construction: all uses encountered so far were
  /// prepended, so any remaining interval must start in this block.
  fn is_dead_after_current_instruction(
    &mut self,
    block_id: BlockId,
    def_id: DefId,
  ) -> bool {
    if self.fg.def(def_id).has_pair_representation() {
      return false;
    }
    let vreg = self.fg.def(def_id).vreg;
    let range = self.get_live_range(vreg);
    let block_end = self.fg.block(block_id).end_pos;
    match self.arena.range(range).first_interval {
      None => true,
      Some(interval) => self.arena.interval(interval).start >= block_end,
    }
  }

  /// Create and update live ranges for the instruction's inputs, temps
  /// and output.
  pub(crate) fn process_one_instruction(
    &mut self,
    block_id: BlockId,
    instr_id: InstrId,
    interference: Option<usize>,
  ) {
    // Constants without constraining uses are bound directly and their
    // definition is dropped.
    if let Some(def_id) = self.fg.instr(instr_id).def {
      if let Some(cid) = self.fg.def(def_id).as_constant() {
        debug_assert!(!self.fg.def(def_id).has_pair_representation());
        let vreg = self.fg.def(def_id).vreg;
        let range =
          if vreg >= 0 { Some(self.get_live_range(vreg)) } else { None };

        let out_slot = self.fg.instr(instr_id).summary.output;
        let no_uses = match range {
          None => true,
          Some(r) => self.arena.range(r).first_use.is_none(),
        };
        if no_uses {
          if let Some(out) = out_slot {
            self.fg.set_loc(out, Location::Invalid);
          }
          return;
        }

        let range = range.unwrap();
        if has_only_unconstrained_uses(&self.arena, &self.fg.loc_slots, range)
        {
          let constant = Location::constant(cid);
          self.set_assigned_loc(range, constant);
          self.arena.range_mut(range).spill_slot = constant;
          self.arena.finger_initialize(range);
          self.convert_all_uses(range);
          if let Some(out) = out_slot {
            self.fg.set_loc(out, Location::Invalid);
          }
          return;
        }
      }
    }

    let pos = self.fg.instr(instr_id).lifetime_pos;
    debug_assert!(is_instruction_start_position(pos));
    debug_assert_eq!(
      self.fg.instr(instr_id).summary.inputs.len(),
      self.fg.instr(instr_id).inputs.len()
    );

    // Normalize a same-as-first-input output whose input is specified as
    // a fixed register.
    if let Some(out_slot) = self.fg.instr(instr_id).summary.output {
      if self.fg.loc(out_slot) == Location::SameAsFirstInput {
        let in_slot = self.fg.instr(instr_id).summary.inputs[0];
        match self.fg.loc(in_slot) {
          Location::Pair(lo, hi) => {
            let lo_loc = self.fg.loc(lo);
            let hi_loc = self.fg.loc(hi);
            debug_assert_eq!(
              lo_loc.is_machine_register(),
              hi_loc.is_machine_register()
            );
            if lo_loc.is_machine_register() && hi_loc.is_machine_register() {
              let pair = self.fg.new_pair_slot(lo_loc, hi_loc);
              let pair_loc = self.fg.loc(pair);
              self.fg.set_loc(out_slot, pair_loc);
            }
          }
          in_loc if in_loc.is_machine_register() => {
            self.fg.set_loc(out_slot, in_loc);
          }
          _ => {}
        }
      }

      if self.fg.loc(out_slot) == Location::SameAsFirstOrSecondInput {
        let in_left = self.fg.instr(instr_id).summary.inputs[0];
        let in_right = self.fg.instr(instr_id).summary.inputs[1];
        if self.fg.loc(in_left) == self.fg.loc(in_right) {
          // If the first input outlives this instruction but the second
          // does not, flip them to save a move.
          let defn_left = self.fg.instr(instr_id).inputs[0];
          let defn_right = self.fg.instr(instr_id).inputs[1];
          if !self.is_dead_after_current_instruction(block_id, defn_left)
            && self.is_dead_after_current_instruction(block_id, defn_right)
          {
            self.fg.instr_mut(instr_id).inputs.swap(0, 1);
          }
        }
        self.fg.set_loc(out_slot, Location::SameAsFirstInput);
      }

      if self.fg.loc(out_slot) == Location::MayBeSameAsFirstInput {
        let input_defn = self.fg.instr(instr_id).inputs[0];
        let lowered =
          if self.is_dead_after_current_instruction(block_id, input_defn) {
            Location::SameAsFirstInput
          } else {
            Location::RequiresRegister
          };
        self.fg.set_loc(out_slot, lowered);
      }
    }

    let output_same_as_first_input = match self.fg.instr(instr_id).summary.output
    {
      Some(out) => self.fg.loc(out) == Location::SameAsFirstInput,
      None => false,
    };

    // Output same as a pair input: the output becomes a pair too.
    if output_same_as_first_input {
      let in_slot = self.fg.instr(instr_id).summary.inputs[0];
      if self.fg.loc(in_slot).is_pair() {
        let pair = self.fg.new_pair_slot(
          Location::RequiresRegister,
          Location::RequiresRegister,
        );
        let pair_loc = self.fg.loc(pair);
        let out_slot = self.fg.instr(instr_id).summary.output.unwrap();
        self.fg.set_loc(out_slot, pair_loc);
      }
    }

    if self.fg.instr(instr_id).env.is_some() {
      self.process_environment_uses(block_id, instr_id);
    }

    // Process inputs. The first one is skipped if the output shares its
    // location; they are processed together at the very end.
    let live_registers_of =
      if self.fg.instr(instr_id).summary.has_call_on_slow_path() {
        Some(instr_id)
      } else {
        None
      };
    let first_input = if output_same_as_first_input { 1 } else { 0 };
    for j in first_input..self.fg.instr(instr_id).summary.inputs.len() {
      let slot = self.fg.instr(instr_id).summary.inputs[j];
      let input = self.fg.instr(instr_id).inputs[j];
      if let Location::Pair(lo, hi) = self.fg.loc(slot) {
        debug_assert!(self.fg.def(input).has_pair_representation());
        // Each half is assigned its own virtual register and allocated
        // its own live range.
        let (v0, v1) =
          (self.fg.def(input).vreg, self.fg.def(input).second_vreg);
        self.process_one_input(block_id, pos, lo, v0, live_registers_of);
        self.process_one_input(block_id, pos, hi, v1, live_registers_of);
      } else {
        let vreg = self.fg.def(input).vreg;
        self.process_one_input(block_id, pos, slot, vreg, live_registers_of);
      }
    }

    // Detached move arguments in fixed registers are processed like
    // fixed inputs.
    let move_arguments = self.fg.instr(instr_id).move_arguments.clone();
    for move_arg in move_arguments {
      let (value, location_slot, is_register_move) =
        match &self.fg.def(move_arg).kind {
          DefKind::MoveArgument {
            value, location_slot, is_register_move, ..
          } => (*value, *location_slot, *is_register_move),
          _ => unreachable!(),
        };
      if !is_register_move {
        continue;
      }
      if let Location::Pair(lo, hi) = self.fg.loc(location_slot) {
        debug_assert!(
          self.fg.loc(lo).is_machine_register()
            && self.fg.loc(hi).is_machine_register()
        );
        let (v0, v1) =
          (self.fg.def(value).vreg, self.fg.def(value).second_vreg);
        self.process_one_input(block_id, pos, lo, v0, None);
        self.process_one_input(block_id, pos, hi, v1, None);
      } else {
        debug_assert!(self.fg.loc(location_slot).is_machine_register());
        let vreg = self.fg.def(value).vreg;
        self.process_one_input(block_id, pos, location_slot, vreg, None);
      }
    }

    // Process temps. Expected shape of live range:
    //
    //              i  i'
    //              [--)
    //
    for j in 0..self.fg.instr(instr_id).summary.temps.len() {
      let slot = self.fg.instr(instr_id).summary.temps[j];
      let temp = self.fg.loc(slot);
      debug_assert!(!temp.is_pair());
      if temp.is_machine_register() {
        debug_assert!(
          !temp.is_register()
            || AVAILABLE_CPU_REGS & (1 << temp.register_code()) != 0
        );
        self.block_location(temp, pos, pos + 1);
      } else if temp.is_unallocated() {
        let range = self.make_live_range_for_temporary();
        self.arena.add_use_interval(range, pos, pos + 1);
        self.arena.add_use(range, pos, slot);
        self.complete_range_of_kind(range, register_kind_from_policy(temp));
      } else {
        unreachable!("unexpected temp policy {:?}", temp);
      }
    }

    // Block all volatile registers around native leaf calls.
    if self.fg.instr(instr_id).summary.native_leaf_call() {
      self.block_cpu_registers(VOLATILE_CPU_REGS, pos, pos + 1);
      self.block_fpu_registers(VOLATILE_FPU_REGS, pos, pos + 1);
    }

    // Block all allocatable registers for calls. The stack bitmap of the
    // safepoint describes the state at position `pos`.
    if self.fg.instr(instr_id).summary.always_calls()
      && !self.fg.instr(instr_id).summary.callee_safe_call()
    {
      self.block_cpu_registers(ALL_CPU_REGS, pos, pos + 1);
      self.block_fpu_registers(ALL_FPU_REGS, pos, pos + 1);

      #[cfg(debug_assertions)]
      {
        // Everything must have been specified as a fixed location; every
        // register is blocked, so any attempt to allocate would go to
        // the stack.
        let summary = &self.fg.instr(instr_id).summary;
        for &t in &summary.temps {
          debug_assert!(!self.fg.loc(t).is_unallocated());
        }
        for &input in &summary.inputs {
          match self.fg.loc(input) {
            Location::Pair(lo, hi) => {
              for half in [lo, hi] {
                let loc = self.fg.loc(half);
                debug_assert!(
                  !loc.is_unallocated()
                    || loc == Location::Any
                    || loc == Location::RequiresStack
                );
              }
            }
            loc => debug_assert!(
              !loc.is_unallocated()
                || loc == Location::Any
                || loc == Location::RequiresStack
            ),
          }
        }
        if let Some(out) = summary.output {
          match self.fg.loc(out) {
            Location::Pair(lo, hi) => {
              debug_assert!(!self.fg.loc(lo).is_unallocated());
              debug_assert!(!self.fg.loc(hi).is_unallocated());
            }
            loc => debug_assert!(!loc.is_unallocated()),
          }
        }
      }
    }

    if self.fg.instr(instr_id).summary.can_call()
      && !self.fg.instr(instr_id).summary.native_leaf_call()
    {
      self.safepoints.push(SafepointSite::Instr(instr_id));
    }

    let def_id = match self.fg.instr(instr_id).def {
      Some(def_id) => def_id,
      None => {
        debug_assert!(self.fg.instr(instr_id).summary.output.is_none());
        return;
      }
    };
    let out_slot = match self.fg.instr(instr_id).summary.output {
      Some(out) if !self.fg.loc(out).is_invalid() => out,
      _ => {
        debug_assert!(self.fg.def(def_id).vreg < 0 || {
          // Dropped constant definition.
          self.fg.def(def_id).as_constant().is_some()
        });
        return;
      }
    };

    let (vreg, second_vreg) =
      (self.fg.def(def_id).vreg, self.fg.def(def_id).second_vreg);
    if let Location::Pair(lo, hi) = self.fg.loc(out_slot) {
      debug_assert!(self.fg.def(def_id).has_pair_representation());
      if output_same_as_first_input {
        let in_slot = self.fg.instr(instr_id).summary.inputs[0];
        let (in_lo, in_hi) = self.fg.pair_halves(in_slot).unwrap();
        let input = self.fg.instr(instr_id).inputs[0];
        debug_assert!(self.fg.def(input).has_pair_representation());
        let (iv0, iv1) =
          (self.fg.def(input).vreg, self.fg.def(input).second_vreg);
        self.process_one_output(
          block_id,
          pos,
          lo,
          def_id,
          vreg,
          true,
          Some(in_lo),
          iv0,
          interference,
        );
        self.process_one_output(
          block_id,
          pos,
          hi,
          def_id,
          second_vreg,
          true,
          Some(in_hi),
          iv1,
          interference,
        );
      } else {
        self.process_one_output(
          block_id,
          pos,
          lo,
          def_id,
          vreg,
          false,
          None,
          -1,
          interference,
        );
        self.process_one_output(
          block_id,
          pos,
          hi,
          def_id,
          second_vreg,
          false,
          None,
          -1,
          interference,
        );
      }
    } else if output_same_as_first_input {
      let in_slot = self.fg.instr(instr_id).summary.inputs[0];
      let input = self.fg.instr(instr_id).inputs[0];
      let input_vreg = self.fg.def(input).vreg;
      self.process_one_output(
        block_id,
        pos,
        out_slot,
        def_id,
        vreg,
        true,
        Some(in_slot),
        input_vreg,
        interference,
      );
    } else {
      self.process_one_output(
        block_id,
        pos,
        out_slot,
        def_id,
        vreg,
        false,
        None,
        -1,
        interference,
      );
    }
  }

  // ---------------------------------------------------------------------
  // Initial definitions.

  fn split_initial_definition_at(
    &mut self,
    range: RangeId,
    pos: Pos,
    kind: RegisterKind,
  ) {
    if self.arena.end(range) > pos {
      let slot = self.fg.new_slot(Location::Invalid);
      let tail = self.arena.split_at(range, pos, slot);
      self.complete_range_of_kind(tail, kind);
    }
  }

  fn is_suspend_state_parameter(&self, def_id: DefId) -> bool {
    match &self.fg.def(def_id).kind {
      DefKind::Param { env_index, block, .. } => {
        self.fg.block(*block).is_osr_entry()
          && self.fg.suspend_state_env_index == Some(*env_index)
      }
      _ => false,
    }
  }

  pub(crate) fn process_initial_definition(
    &mut self,
    def_id: DefId,
    range: RangeId,
    block_id: BlockId,
    _initial_definition_index: usize,
    second_location_for_definition: bool,
  ) {
    // The range end may change below when the range is split.
    let range_end = self.arena.end(range);
    let block_pos = self.fg.block(block_id).start_pos;

    if let DefKind::Param { location, .. } = self.fg.def(def_id).kind {
      let mut location = location;
      debug_assert!(!location.is_invalid());
      if let Location::Pair(lo, hi) = location {
        let half = if second_location_for_definition { hi } else { lo };
        location = self.fg.loc(half);
      }
      self.set_assigned_loc(range, location);
      if location.is_machine_register() {
        self.complete_range_for_definition(def_id, range);
        if self.arena.end(range) > block_pos + 1 {
          self.split_initial_definition_at(
            range,
            block_pos + 1,
            location.register_kind(),
          );
        }
        self.convert_all_uses(range);
        self.block_location(location, block_pos, block_pos + 1);
        return;
      } else {
        self.arena.range_mut(range).spill_slot = location;
      }
    } else {
      let cid = self
        .fg
        .def(def_id)
        .as_constant()
        .expect("initial definitions are parameters or constants");
      let pair_index = if second_location_for_definition { 1 } else { 0 };
      let constant = Location::Constant { cid, pair_index };
      self.set_assigned_loc(range, constant);
      self.arena.range_mut(range).spill_slot = constant;
    }

    self.complete_range_for_definition(def_id, range);
    self.arena.finger_initialize(range);
    if let Some(use_id) = self.arena.first_register_beneficial_use(
      range,
      block_pos,
      &self.fg.loc_slots,
    ) {
      let use_pos = self.arena.use_pos(use_id).pos;
      let tail = self.split_between(range, block_pos, use_pos);
      let kind = self.fg.def(def_id).register_kind_for_result();
      self.complete_range_of_kind(tail, kind);
    }
    self.convert_all_uses(range);

    let spill_slot = self.arena.range(range).spill_slot;
    let layout = self.opts.frame_layout;
    if matches!(spill_slot, Location::StackSlot { .. })
      && spill_slot.base_reg() == crate::location::BaseReg::Fp
      && spill_slot.stack_index() <= layout.first_local_from_fp
      && !self.is_suspend_state_parameter(def_id)
      && self.fg.def(def_id).as_constant().is_none()
    {
      // On entry the value sits in the same stack space used for spill
      // slots; reserve that slot so it is not reused while the value is
      // live. All incoming parameters are assumed tagged.
      debug_assert!(self.fg.def(def_id).is_param());
      let slot_index =
        -layout.variable_index_for_frame_slot(spill_slot.stack_index());
      debug_assert!(slot_index >= 0);
      self
        .allocate_spill_slot_for_initial_definition(slot_index as usize,
          range_end);
      self.mark_as_object_at_safepoints(range);
    }
  }

  /// Finish a definition's range: harvest safepoints and reserve a spill
  /// slot if any use demands the stack.
  pub(crate) fn complete_range_for_definition(
    &mut self,
    def_id: DefId,
    range: RangeId,
  ) {
    self.assign_safepoints(def_id, range);

    if !self.arena.range(range).has_uses_which_require_stack {
      return;
    }

    let spill_slot = self.arena.range(range).spill_slot;
    if spill_slot.is_invalid() || !spill_slot.has_stack_index() {
      self.arena.range_mut(range).spill_slot = Location::Invalid;
      self.allocate_spill_slot_for(range);
      trace!(
        "allocated spill slot for v{} which has stack-requiring uses",
        self.arena.range(range).vreg
      );
      if self.arena.range(range).representation == Representation::Tagged {
        self.mark_as_object_at_safepoints(range);
      }
    }

    // Eagerly allocate all uses requiring the stack and unlink them.
    let spill_slot = self.arena.range(range).spill_slot;
    let mut prev: Option<crate::liverange::UseId> = None;
    let mut use_pos = self.arena.range(range).first_use;
    while let Some(u) = use_pos {
      let next = self.arena.use_pos(u).next;
      let slot = self.arena.use_pos(u).slot;
      if self.fg.loc(slot) == Location::RequiresStack {
        self.convert_use_to(u, spill_slot);
        match prev {
          None => self.arena.range_mut(range).first_use = next,
          Some(p) => self.arena.set_use_next(p, next),
        }
      } else {
        prev = Some(u);
      }
      use_pos = next;
    }
  }

  // ---------------------------------------------------------------------
  // Safepoints.

  fn safepoint_pos(&self, site: SafepointSite) -> Pos {
    match site {
      SafepointSite::Instr(instr) => self.fg.instr(instr).lifetime_pos,
      SafepointSite::CatchEntry(block) => self.fg.block(block).start_pos,
    }
  }

  pub(crate) fn site_summary(&self, site: SafepointSite) -> &LocationSummary {
    match site {
      SafepointSite::Instr(instr) => &self.fg.instr(instr).summary,
      SafepointSite::CatchEntry(block) => &self.fg.block(block).entry_summary,
    }
  }

  /// Exception and stack trace parameters of a catch entry are live only
  /// after the entry; their spill slots must not be scanned if GC occurs
  /// at the catch-entry safepoint itself.
  fn is_live_after_catch_entry(
    &self,
    catch_block: BlockId,
    def_id: DefId,
  ) -> bool {
    let env_index = match &self.fg.def(def_id).kind {
      DefKind::Param { env_index, block, .. } if *block == catch_block => {
        *env_index
      }
      _ => return false,
    };
    match &self.fg.block(catch_block).entry {
      crate::ir::BlockEntry::CatchBlock {
        exception_env_index,
        stacktrace_env_index,
        ..
      } => {
        *exception_env_index == Some(env_index)
          || *stacktrace_env_index == Some(env_index)
      }
      _ => unreachable!(),
    }
  }

  /// Find all safepoints covered by the range of this definition.
  pub(crate) fn assign_safepoints(&mut self, def_id: DefId, range: RangeId) {
    let defining_instr = match &self.fg.def(def_id).kind {
      DefKind::Instr(instr) => Some(*instr),
      _ => None,
    };

    // Discover covered safepoints from the earliest one forward. They
    // were collected in reverse-construction order (descending), so walk
    // the list backwards.
    let mut covered: Vec<(Pos, SafepointSite)> = Vec::new();
    for i in (0..self.safepoints.len()).rev() {
      let site = self.safepoints[i];
      if let SafepointSite::Instr(instr) = site {
        // The value is not live until the defining instruction has fully
        // executed; its own safepoint does not belong to the range.
        if Some(instr) == defining_instr {
          continue;
        }
      }
      if let SafepointSite::CatchEntry(catch_block) = site {
        if self.is_live_after_catch_entry(catch_block, def_id) {
          continue;
        }
      }
      let pos = self.safepoint_pos(site);
      if self.arena.end(range) <= pos {
        break;
      }
      if self.arena.contains(range, pos) {
        covered.push((pos, site));
      }
    }

    let spill_is_constant = self.arena.range(range).spill_slot.is_constant();
    for (pos, site) in covered {
      if spill_is_constant {
        let summary = self.site_summary(site);
        if summary.always_calls() && !summary.callee_safe_call() {
          // Constants have a pseudo spill slot from the very beginning
          // and are never spilled across a full call; only slow-path
          // safepoints matter for them.
          continue;
        }
      }
      self.arena.add_safepoint(range, pos, site);
    }
  }
}
