/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The priority-driven allocation loop.
//!
//! Ranges are popped in ascending start order. Each first tries a free
//! register (hinted one first), then falls back to evicting interfering
//! ranges from the register that stays free the longest, splitting and
//! spilling as needed.

use crate::bitset::BitSet;
use crate::ir::{DefId, DefKind, Pos, Vreg, NO_VREG};
use crate::liverange::{
  first_intersection, to_instruction_start, RangeId, MAX_POSITION,
};
use crate::location::Location;
use crate::target::REGISTER_ALLOCATION_BIAS;
use log::trace;

use super::{min_position, Allocator};

impl<'a> Allocator<'a> {
  /// First intersection between the unallocated range and the ranges
  /// currently allocated to the given register.
  fn first_intersection_with_allocated(
    &self,
    reg: usize,
    unallocated: RangeId,
  ) -> Pos {
    let mut intersection = MAX_POSITION;
    for i in 0..self.registers[reg].len() {
      let allocated = self.registers[reg][i];
      let allocated_head = self
        .arena
        .first_pending_interval(allocated)
        .expect("expired ranges are removed from the register list");
      if self.arena.interval(allocated_head).start >= intersection {
        continue;
      }
      let pos = first_intersection(
        &self.arena,
        self.arena.first_pending_interval(unallocated),
        Some(allocated_head),
      );
      if pos < intersection {
        intersection = pos;
      }
    }
    intersection
  }

  // ---------------------------------------------------------------------
  // Reaching definitions for phis, computed lazily.

  fn reaching_defs_contains(&mut self, phi: DefId, vreg: Vreg) -> bool {
    self.reaching_defs_ensure(phi);
    match &self.fg.def(phi).kind {
      DefKind::Phi { reaching_defs: Some(set), .. } => {
        set.contains(vreg as usize)
      }
      _ => unreachable!(),
    }
  }

  fn reaching_defs_ensure(&mut self, phi: DefId) {
    let computed = matches!(
      &self.fg.def(phi).kind,
      DefKind::Phi { reaching_defs: Some(_), .. }
    );
    if computed {
      return;
    }
    debug_assert!(self.reaching_defs_worklist.is_empty());
    self.reaching_defs_add_phi(phi);
    self.reaching_defs_compute();
  }

  fn reaching_defs_add_phi(&mut self, phi: DefId) {
    let inputs = match &self.fg.def(phi).kind {
      DefKind::Phi { inputs, reaching_defs, .. } => {
        if reaching_defs.is_some() {
          return;
        }
        inputs.clone()
      }
      _ => unreachable!(),
    };

    // Seed with the immediate inputs.
    let is_pair = self.fg.def(phi).has_pair_representation();
    let mut set = BitSet::new(self.fg.max_vreg);
    let mut depends_on_phi = false;
    for &input in &inputs {
      if self.fg.def(input).is_phi() {
        depends_on_phi = true;
      }
      set.add(self.fg.def(input).vreg as usize);
      if is_pair {
        set.add(self.fg.def(input).second_vreg as usize);
      }
    }
    match &mut self.fg.def_mut(phi).kind {
      DefKind::Phi { reaching_defs, .. } => *reaching_defs = Some(set),
      _ => unreachable!(),
    }

    // A phi depending on another phi needs fixed point iteration.
    if depends_on_phi {
      self.reaching_defs_worklist.push(phi);
    }
  }

  fn reaching_defs_compute(&mut self) {
    // Transitively collect all phis feeding the collected phis.
    let mut i = 0;
    while i < self.reaching_defs_worklist.len() {
      let phi = self.reaching_defs_worklist[i];
      let inputs = self.fg.def(phi).as_phi().unwrap().clone();
      for input in inputs {
        if self.fg.def(input).is_phi() {
          self.reaching_defs_add_phi(input);
        }
      }
      i += 1;
    }

    // Propagate until a fixed point is reached.
    let mut changed = true;
    while changed {
      changed = false;
      for i in 0..self.reaching_defs_worklist.len() {
        let phi = self.reaching_defs_worklist[i];
        let inputs = self.fg.def(phi).as_phi().unwrap().clone();
        for input in inputs {
          if !self.fg.def(input).is_phi() {
            continue;
          }
          let input_set = match &self.fg.def(input).kind {
            DefKind::Phi { reaching_defs: Some(set), .. } => set.clone(),
            _ => unreachable!(),
          };
          let phi_set = match &mut self.fg.def_mut(phi).kind {
            DefKind::Phi { reaching_defs: Some(set), .. } => set,
            _ => unreachable!(),
          };
          if phi_set.add_all(&input_set) {
            changed = true;
          }
        }
      }
    }

    self.reaching_defs_worklist.clear();
  }

  // ---------------------------------------------------------------------
  // Free register allocation.

  pub(crate) fn allocate_free_register(&mut self, unallocated: RangeId) -> bool {
    let mut candidate: Option<usize> = None;
    let mut free_until: Pos = 0;

    // If a hint is available try it first.
    let mut hint = self.arena.first_hint(unallocated, &self.fg.loc_slots);

    // Incoming register parameters are assigned directly rather than
    // through a prefilled parallel move, so no hinted use exists for
    // their split tail; inherit the parent's register to avoid picking a
    // random free one.
    let unallocated_vreg = self.arena.range(unallocated).vreg;
    let unallocated_start = self.arena.start(unallocated);
    if !hint.is_machine_register() && unallocated_vreg >= 0 {
      let parent = self.get_live_range(unallocated_vreg);
      if self.arena.end(parent) == unallocated_start
        && !self.is_block_entry(unallocated_start)
        && self.assigned_loc(parent).is_machine_register()
      {
        hint = self.assigned_loc(parent);
      }
    }

    if hint.is_machine_register() {
      if !self.blocked_registers[hint.register_code()] {
        free_until = self
          .first_intersection_with_allocated(hint.register_code(), unallocated);
        candidate = Some(hint.register_code());
      }
      trace!(
        "found hint {:?} for v{}: free until {}",
        hint,
        unallocated_vreg,
        free_until
      );
    } else {
      for i in 0..self.number_of_registers {
        let reg =
          (i + REGISTER_ALLOCATION_BIAS) % self.number_of_registers;
        if !self.blocked_registers[reg] && self.registers[reg].is_empty() {
          candidate = Some(reg);
          free_until = MAX_POSITION;
          break;
        }
      }
    }

    if free_until != MAX_POSITION {
      for i in 0..self.number_of_registers {
        let reg =
          (i + REGISTER_ALLOCATION_BIAS) % self.number_of_registers;
        if self.blocked_registers[reg] || Some(reg) == candidate {
          continue;
        }
        let intersection =
          self.first_intersection_with_allocated(reg, unallocated);
        if intersection > free_until {
          candidate = Some(reg);
          free_until = intersection;
          if free_until == MAX_POSITION {
            break;
          }
        }
      }
    }

    // All registers are blocked by active ranges.
    if free_until <= unallocated_start {
      return false;
    }

    // We have a good candidate. If inside a loop, try to reduce the
    // number of moves on the back edge by picking a register that does
    // not interfere with the back-edge phi moves.
    let loop_id =
      self.fg.block(self.block_entry_at(unallocated_start)).loop_id;
    if let Some(lid) = loop_id {
      let candidate_interferes = unallocated_vreg >= 0
        && free_until >= self.extra_loop_info[lid].end
        && self.extra_loop_info[lid]
          .backedge_interference
          .as_ref()
          .map_or(false, |set| set.contains(unallocated_vreg as usize));
      if candidate_interferes {
        let mut used_on_backedge = vec![false; self.number_of_registers];
        let header = self.fg.loops[lid].header;
        let phis = self.fg.block(header).phis().to_vec();
        for phi in phis {
          let phi_vreg = self.fg.def(phi).vreg;
          let range = self.get_live_range(phi_vreg);
          let loc = self.assigned_loc(range);
          if loc.is_machine_register()
            && loc.register_kind() == self.register_kind
            && !self.reaching_defs_contains(phi, unallocated_vreg)
          {
            used_on_backedge[loc.register_code()] = true;
          }
          if self.fg.def(phi).has_pair_representation() {
            let second_vreg = self.fg.def(phi).second_vreg;
            let second_range = self.get_live_range(second_vreg);
            let loc = self.assigned_loc(second_range);
            if loc.is_machine_register()
              && loc.register_kind() == self.register_kind
              && !self.reaching_defs_contains(phi, unallocated_vreg)
            {
              used_on_backedge[loc.register_code()] = true;
            }
          }
        }

        if used_on_backedge[candidate.unwrap()] {
          trace!(
            "considering {:?} for v{}: has interference on the back edge \
             (loop [{}, {}))",
            self.make_register_location(candidate.unwrap()),
            unallocated_vreg,
            self.extra_loop_info[lid].start,
            self.extra_loop_info[lid].end
          );
          for i in 0..self.number_of_registers {
            let reg =
              (i + REGISTER_ALLOCATION_BIAS) % self.number_of_registers;
            if self.blocked_registers[reg]
              || Some(reg) == candidate
              || used_on_backedge[reg]
            {
              continue;
            }
            let intersection =
              self.first_intersection_with_allocated(reg, unallocated);
            if intersection >= free_until {
              candidate = Some(reg);
              free_until = intersection;
              trace!(
                "found {:?} for v{} with no interference on the back edge",
                self.make_register_location(reg),
                unallocated_vreg
              );
              break;
            }
          }
        }
      }
    }

    if free_until != MAX_POSITION {
      // There was an intersection; keep the prefix and retry the tail.
      trace!("  splitting at {}", free_until);
      let slot = self.fg.new_slot(Location::Invalid);
      let tail = self.arena.split_at(unallocated, free_until, slot);
      self.add_to_unallocated(tail);

      // A constant prefix without uses does not need the register.
      if self.arena.range(unallocated).first_use.is_none()
        && unallocated_vreg >= 0
      {
        let parent = self.get_live_range(unallocated_vreg);
        if self.arena.range(parent).spill_slot.is_constant() {
          self.spill(unallocated);
          return true;
        }
      }
    }

    let candidate = candidate.unwrap();
    trace!(
      "  assigning free register {:?} to v{}",
      self.make_register_location(candidate),
      unallocated_vreg
    );
    self.registers[candidate].push(unallocated);
    let loc = self.make_register_location(candidate);
    self.set_assigned_loc(unallocated, loc);
    true
  }

  // ---------------------------------------------------------------------
  // Loop phi eviction heuristic.

  fn range_has_only_unconstrained_uses_in_loop(
    &mut self,
    range: RangeId,
    loop_id: usize,
  ) -> bool {
    let vreg = self.arena.range(range).vreg;
    if vreg >= 0 {
      let parent = self.get_live_range(vreg);
      self.arena.range(parent).has_only_unconstrained_uses_in_loop(loop_id)
    } else {
      false
    }
  }

  fn is_cheap_to_evict_register_in_loop(
    &mut self,
    loop_id: usize,
    reg: usize,
  ) -> bool {
    let loop_start = self.extra_loop_info[loop_id].start;
    let loop_end = self.extra_loop_info[loop_id].end;

    for i in 0..self.registers[reg].len() {
      let allocated = self.registers[reg][i];
      let interval = self.arena.first_pending_interval(allocated).unwrap();
      if self.arena.interval(interval).contains(loop_start) {
        if !self.range_has_only_unconstrained_uses_in_loop(allocated, loop_id)
        {
          return false;
        }
      } else if self.arena.interval(interval).start < loop_end {
        return false;
      }
    }
    true
  }

  /// A loop phi is worth a register even without register uses if some
  /// register is only held by ranges that can be spilled for free within
  /// the loop. Spilling the phi itself would put memory operations on the
  /// back edge.
  fn has_cheap_eviction_candidate(&mut self, phi_range: RangeId) -> bool {
    debug_assert!(self.arena.range(phi_range).is_loop_phi);

    let header = self.block_entry_at(self.arena.start(phi_range));
    debug_assert!(self.fg.is_loop_header(header));
    debug_assert_eq!(
      self.arena.start(phi_range),
      self.fg.block(header).start_pos
    );
    let loop_id = self.fg.block(header).loop_id.unwrap();

    for reg in 0..self.number_of_registers {
      if self.blocked_registers[reg] {
        continue;
      }
      if self.is_cheap_to_evict_register_in_loop(loop_id, reg) {
        return true;
      }
    }
    false
  }

  // ---------------------------------------------------------------------
  // Blocked register allocation.

  pub(crate) fn allocate_any_register(&mut self, unallocated: RangeId) {
    let unallocated_start = self.arena.start(unallocated);
    let register_use = self.arena.first_register_use(
      unallocated,
      unallocated_start,
      &self.fg.loc_slots,
    );
    if register_use.is_none()
      && !(self.arena.range(unallocated).is_loop_phi
        && self.has_cheap_eviction_candidate(unallocated))
    {
      self.spill(unallocated);
      return;
    }

    let mut candidate: Option<usize> = None;
    let mut free_until: Pos = 0;
    let mut blocked_at: Pos = MAX_POSITION;

    for i in 0..self.number_of_registers {
      let reg = (i + REGISTER_ALLOCATION_BIAS) % self.number_of_registers;
      if self.blocked_registers[reg] {
        continue;
      }
      if self.update_free_until(reg, unallocated, &mut free_until,
        &mut blocked_at)
      {
        candidate = Some(reg);
      }
    }

    let register_use_pos = match register_use {
      Some(use_id) => self.arena.use_pos(use_id).pos,
      None => unallocated_start,
    };
    if free_until < register_use_pos {
      // Can't acquire a free register; spill until one is really needed.
      debug_assert!(
        unallocated_start < to_instruction_start(register_use_pos)
      );
      self.spill_between(unallocated, unallocated_start, register_use_pos);
      return;
    }

    let candidate = candidate.expect("some register must be allocatable");
    trace!(
      "assigning blocked register {:?} to v{} until {}",
      self.make_register_location(candidate),
      self.arena.range(unallocated).vreg,
      blocked_at
    );

    if blocked_at < self.arena.end(unallocated) {
      // The register is blocked before the range ends; split at the
      // latest at the blocking position.
      let tail =
        self.split_between(unallocated, unallocated_start, blocked_at + 1);
      self.add_to_unallocated(tail);
    }

    self.assign_non_free_register(unallocated, candidate);
  }

  /// Compute how long the register stays usable for the unallocated
  /// range, considering both active and inactive allocated ranges.
  /// Returns true (and updates the running maximum) if this register is
  /// better than the best seen so far.
  fn update_free_until(
    &mut self,
    reg: usize,
    unallocated: RangeId,
    cur_free_until: &mut Pos,
    cur_blocked_at: &mut Pos,
  ) -> bool {
    let mut free_until = MAX_POSITION;
    let mut blocked_at = MAX_POSITION;
    let start = self.arena.start(unallocated);

    for i in 0..self.registers[reg].len() {
      let allocated = self.registers[reg][i];
      let first_pending = self.arena.first_pending_interval(allocated).unwrap();

      if self.arena.interval(first_pending).contains(start) {
        // Active interval.
        if self.arena.range(allocated).vreg < 0 {
          // Blocked by a range that cannot be spilled.
          return false;
        }
        let interfering = self.arena.first_interfering_use(
          allocated,
          start,
          &self.fg.loc_slots,
        );
        if let Some(use_id) = interfering {
          let use_pos = self.arena.use_pos(use_id).pos;
          if to_instruction_start(use_pos) - start <= 1 {
            // Used as a register by the current instruction; cannot be
            // evicted here.
            return false;
          }
        }
        let use_pos = match interfering {
          Some(use_id) => self.arena.use_pos(use_id).pos,
          None => self.arena.end(allocated),
        };
        if use_pos < free_until {
          free_until = use_pos;
        }
      } else {
        // Inactive interval.
        let intersection = first_intersection(
          &self.arena,
          Some(first_pending),
          self.arena.range(unallocated).first_interval,
        );
        if intersection != MAX_POSITION {
          if intersection < free_until {
            free_until = intersection;
          }
          if self.arena.range(allocated).vreg == NO_VREG {
            blocked_at = intersection;
          }
        }
      }

      if free_until <= *cur_free_until {
        return false;
      }
    }

    debug_assert!(free_until > *cur_free_until);
    *cur_free_until = free_until;
    *cur_blocked_at = blocked_at;
    true
  }

  /// Assign a non-free register, evicting every interfering allocated
  /// range by splitting and spilling pieces of it.
  fn assign_non_free_register(&mut self, unallocated: RangeId, reg: usize) {
    let list = std::mem::take(&mut self.registers[reg]);
    let mut kept = Vec::with_capacity(list.len() + 1);
    for allocated in list {
      if self.arena.range(allocated).vreg < 0 {
        // Can't be evicted.
        kept.push(allocated);
        continue;
      }
      if self.evict_intersection(allocated, unallocated) {
        // If the evicted range was not spilled in place, convert its
        // remaining uses to the register it keeps.
        if self.assigned_loc(allocated).is_machine_register() {
          debug_assert!(
            self.arena.end(allocated) <= self.arena.start(unallocated)
          );
          self.convert_all_uses(allocated);
        }
      } else {
        kept.push(allocated);
      }
    }
    kept.push(unallocated);
    self.registers[reg] = kept;
    let loc = self.make_register_location(reg);
    self.set_assigned_loc(unallocated, loc);
  }

  fn evict_intersection(
    &mut self,
    allocated: RangeId,
    unallocated: RangeId,
  ) -> bool {
    let first_unallocated =
      self.arena.first_pending_interval(unallocated).unwrap();
    let intersection = first_intersection(
      &self.arena,
      self.arena.first_pending_interval(allocated),
      Some(first_unallocated),
    );
    if intersection == MAX_POSITION {
      return false;
    }

    let spill_position = self.arena.interval(first_unallocated).start;
    let interfering = self.arena.first_interfering_use(
      allocated,
      spill_position,
      &self.fg.loc_slots,
    );
    match interfering {
      None => {
        // No register uses after this point.
        self.spill_after(allocated, spill_position);
      }
      Some(use_id) => {
        let use_pos = self.arena.use_pos(use_id).pos;
        let restore_position = if spill_position < intersection {
          min_position(intersection, use_pos)
        } else {
          use_pos
        };
        self.spill_between(allocated, spill_position, restore_position);
      }
    }
    true
  }

  // ---------------------------------------------------------------------
  // Splitting and spilling.

  /// Split `range` somewhere in `[from, to)`. When the interval spans
  /// several blocks, split at the start of the outermost loop header that
  /// contains `to` but starts after `from`; cutting a loop in the middle
  /// would disconnect the loop prefix from the blocks that follow and
  /// multiply resolution moves.
  pub(crate) fn split_between(
    &mut self,
    range: RangeId,
    from: Pos,
    to: Pos,
  ) -> RangeId {
    trace!(
      "split v{} [{}, {}) between [{}, {})",
      self.arena.range(range).vreg,
      self.arena.start(range),
      self.arena.end(range),
      from,
      to
    );

    let mut split_block_entry = self.block_entry_at(to);
    let split_pos;
    if from < self.fg.block(split_block_entry).start_pos {
      // [from, to) spans multiple blocks.
      let mut loop_id = self.fg.block(split_block_entry).loop_id;
      if loop_id.is_none() {
        // `to` may linearly sit between a loop's blocks without belonging
        // to the natural loop; treat it as part of that loop anyway.
        for i in 0..self.fg.loops.len() {
          if self.extra_loop_info[i].start < to
            && to < self.extra_loop_info[i].end
          {
            loop_id = Some(i);
            break;
          }
        }
      }
      while let Some(lid) = loop_id {
        let header = self.fg.loops[lid].header;
        if from >= self.fg.block(header).start_pos {
          break;
        }
        split_block_entry = header;
        loop_id = self.fg.loops[lid].outer;
        trace!(
          "  move back to loop header {:?} at {}",
          split_block_entry,
          self.fg.block(split_block_entry).start_pos
        );
      }
      split_pos = self.fg.block(split_block_entry).start_pos;
    } else {
      // [from, to) is contained inside a single block; split at the end
      // of the instruction preceding `to`.
      split_pos = to_instruction_start(to) - 1;
    }

    debug_assert!(from < split_pos);

    let slot = self.fg.new_slot(Location::Invalid);
    self.arena.split_at(range, split_pos, slot)
  }

  /// Spill the range from `from` until some position preceding `to`,
  /// re-queueing the tail that still wants a register.
  pub(crate) fn spill_between(&mut self, range: RangeId, from: Pos, to: Pos) {
    debug_assert!(from < to);
    trace!(
      "spill v{} [{}, {}) between [{}, {})",
      self.arena.range(range).vreg,
      self.arena.start(range),
      self.arena.end(range),
      from,
      to
    );
    let slot = self.fg.new_slot(Location::Invalid);
    let tail = self.arena.split_at(range, from, slot);

    if self.arena.start(tail) < to {
      let tail_start = self.arena.start(tail);
      let tail_tail = self.split_between(tail, tail_start, to);
      self.spill(tail);
      self.add_to_unallocated(tail_tail);
    } else {
      // The tail lies entirely after [from, to).
      self.add_to_unallocated(tail);
    }
  }

  /// Spill the range from `from` onwards. A spill inside a loop is moved
  /// up to the loop header when the loop only has unconstrained uses.
  pub(crate) fn spill_after(&mut self, range: RangeId, from: Pos) {
    trace!(
      "spill v{} [{}, {}) after {}",
      self.arena.range(range).vreg,
      self.arena.start(range),
      self.arena.end(range),
      from
    );

    let mut from = from;
    if let Some(lid) = self.fg.block(self.block_entry_at(from)).loop_id {
      let header = self.fg.loops[lid].header;
      let header_start = self.fg.block(header).start_pos;
      if self.arena.start(range) <= header_start
        && self.range_has_only_unconstrained_uses_in_loop(range, lid)
      {
        debug_assert!(header_start <= from);
        from = header_start;
        trace!("  moved spill position to loop header {}", from);
      }
    }

    let slot = self.fg.new_slot(Location::Invalid);
    let tail = self.arena.split_at(range, from, slot);
    self.spill(tail);
  }
}
