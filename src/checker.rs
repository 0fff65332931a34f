/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Post-allocation validation.
//!
//! Checks the structural invariants of the finished allocation: every use
//! resolved to a concrete location and covered by a sibling, sibling
//! chains disjoint and ordered, interval and use lists ascending, no two
//! ranges sharing a register at the same position, tagged spill slots
//! present in every crossed safepoint bitmap, and quad/double spill slot
//! indices disjoint.

use crate::alloc::Allocator;
use crate::ir::Representation;
use crate::liverange::RangeId;
use crate::location::{Location, RegisterKind};
use crate::target::DOUBLE_SPILL_FACTOR;
use rustc_hash::{FxHashMap, FxHashSet};

impl<'a> Allocator<'a> {
  /// Panics if the allocation violates any invariant.
  pub fn verify(&self) {
    let mut register_coverage: FxHashMap<
      (RegisterKind, usize),
      Vec<(i32, i32)>,
    > = FxHashMap::default();

    for vreg in 0..self.vreg_count {
      let parent = match self.live_ranges[vreg] {
        Some(range) => range,
        None => continue,
      };
      self.verify_sibling_chain(parent, &mut register_coverage);
    }
    for &temp in &self.temporaries {
      self.verify_range(temp, &mut register_coverage);
    }

    // No two ranges on the same register may overlap.
    for ((kind, reg), mut intervals) in register_coverage {
      intervals.sort_unstable();
      for pair in intervals.windows(2) {
        assert!(
          pair[0].1 <= pair[1].0,
          "overlapping allocations on {:?} register {}: \
           [{}, {}) and [{}, {})",
          kind,
          reg,
          pair[0].0,
          pair[0].1,
          pair[1].0,
          pair[1].1
        );
      }
    }

    self.verify_spill_slot_disjointness();
  }

  fn verify_sibling_chain(
    &self,
    parent: RangeId,
    register_coverage: &mut FxHashMap<(RegisterKind, usize), Vec<(i32, i32)>>,
  ) {
    let mut current = Some(parent);
    while let Some(range) = current {
      let next = self.arena.range(range).next_sibling;
      if let Some(sibling) = next {
        // Siblings may touch but never overlap.
        assert!(
          self.arena.end(range) <= self.arena.start(sibling),
          "siblings of v{} overlap: [{}, {}) and [{}, {})",
          self.arena.range(range).vreg,
          self.arena.start(range),
          self.arena.end(range),
          self.arena.start(sibling),
          self.arena.end(sibling)
        );
      }
      self.verify_range(range, register_coverage);
      current = next;
    }

    // Tagged values with a stack spill slot must be visible to the GC at
    // every safepoint any sibling crosses.
    let spill_slot = self.arena.range(parent).spill_slot;
    if self.arena.range(parent).representation == Representation::Tagged
      && spill_slot.has_stack_index()
      && spill_slot.base_reg() == crate::location::BaseReg::Fp
    {
      let stack_index = -self
        .opts
        .frame_layout
        .variable_index_for_frame_slot(spill_slot.stack_index());
      assert!(stack_index >= 0);
      let mut current = Some(parent);
      while let Some(range) = current {
        let mut safepoint = self.arena.range(range).first_safepoint;
        while let Some(sp) = safepoint {
          let site = self.arena.safepoint(sp).site;
          let bitmap = &self.site_summary(site).stack_bitmap;
          assert!(
            bitmap.contains_checked(stack_index as usize),
            "v{}: tagged spill slot {} not marked at safepoint {}",
            self.arena.range(parent).vreg,
            stack_index,
            self.arena.safepoint(sp).pos
          );
          safepoint = self.arena.safepoint(sp).next;
        }
        current = self.arena.range(range).next_sibling;
      }
    }
  }

  fn verify_range(
    &self,
    range: RangeId,
    register_coverage: &mut FxHashMap<(RegisterKind, usize), Vec<(i32, i32)>>,
  ) {
    if self.arena.range(range).first_interval.is_none() {
      return;
    }
    if self.arena.start(range) == self.arena.end(range) {
      // Fixed-output definitions whose only use immediately followed
      // degenerate to an empty range and are never allocated.
      return;
    }
    let vreg = self.arena.range(range).vreg;
    let location =
      self.fg.loc(self.arena.range(range).assigned_location_slot);

    // Interval list ascending and non-overlapping.
    let mut interval = self.arena.range(range).first_interval;
    let mut prev_end = None;
    while let Some(i) = interval {
      let (start, end) =
        (self.arena.interval(i).start, self.arena.interval(i).end);
      assert!(start < end, "v{}: empty interval [{}, {})", vreg, start, end);
      if let Some(prev_end) = prev_end {
        assert!(
          prev_end <= start,
          "v{}: intervals out of order around {}",
          vreg,
          start
        );
      }
      prev_end = Some(end);
      if location.is_machine_register() {
        register_coverage
          .entry((location.register_kind(), location.register_code()))
          .or_default()
          .push((start, end));
      }
      interval = self.arena.interval(i).next;
    }

    // Use list ascending, inside the range, and fully resolved.
    let mut use_pos = self.arena.range(range).first_use;
    let mut prev_pos = None;
    while let Some(u) = use_pos {
      let pos = self.arena.use_pos(u).pos;
      if let Some(prev_pos) = prev_pos {
        assert!(prev_pos <= pos, "v{}: uses out of order at {}", vreg, pos);
      }
      prev_pos = Some(pos);
      assert!(
        self.arena.start(range) <= pos && pos <= self.arena.end(range),
        "v{}: use at {} outside [{}, {})",
        vreg,
        pos,
        self.arena.start(range),
        self.arena.end(range)
      );
      let loc = self.fg.loc(self.arena.use_pos(u).slot);
      assert!(
        !loc.is_invalid() && !loc.is_unallocated(),
        "v{}: use at {} not allocated ({:?})",
        vreg,
        pos,
        loc
      );
      use_pos = self.arena.use_pos(u).next;
    }

    if vreg >= 0 {
      assert!(
        !location.is_invalid(),
        "v{}: range [{}, {}) has no location",
        vreg,
        self.arena.start(range),
        self.arena.end(range)
      );
    }
  }

  /// Double and quad spill slots never share a double-slot index.
  fn verify_spill_slot_disjointness(&self) {
    let layout = self.opts.frame_layout;
    let mut double_slots = FxHashSet::default();
    let mut quad_slots = FxHashSet::default();

    for vreg in 0..self.vreg_count {
      let parent = match self.live_ranges[vreg] {
        Some(range) => range,
        None => continue,
      };
      let spill_slot = self.arena.range(parent).spill_slot;
      let variable_index = match spill_slot {
        Location::DoubleStackSlot { index, .. } => {
          let v = -layout.variable_index_for_frame_slot(index);
          double_slots.insert(
            (v as usize - self.cpu_spill_slot_count) / DOUBLE_SPILL_FACTOR,
          );
          continue;
        }
        Location::QuadStackSlot { index, .. } => {
          -layout.variable_index_for_frame_slot(index)
        }
        _ => continue,
      };
      // A quad occupies two consecutive double-slot indices, addressed by
      // the higher one.
      let high =
        (variable_index as usize - self.cpu_spill_slot_count)
          / DOUBLE_SPILL_FACTOR;
      quad_slots.insert(high);
      quad_slots.insert(high - 1);
    }

    for slot in &double_slots {
      assert!(
        !quad_slots.contains(slot),
        "double spill slot {} overlaps a quad slot",
        slot
      );
    }
  }
}
