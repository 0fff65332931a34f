/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Live ranges and their building blocks.
//!
//! A [`LiveRange`] is a list of non-overlapping [`UseInterval`]s plus a
//! list of [`UsePosition`]s falling inside them, both ascending. Ranges,
//! intervals, uses and safepoints all live in one [`RangeArena`] and refer
//! to each other by index, which keeps the sibling chains and the shared
//! location slots free of ownership cycles.

use crate::ir::{Pos, Representation, SafepointSite, Vreg, NO_VREG};
use crate::location::{Location, SlotId};
use log::trace;

pub const ILLEGAL_POSITION: Pos = -1;
pub const MAX_POSITION: Pos = 0x7FFF_FFFF;

pub fn is_instruction_start_position(pos: Pos) -> bool {
  (pos & 1) == 0
}

pub fn is_instruction_end_position(pos: Pos) -> bool {
  (pos & 1) == 1
}

pub fn to_instruction_start(pos: Pos) -> Pos {
  pos & !1
}

pub fn to_instruction_end(pos: Pos) -> Pos {
  pos | 1
}

macro_rules! arena_id {
  ($name:ident, $prefix:expr) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct $name(pub u32);

    impl $name {
      fn index(self) -> usize {
        self.0 as usize
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}{}", $prefix, self.0)
      }
    }
  };
}

arena_id!(RangeId, "lr");
arena_id!(IntervalId, "ui");
arena_id!(UseId, "up");
arena_id!(SafepointId, "sp");

/// Holeless half-open interval of liveness `[start, end)`.
pub struct UseInterval {
  pub start: Pos,
  pub end: Pos,
  pub next: Option<IntervalId>,
}

impl UseInterval {
  pub fn contains(&self, pos: Pos) -> bool {
    self.start <= pos && pos < self.end
  }

  /// Smallest position covered by both intervals, or `ILLEGAL_POSITION`.
  pub fn intersect(&self, other: &UseInterval) -> Pos {
    if self.start <= other.start {
      if other.start < self.end {
        return other.start;
      }
    } else if self.start < other.end {
      return self.start;
    }
    ILLEGAL_POSITION
  }
}

/// A single mention of an SSA value. `slot` points into the mentioning
/// instruction's location summary; the allocator writes the final location
/// through it. `hint` optionally names another slot whose current value the
/// allocator should prefer.
pub struct UsePosition {
  pub pos: Pos,
  pub slot: SlotId,
  pub hint: Option<SlotId>,
  pub next: Option<UseId>,
}

/// A safepoint crossed by a live range, recorded at an end position.
pub struct SafepointPosition {
  pub pos: Pos,
  pub site: SafepointSite,
  pub next: Option<SafepointId>,
}

/// Cache of the allocator's current position inside one live range.
/// Advanced monotonically; never moves backwards.
#[derive(Default)]
pub struct AllocationFinger {
  pub first_pending_use_interval: Option<IntervalId>,
  pub first_register_use: Option<UseId>,
  pub first_register_beneficial_use: Option<UseId>,
  pub first_hinted_use: Option<UseId>,
}

pub struct LiveRange {
  pub vreg: Vreg,
  pub representation: Representation,
  /// Arena slot holding the assigned location; hints reference it before
  /// it is filled in.
  pub assigned_location_slot: SlotId,
  pub spill_slot: Location,
  pub first_use: Option<UseId>,
  pub first_interval: Option<IntervalId>,
  pub last_interval: Option<IntervalId>,
  pub first_safepoint: Option<SafepointId>,
  pub last_safepoint: Option<SafepointId>,
  pub next_sibling: Option<RangeId>,
  /// Bit per loop id: the range has only unconstrained uses within that
  /// loop, so spilling it there is free.
  pub has_only_any_uses_in_loops: u64,
  pub is_loop_phi: bool,
  pub has_uses_which_require_stack: bool,
  pub finger: AllocationFinger,
}

const MAX_TRACKED_LOOPS: usize = 64;

impl LiveRange {
  pub fn has_only_unconstrained_uses_in_loop(&self, loop_id: usize) -> bool {
    if loop_id < MAX_TRACKED_LOOPS {
      self.has_only_any_uses_in_loops & (1u64 << loop_id) != 0
    } else {
      false
    }
  }

  pub fn mark_has_only_unconstrained_uses_in_loop(&mut self, loop_id: usize) {
    if loop_id < MAX_TRACKED_LOOPS {
      self.has_only_any_uses_in_loops |= 1u64 << loop_id;
    }
  }
}

pub struct RangeArena {
  pub ranges: Vec<LiveRange>,
  pub intervals: Vec<UseInterval>,
  pub uses: Vec<UsePosition>,
  pub safepoints: Vec<SafepointPosition>,
}

impl RangeArena {
  pub fn new() -> Self {
    Self {
      ranges: Vec::new(),
      intervals: Vec::new(),
      uses: Vec::new(),
      safepoints: Vec::new(),
    }
  }

  pub fn new_range(
    &mut self,
    vreg: Vreg,
    representation: Representation,
    assigned_location_slot: SlotId,
  ) -> RangeId {
    let id = RangeId(self.ranges.len() as u32);
    self.ranges.push(LiveRange {
      vreg,
      representation,
      assigned_location_slot,
      spill_slot: Location::Invalid,
      first_use: None,
      first_interval: None,
      last_interval: None,
      first_safepoint: None,
      last_safepoint: None,
      next_sibling: None,
      has_only_any_uses_in_loops: 0,
      is_loop_phi: false,
      has_uses_which_require_stack: false,
      finger: AllocationFinger::default(),
    });
    id
  }

  pub fn range(&self, id: RangeId) -> &LiveRange {
    &self.ranges[id.index()]
  }

  pub fn range_mut(&mut self, id: RangeId) -> &mut LiveRange {
    &mut self.ranges[id.index()]
  }

  pub fn interval(&self, id: IntervalId) -> &UseInterval {
    &self.intervals[id.index()]
  }

  pub fn use_pos(&self, id: UseId) -> &UsePosition {
    &self.uses[id.index()]
  }

  pub fn safepoint(&self, id: SafepointId) -> &SafepointPosition {
    &self.safepoints[id.index()]
  }

  pub fn start(&self, id: RangeId) -> Pos {
    self.interval(self.range(id).first_interval.unwrap()).start
  }

  pub fn end(&self, id: RangeId) -> Pos {
    self.interval(self.range(id).last_interval.unwrap()).end
  }

  /// Fast conservative containment check; may return true for positions
  /// inside a lifetime hole.
  pub fn can_cover(&self, id: RangeId, pos: Pos) -> bool {
    self.range(id).first_interval.is_some()
      && self.start(id) <= pos
      && pos < self.end(id)
  }

  pub fn contains(&self, id: RangeId, pos: Pos) -> bool {
    if !self.can_cover(id, pos) {
      return false;
    }
    let mut interval = self.range(id).first_interval;
    while let Some(i) = interval {
      if self.interval(i).contains(pos) {
        return true;
      }
      interval = self.interval(i).next;
    }
    false
  }

  /// Add a use at `pos` writing through `slot`. Uses are almost always
  /// prepended (construction walks instructions backwards); an instruction
  /// using the same value both as a fixed input (at `pos - 1`) and as a
  /// normal input (at `pos + 1`) inserts mid-list.
  pub fn add_use(&mut self, id: RangeId, pos: Pos, slot: SlotId) -> UseId {
    let first_interval = self.range(id).first_interval.unwrap();
    debug_assert!(self.interval(first_interval).start <= pos);
    debug_assert!(pos <= self.interval(first_interval).end);

    if let Some(first) = self.range(id).first_use {
      let first_pos = self.use_pos(first).pos;
      if first_pos == pos && self.use_pos(first).slot == slot {
        return first;
      } else if first_pos < pos {
        let mut insert_after = first;
        while let Some(next) = self.use_pos(insert_after).next {
          if self.use_pos(next).pos >= pos {
            break;
          }
          insert_after = next;
        }

        let mut insert_before = self.use_pos(insert_after).next;
        while let Some(before) = insert_before {
          if self.use_pos(before).pos != pos {
            break;
          }
          if self.use_pos(before).slot == slot {
            return before;
          }
          insert_before = self.use_pos(before).next;
        }

        let next = self.use_pos(insert_after).next;
        let new_use = self.push_use(pos, slot, next);
        self.uses[insert_after.index()].next = Some(new_use);
        return new_use;
      }
    }

    let next = self.range(id).first_use;
    let new_use = self.push_use(pos, slot, next);
    self.range_mut(id).first_use = Some(new_use);
    new_use
  }

  pub fn add_hinted_use(
    &mut self,
    id: RangeId,
    pos: Pos,
    slot: SlotId,
    hint: SlotId,
  ) {
    let use_id = self.add_use(id, pos, slot);
    self.uses[use_id.index()].hint = Some(hint);
  }

  pub fn set_use_next(&mut self, use_id: UseId, next: Option<UseId>) {
    self.uses[use_id.index()].next = next;
  }

  fn push_use(&mut self, pos: Pos, slot: SlotId, next: Option<UseId>) -> UseId {
    let id = UseId(self.uses.len() as u32);
    self.uses.push(UsePosition { pos, slot, hint: None, next });
    id
  }

  /// Prepend-or-merge an interval. Construction visits instructions in
  /// reverse order, so additions arrive with monotonically decreasing
  /// starts; touching intervals are merged into the first one.
  pub fn add_use_interval(&mut self, id: RangeId, start: Pos, end: Pos) {
    debug_assert!(start < end);

    if let Some(first) = self.range(id).first_interval {
      let first_start = self.interval(first).start;
      let first_end = self.interval(first).end;
      if start > first_start {
        // Only register-blocking ranges revisit covered positions.
        debug_assert!(self.range(id).vreg == NO_VREG);
        debug_assert!(end <= first_end);
        return;
      } else if start == first_start {
        if end <= first_end {
          return;
        }
        self.intervals[first.index()].end = end;
        return;
      } else if end == first_start {
        self.intervals[first.index()].start = start;
        return;
      } else if end == first_end {
        debug_assert!(start < first_start);
        self.intervals[first.index()].start = start;
        return;
      }
      debug_assert!(end < first_start);
    }

    let next = self.range(id).first_interval;
    let interval = IntervalId(self.intervals.len() as u32);
    self.intervals.push(UseInterval { start, end, next });
    let range = self.range_mut(id);
    range.first_interval = Some(interval);
    if range.last_interval.is_none() {
      range.last_interval = Some(interval);
    }
  }

  /// Shrink the optimistically block-wide first interval down to the
  /// definition point, or create a degenerate `[pos, pos + 1)` interval
  /// for a definition without uses.
  pub fn define_at(&mut self, id: RangeId, pos: Pos) {
    match self.range(id).first_interval {
      None => {
        let interval = IntervalId(self.intervals.len() as u32);
        self.intervals.push(UseInterval { start: pos, end: pos + 1, next: None });
        let range = self.range_mut(id);
        range.first_interval = Some(interval);
        range.last_interval = Some(interval);
      }
      Some(first) => {
        debug_assert!(self.interval(first).start <= pos);
        self.intervals[first.index()].start = pos;
      }
    }
  }

  /// Record a safepoint this range crosses. Safepoints are discovered in
  /// ascending order.
  pub fn add_safepoint(&mut self, id: RangeId, pos: Pos, site: SafepointSite) {
    debug_assert!(is_instruction_start_position(pos));
    let safepoint = SafepointId(self.safepoints.len() as u32);
    self.safepoints.push(SafepointPosition {
      pos: to_instruction_end(pos),
      site,
      next: None,
    });

    let range = self.range_mut(id);
    match range.last_safepoint {
      None => {
        debug_assert!(range.first_safepoint.is_none());
        range.first_safepoint = Some(safepoint);
        range.last_safepoint = Some(safepoint);
      }
      Some(last) => {
        range.last_safepoint = Some(safepoint);
        debug_assert!(self.safepoints[last.index()].pos < pos);
        self.safepoints[last.index()].next = Some(safepoint);
      }
    }
  }

  /// Split the range at `split_pos`, detaching the uses and safepoints at
  /// or after it into a new sibling. Returns the sibling (or the range
  /// itself when the split position is its start).
  pub fn split_at(
    &mut self,
    id: RangeId,
    split_pos: Pos,
    sibling_location_slot: SlotId,
  ) -> RangeId {
    if self.start(id) == split_pos {
      return id;
    }
    debug_assert!(split_pos < self.end(id));

    let mut interval = match self.range(id).finger.first_pending_use_interval {
      Some(i) => i,
      None => {
        self.finger_initialize(id);
        self.range(id).finger.first_pending_use_interval.unwrap()
      }
    };

    // The split position can be inside a lifetime hole preceding the
    // pending interval; restart from the first interval to find it.
    if split_pos <= self.interval(interval).start {
      interval = self.range(id).first_interval.unwrap();
    }

    let mut last_before_split: Option<IntervalId> = None;
    while self.interval(interval).end <= split_pos {
      last_before_split = Some(interval);
      interval = self.interval(interval).next.unwrap();
    }

    let split_at_start = self.interval(interval).start == split_pos;
    let mut first_after_split = interval;
    if !split_at_start && self.interval(interval).contains(split_pos) {
      let tail = IntervalId(self.intervals.len() as u32);
      let (end, next) =
        (self.interval(interval).end, self.interval(interval).next);
      self.intervals.push(UseInterval { start: split_pos, end, next });
      self.intervals[interval.index()].end = split_pos;
      self.intervals[interval.index()].next = Some(tail);
      last_before_split = Some(interval);
      first_after_split = tail;
    }

    let last_before_split = last_before_split.unwrap();
    debug_assert!(
      self.interval(last_before_split).next == Some(first_after_split)
    );
    debug_assert!(self.interval(last_before_split).end <= split_pos);
    debug_assert!(split_pos <= self.interval(first_after_split).start);

    let first_use_after_split =
      self.split_use_list(id, split_pos, split_at_start);
    let first_safepoint_after_split =
      self.split_safepoint_list(id, split_pos, split_at_start);

    let sibling_last_interval =
      if Some(last_before_split) == self.range(id).last_interval {
        first_after_split
      } else {
        self.range(id).last_interval.unwrap()
      };

    let sibling = RangeId(self.ranges.len() as u32);
    let (vreg, representation, next_sibling) = {
      let range = &self.ranges[id.index()];
      (range.vreg, range.representation, range.next_sibling)
    };
    self.ranges.push(LiveRange {
      vreg,
      representation,
      assigned_location_slot: sibling_location_slot,
      spill_slot: Location::Invalid,
      first_use: first_use_after_split,
      first_interval: Some(first_after_split),
      last_interval: Some(sibling_last_interval),
      first_safepoint: first_safepoint_after_split,
      last_safepoint: None,
      next_sibling,
      has_only_any_uses_in_loops: 0,
      is_loop_phi: false,
      has_uses_which_require_stack: false,
      finger: AllocationFinger::default(),
    });

    let range = self.range_mut(id);
    range.next_sibling = Some(sibling);
    range.last_interval = Some(last_before_split);
    self.intervals[last_before_split.index()].next = None;

    if let Some(first_use) = first_use_after_split {
      let first_use_pos = self.use_pos(first_use).pos;
      self.finger_update_after_split(id, first_use_pos);
    }

    trace!(
      "  split sibling [{}, {})",
      self.start(sibling),
      self.end(sibling)
    );
    sibling
  }

  fn split_use_list(
    &mut self,
    id: RangeId,
    split_pos: Pos,
    split_at_start: bool,
  ) -> Option<UseId> {
    let mut last_before_split: Option<UseId> = None;
    let mut pos = self.range(id).first_use;
    while let Some(p) = pos {
      let use_pos = self.use_pos(p).pos;
      let before = if split_at_start {
        use_pos < split_pos
      } else {
        use_pos <= split_pos
      };
      if !before {
        break;
      }
      last_before_split = Some(p);
      pos = self.use_pos(p).next;
    }

    match last_before_split {
      None => self.range_mut(id).first_use = None,
      Some(last) => self.uses[last.index()].next = None,
    }
    pos
  }

  fn split_safepoint_list(
    &mut self,
    id: RangeId,
    split_pos: Pos,
    split_at_start: bool,
  ) -> Option<SafepointId> {
    let mut last_before_split: Option<SafepointId> = None;
    let mut pos = self.range(id).first_safepoint;
    while let Some(p) = pos {
      let sp_pos = self.safepoint(p).pos;
      let before = if split_at_start {
        sp_pos < split_pos
      } else {
        sp_pos <= split_pos
      };
      if !before {
        break;
      }
      last_before_split = Some(p);
      pos = self.safepoint(p).next;
    }

    match last_before_split {
      None => self.range_mut(id).first_safepoint = None,
      Some(last) => self.safepoints[last.index()].next = None,
    }
    pos
  }

  // ---------------------------------------------------------------------
  // Allocation finger.

  pub fn finger_initialize(&mut self, id: RangeId) {
    let (first_interval, first_use) =
      (self.range(id).first_interval, self.range(id).first_use);
    let finger = &mut self.range_mut(id).finger;
    finger.first_pending_use_interval = first_interval;
    finger.first_register_use = first_use;
    finger.first_register_beneficial_use = first_use;
    finger.first_hinted_use = first_use;
  }

  /// Advance past intervals ending at or before `start`. Returns true when
  /// the range is exhausted.
  pub fn finger_advance(&mut self, id: RangeId, start: Pos) -> bool {
    let mut interval = self.range(id).finger.first_pending_use_interval;
    while let Some(i) = interval {
      if self.interval(i).end > start {
        break;
      }
      interval = self.interval(i).next;
    }
    self.range_mut(id).finger.first_pending_use_interval = interval;
    interval.is_none()
  }

  pub fn first_pending_interval(&self, id: RangeId) -> Option<IntervalId> {
    self.range(id).finger.first_pending_use_interval
  }

  /// The hint of the first use whose hint slot holds something concrete.
  /// The result may still be invalid (an unfilled phi target); callers
  /// only act on machine registers.
  pub fn first_hint(&self, id: RangeId, slots: &[Location]) -> Location {
    let mut use_pos = self.range(id).finger.first_hinted_use;
    while let Some(u) = use_pos {
      if let Some(hint) = self.use_pos(u).hint {
        let loc = slots[hint.0 as usize];
        if !loc.is_unallocated() {
          return loc;
        }
      }
      use_pos = self.use_pos(u).next;
    }
    Location::Invalid
  }

  fn first_use_after(&self, mut use_pos: Option<UseId>, after: Pos)
    -> Option<UseId>
  {
    while let Some(u) = use_pos {
      if self.use_pos(u).pos >= after {
        break;
      }
      use_pos = self.use_pos(u).next;
    }
    use_pos
  }

  pub fn first_register_use(
    &mut self,
    id: RangeId,
    after: Pos,
    slots: &[Location],
  ) -> Option<UseId> {
    let start = self.range(id).finger.first_register_use;
    let mut use_pos = self.first_use_after(start, after);
    while let Some(u) = use_pos {
      let loc = slots[self.use_pos(u).slot.0 as usize];
      if matches!(
        loc,
        Location::RequiresRegister | Location::RequiresFpuRegister
      ) {
        self.range_mut(id).finger.first_register_use = Some(u);
        return Some(u);
      }
      use_pos = self.use_pos(u).next;
    }
    None
  }

  pub fn first_register_beneficial_use(
    &mut self,
    id: RangeId,
    after: Pos,
    slots: &[Location],
  ) -> Option<UseId> {
    let start = self.range(id).finger.first_register_beneficial_use;
    let mut use_pos = self.first_use_after(start, after);
    while let Some(u) = use_pos {
      let loc = slots[self.use_pos(u).slot.0 as usize];
      if loc.is_register_beneficial() {
        self.range_mut(id).finger.first_register_beneficial_use = Some(u);
        return Some(u);
      }
      use_pos = self.use_pos(u).next;
    }
    None
  }

  /// First use that demands a register strictly inside the instruction at
  /// `after` or later; a use at the end position of `after`'s instruction
  /// does not interfere.
  pub fn first_interfering_use(
    &mut self,
    id: RangeId,
    mut after: Pos,
    slots: &[Location],
  ) -> Option<UseId> {
    if is_instruction_end_position(after) {
      after += 1;
    }
    self.first_register_use(id, after, slots)
  }

  fn finger_update_after_split(&mut self, id: RangeId, first_use_after: Pos) {
    let reg_use = self.range(id).finger.first_register_use;
    if let Some(u) = reg_use {
      if self.use_pos(u).pos >= first_use_after {
        self.range_mut(id).finger.first_register_use = None;
      }
    }
    let ben_use = self.range(id).finger.first_register_beneficial_use;
    if let Some(u) = ben_use {
      if self.use_pos(u).pos >= first_use_after {
        self.range_mut(id).finger.first_register_beneficial_use = None;
      }
    }
  }

  /// Render a range (and not its siblings) for tracing.
  pub fn display(&self, id: RangeId, slots: &[Location]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let range = self.range(id);
    if range.first_interval.is_none() {
      return format!("v{} (empty)", range.vreg);
    }
    write!(
      out,
      "v{} [{}, {}) in {:?}",
      range.vreg,
      self.start(id),
      self.end(id),
      slots[range.assigned_location_slot.0 as usize]
    )
    .unwrap();
    let mut interval = range.first_interval;
    while let Some(i) = interval {
      write!(out, " [{}, {})", self.interval(i).start, self.interval(i).end)
        .unwrap();
      interval = self.interval(i).next;
    }
    let mut use_pos = range.first_use;
    while let Some(u) = use_pos {
      write!(out, " *{}", self.use_pos(u).pos).unwrap();
      use_pos = self.use_pos(u).next;
    }
    out
  }
}

/// First position covered by both interval chains, or `MAX_POSITION`.
pub fn first_intersection(
  arena: &RangeArena,
  mut a: Option<IntervalId>,
  mut b: Option<IntervalId>,
) -> Pos {
  while let (Some(ai), Some(bi)) = (a, b) {
    let pos = arena.interval(ai).intersect(arena.interval(bi));
    if pos != ILLEGAL_POSITION {
      return pos;
    }
    if arena.interval(ai).start < arena.interval(bi).start {
      a = arena.interval(ai).next;
    } else {
      b = arena.interval(bi).next;
    }
  }
  MAX_POSITION
}

/// True when every use of the range before `boundary` has the `Any`
/// policy.
pub fn has_only_unconstrained_uses_in_loop(
  arena: &RangeArena,
  slots: &[Location],
  id: RangeId,
  boundary: Pos,
) -> bool {
  let mut use_pos = arena.range(id).first_use;
  while let Some(u) = use_pos {
    if arena.use_pos(u).pos >= boundary {
      break;
    }
    if slots[arena.use_pos(u).slot.0 as usize] != Location::Any {
      return false;
    }
    use_pos = arena.use_pos(u).next;
  }
  true
}

/// True when every use of the range has the `Any` policy.
pub fn has_only_unconstrained_uses(
  arena: &RangeArena,
  slots: &[Location],
  id: RangeId,
) -> bool {
  has_only_unconstrained_uses_in_loop(arena, slots, id, MAX_POSITION)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::Representation;

  fn arena_with_range() -> (RangeArena, RangeId, Vec<Location>) {
    let mut arena = RangeArena::new();
    let slots = vec![Location::Invalid];
    let id = arena.new_range(0, Representation::Tagged, SlotId(0));
    (arena, id, slots)
  }

  fn new_slot(slots: &mut Vec<Location>, loc: Location) -> SlotId {
    slots.push(loc);
    SlotId(slots.len() as u32 - 1)
  }

  #[test]
  fn intervals_merge_when_touching() {
    let (mut arena, id, _) = arena_with_range();
    arena.add_use_interval(id, 10, 14);
    arena.add_use_interval(id, 6, 10);
    arena.add_use_interval(id, 2, 4);
    assert_eq!(arena.start(id), 2);
    assert_eq!(arena.end(id), 14);
    // [6, 14) merged; [2, 4) is separate.
    let first = arena.range(id).first_interval.unwrap();
    assert_eq!(arena.interval(first).end, 4);
    let second = arena.interval(first).next.unwrap();
    assert_eq!(arena.interval(second).start, 6);
    assert_eq!(arena.interval(second).end, 14);
    assert!(arena.interval(second).next.is_none());
  }

  #[test]
  fn define_shrinks_block_wide_interval() {
    let (mut arena, id, _) = arena_with_range();
    arena.add_use_interval(id, 0, 20);
    arena.define_at(id, 6);
    assert_eq!(arena.start(id), 6);
  }

  #[test]
  fn define_without_use_makes_unit_interval() {
    let (mut arena, id, _) = arena_with_range();
    arena.define_at(id, 8);
    assert_eq!(arena.start(id), 8);
    assert_eq!(arena.end(id), 9);
  }

  #[test]
  fn uses_stay_sorted_with_mid_list_insert() {
    let (mut arena, id, mut slots) = arena_with_range();
    arena.add_use_interval(id, 0, 20);
    let a = new_slot(&mut slots, Location::Any);
    let b = new_slot(&mut slots, Location::Any);
    let c = new_slot(&mut slots, Location::Any);
    arena.add_use(id, 11, a);
    arena.add_use(id, 7, b);
    // Fixed-input pattern: a use at 9 arrives after the use at 7.
    arena.add_use(id, 9, c);
    let mut positions = Vec::new();
    let mut use_pos = arena.range(id).first_use;
    while let Some(u) = use_pos {
      positions.push(arena.use_pos(u).pos);
      use_pos = arena.use_pos(u).next;
    }
    assert_eq!(positions, vec![7, 9, 11]);
  }

  #[test]
  fn duplicate_use_is_not_added_twice() {
    let (mut arena, id, mut slots) = arena_with_range();
    arena.add_use_interval(id, 0, 20);
    let a = new_slot(&mut slots, Location::Any);
    let first = arena.add_use(id, 7, a);
    let second = arena.add_use(id, 7, a);
    assert_eq!(first, second);
  }

  #[test]
  fn split_detaches_tail_uses_and_intervals() {
    let (mut arena, id, mut slots) = arena_with_range();
    arena.add_use_interval(id, 12, 16);
    arena.add_use_interval(id, 2, 8);
    let a = new_slot(&mut slots, Location::Any);
    let b = new_slot(&mut slots, Location::Any);
    arena.add_use(id, 14, a);
    arena.add_use(id, 4, b);

    let sibling_slot = new_slot(&mut slots, Location::Invalid);
    let sibling = arena.split_at(id, 6, sibling_slot);
    assert_ne!(sibling, id);
    assert_eq!(arena.end(id), 6);
    assert_eq!(arena.start(sibling), 6);
    assert_eq!(arena.end(sibling), 16);
    assert_eq!(arena.range(id).next_sibling, Some(sibling));

    // The use at 4 stays, the use at 14 moves to the sibling.
    let parent_use = arena.range(id).first_use.unwrap();
    assert_eq!(arena.use_pos(parent_use).pos, 4);
    assert!(arena.use_pos(parent_use).next.is_none());
    let sibling_use = arena.range(sibling).first_use.unwrap();
    assert_eq!(arena.use_pos(sibling_use).pos, 14);

    // Siblings touch but never overlap.
    assert!(arena.end(id) <= arena.start(sibling));
  }

  #[test]
  fn split_in_lifetime_hole() {
    let (mut arena, id, mut slots) = arena_with_range();
    arena.add_use_interval(id, 12, 16);
    arena.add_use_interval(id, 2, 8);
    let sibling_slot = new_slot(&mut slots, Location::Invalid);
    let sibling = arena.split_at(id, 10, sibling_slot);
    assert_eq!(arena.end(id), 8);
    assert_eq!(arena.start(sibling), 12);
  }

  #[test]
  fn split_at_start_returns_same_range() {
    let (mut arena, id, mut slots) = arena_with_range();
    arena.add_use_interval(id, 2, 8);
    let sibling_slot = new_slot(&mut slots, Location::Invalid);
    assert_eq!(arena.split_at(id, 2, sibling_slot), id);
  }

  #[test]
  fn finger_advances_past_expired_intervals() {
    let (mut arena, id, _) = arena_with_range();
    arena.add_use_interval(id, 12, 16);
    arena.add_use_interval(id, 2, 8);
    arena.finger_initialize(id);
    assert!(!arena.finger_advance(id, 7));
    assert!(!arena.finger_advance(id, 9));
    let pending = arena.first_pending_interval(id).unwrap();
    assert_eq!(arena.interval(pending).start, 12);
    assert!(arena.finger_advance(id, 16));
  }

  #[test]
  fn intersection_of_interval_chains() {
    let mut arena = RangeArena::new();
    let a = arena.new_range(0, Representation::Tagged, SlotId(0));
    let b = arena.new_range(1, Representation::Tagged, SlotId(1));
    arena.add_use_interval(a, 20, 30);
    arena.add_use_interval(a, 0, 10);
    arena.add_use_interval(b, 12, 24);
    let pos = first_intersection(
      &arena,
      arena.range(a).first_interval,
      arena.range(b).first_interval,
    );
    assert_eq!(pos, 20);
  }
}
