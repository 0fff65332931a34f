/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The linear scan allocator.
//!
//! Runs in nine phases: representation collection, liveness, instruction
//! numbering, live range construction, worklist seeding, one allocation
//! loop per register class, frame elision, outgoing argument placement and
//! control flow resolution. See `build.rs` for construction, `process.rs`
//! for the allocation loop and `resolve.rs` for resolution.

mod build;
mod process;
mod resolve;

use crate::ir::{
  BlockId, DefId, FlowGraph, InstrId, LocationSummary, Pos, Representation,
  SafepointSite, Vreg, NO_VREG, TEMP_VREG,
};
use crate::liveness::Liveness;
use crate::liverange::{
  is_instruction_start_position, RangeArena, RangeId, MAX_POSITION,
};
use crate::location::{BaseReg, Location, RegisterKind};
use crate::target::{
  FrameLayout, ARGS_DESC_REG, AVAILABLE_CPU_REGS, CODE_REG,
  DOUBLE_SPILL_FACTOR, FPU_TMP, NUM_CPU_REGS, NUM_FPU_REGS,
  REGISTER_ALLOCATION_BIAS,
};
use crate::RegAllocError;
use log::{debug, trace};

#[derive(Clone, Debug, Default)]
pub struct AllocatorOptions {
  /// Compiling an intrinsic: extra registers are reserved and spilling is
  /// a fatal error.
  pub intrinsic_mode: bool,
  /// Ahead-of-time compilation: enables frame elision.
  pub precompiled_mode: bool,
  pub frame_layout: FrameLayout,
}

/// What occupies one `position / 2` index: a block entry or a numbered
/// instruction.
#[derive(Clone, Copy)]
pub(crate) enum PosItem {
  Entry(BlockId),
  Instr(InstrId),
}

/// Additional per-loop information: lifetime positions covered by the
/// loop, and the set of values interfering with back-edge phi moves.
pub(crate) struct ExtraLoopInfo {
  pub start: Pos,
  pub end: Pos,
  pub backedge_interference: Option<crate::bitset::BitSet>,
}

pub struct Allocator<'a> {
  pub(crate) fg: &'a mut FlowGraph,
  pub(crate) opts: AllocatorOptions,
  pub(crate) liveness: Liveness,
  pub(crate) arena: RangeArena,

  /// Representation per virtual register, collected up front.
  pub(crate) value_representations: Vec<Representation>,

  /// Mapping between lifetime positions and instructions/block entries.
  pub(crate) instructions: Vec<PosItem>,
  pub(crate) block_entries: Vec<BlockId>,
  pub(crate) extra_loop_info: Vec<ExtraLoopInfo>,

  pub(crate) vreg_count: usize,
  pub(crate) live_ranges: Vec<Option<RangeId>>,

  pub(crate) unallocated_cpu: Vec<RangeId>,
  pub(crate) unallocated_fpu: Vec<RangeId>,

  /// Per-register blocking ranges reserving unavailable positions.
  pub(crate) cpu_regs: Vec<Option<RangeId>>,
  pub(crate) fpu_regs: Vec<Option<RangeId>>,
  pub(crate) blocked_cpu_registers: Vec<bool>,
  pub(crate) blocked_fpu_registers: Vec<bool>,

  /// Temporaries and blocking ranges, kept for tracing.
  pub(crate) temporaries: Vec<RangeId>,

  pub(crate) spilled: Vec<RangeId>,
  pub(crate) safepoints: Vec<SafepointSite>,

  // State of the current allocation round (one per register class).
  pub(crate) register_kind: RegisterKind,
  pub(crate) number_of_registers: usize,
  /// Per register, the allocated ranges that can still affect future
  /// decisions; expired ranges are dropped as the cursor advances.
  pub(crate) registers: Vec<Vec<RangeId>>,
  pub(crate) blocked_registers: Vec<bool>,
  /// Worklist, kept sorted by descending start so the next range to
  /// allocate is popped off the end.
  pub(crate) unallocated: Vec<RangeId>,

  /// Spill slot table: position after which each slot is free again,
  /// plus the type flags keeping quad and untagged slots disjoint.
  pub(crate) spill_slots: Vec<Pos>,
  pub(crate) quad_spill_slots: Vec<bool>,
  pub(crate) untagged_spill_slots: Vec<bool>,
  pub(crate) cpu_spill_slot_count: usize,

  /// Lazily computed reaching definitions for phis.
  pub(crate) reaching_defs_worklist: Vec<DefId>,
}

/// Run register allocation over the flow graph with default options.
pub fn allocate_registers(
  fg: &mut FlowGraph,
) -> Result<(), RegAllocError> {
  let mut allocator = Allocator::new(fg, AllocatorOptions::default());
  allocator.allocate()?;
  if cfg!(debug_assertions) {
    allocator.verify();
  }
  Ok(())
}

impl<'a> Allocator<'a> {
  pub fn new(fg: &'a mut FlowGraph, opts: AllocatorOptions) -> Self {
    let liveness = Liveness::analyze(fg);
    let vreg_count = fg.max_vreg;

    let mut blocked_cpu_registers = vec![false; NUM_CPU_REGS];
    for reg in 0..NUM_CPU_REGS {
      if AVAILABLE_CPU_REGS & (1 << reg) == 0 {
        blocked_cpu_registers[reg] = true;
      }
    }
    // The scratch FPU register is used by optimized code and the parallel
    // move resolver.
    let mut blocked_fpu_registers = vec![false; NUM_FPU_REGS];
    blocked_fpu_registers[FPU_TMP] = true;

    // Block additional registers that must be preserved while generating
    // intrinsics.
    if opts.intrinsic_mode {
      blocked_cpu_registers[ARGS_DESC_REG] = true;
      blocked_cpu_registers[CODE_REG] = true;
    }

    Self {
      fg,
      opts,
      liveness,
      arena: RangeArena::new(),
      value_representations: vec![Representation::NoRep; vreg_count],
      instructions: Vec::new(),
      block_entries: Vec::new(),
      extra_loop_info: Vec::new(),
      vreg_count,
      live_ranges: vec![None; vreg_count],
      unallocated_cpu: Vec::new(),
      unallocated_fpu: Vec::new(),
      cpu_regs: vec![None; NUM_CPU_REGS],
      fpu_regs: vec![None; NUM_FPU_REGS],
      blocked_cpu_registers,
      blocked_fpu_registers,
      temporaries: Vec::new(),
      spilled: Vec::new(),
      safepoints: Vec::new(),
      register_kind: RegisterKind::Cpu,
      number_of_registers: 0,
      registers: Vec::new(),
      blocked_registers: Vec::new(),
      unallocated: Vec::new(),
      spill_slots: Vec::new(),
      quad_spill_slots: Vec::new(),
      untagged_spill_slots: Vec::new(),
      cpu_spill_slot_count: 0,
      reaching_defs_worklist: Vec::new(),
    }
  }

  pub fn allocate(&mut self) -> Result<(), RegAllocError> {
    self.collect_representations();
    self.number_instructions();

    // The synthetic suspend-state variable owns the first spill slot,
    // ahead of any parameter slots.
    self.allocate_spill_slot_for_suspend_state();

    self.build_live_ranges();

    self.update_stackmaps_for_suspend_state();

    if log::log_enabled!(log::Level::Trace) {
      trace!("-- [before allocation] ranges --");
      self.print_live_ranges();
    }

    self.prepare_for_allocation(RegisterKind::Cpu, NUM_CPU_REGS);
    self.allocate_unallocated_ranges()?;
    // Stack slots reserved for catch entries sit below the spill area; if
    // nothing was spilled they still must be accounted for.
    self.cpu_spill_slot_count =
      self.spill_slots.len().max(self.fg.fixed_slot_count);
    self.spill_slots.clear();
    self.quad_spill_slots.clear();
    self.untagged_spill_slots.clear();

    self.prepare_for_allocation(RegisterKind::Fpu, NUM_FPU_REGS);
    self.allocate_unallocated_ranges()?;

    self.fg.spill_slot_count = self.cpu_spill_slot_count
      + self.spill_slots.len() * DOUBLE_SPILL_FACTOR
      + self.fg.max_argument_slot_count;

    self.remove_frame_if_not_needed();

    self.allocate_outgoing_arguments();

    self.resolve_control_flow();

    self.schedule_parallel_moves();

    if log::log_enabled!(log::Level::Trace) {
      trace!("-- [after allocation] ranges --");
      self.print_live_ranges();
    }
    debug!(
      "allocation complete: {} spill slots, frameless: {}",
      self.fg.spill_slot_count, self.fg.frameless
    );
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Position bookkeeping.

  pub(crate) fn instruction_at(&self, pos: Pos) -> PosItem {
    self.instructions[(pos / 2) as usize]
  }

  pub(crate) fn block_entry_at(&self, pos: Pos) -> BlockId {
    self.block_entries[(pos / 2) as usize]
  }

  pub(crate) fn is_block_entry(&self, pos: Pos) -> bool {
    is_instruction_start_position(pos)
      && matches!(self.instruction_at(pos), PosItem::Entry(_))
  }

  pub(crate) fn is_catch_block_entry(&self, pos: Pos) -> bool {
    is_instruction_start_position(pos)
      && match self.instruction_at(pos) {
        PosItem::Entry(block) => self.fg.block(block).is_catch_block_entry(),
        PosItem::Instr(_) => false,
      }
  }

  // ---------------------------------------------------------------------
  // Range creation.

  /// Map a virtual register to its live range, creating it on first use.
  pub(crate) fn get_live_range(&mut self, vreg: Vreg) -> RangeId {
    debug_assert!(vreg >= 0);
    if let Some(range) = self.live_ranges[vreg as usize] {
      return range;
    }
    let rep = self.value_representations[vreg as usize];
    debug_assert!(rep != Representation::NoRep);
    let slot = self.fg.new_slot(Location::Invalid);
    let range = self.arena.new_range(vreg, rep, slot);
    self.live_ranges[vreg as usize] = Some(range);
    range
  }

  pub(crate) fn make_live_range_for_temporary(&mut self) -> RangeId {
    let slot = self.fg.new_slot(Location::Invalid);
    let range =
      self.arena.new_range(TEMP_VREG, Representation::NoRep, slot);
    self.temporaries.push(range);
    range
  }

  pub(crate) fn assigned_loc(&self, range: RangeId) -> Location {
    self.fg.loc(self.arena.range(range).assigned_location_slot)
  }

  pub(crate) fn set_assigned_loc(&mut self, range: RangeId, loc: Location) {
    let slot = self.arena.range(range).assigned_location_slot;
    self.fg.set_loc(slot, loc);
  }

  pub(crate) fn make_register_location(&self, reg: usize) -> Location {
    Location::machine_register(self.register_kind, reg)
  }

  // ---------------------------------------------------------------------
  // Register blocking.

  /// Reserve a machine register over `[from, to)` with a sentinel range.
  pub(crate) fn block_location(&mut self, loc: Location, from: Pos, to: Pos) {
    debug_assert!(loc.is_machine_register(), "cannot block {:?}", loc);
    let is_cpu = loc.is_register();
    let reg = loc.register_code();

    let blocked = if is_cpu {
      self.blocked_cpu_registers[reg]
    } else {
      self.blocked_fpu_registers[reg]
    };
    if blocked {
      return;
    }

    let existing = if is_cpu { self.cpu_regs[reg] } else { self.fpu_regs[reg] };
    let range = match existing {
      Some(range) => range,
      None => {
        let slot = self.fg.new_slot(loc);
        let range =
          self.arena.new_range(NO_VREG, Representation::NoRep, slot);
        if is_cpu {
          self.cpu_regs[reg] = Some(range);
        } else {
          self.fpu_regs[reg] = Some(range);
        }
        self.temporaries.push(range);
        range
      }
    };
    self.arena.add_use_interval(range, from, to);
  }

  pub(crate) fn block_cpu_registers(&mut self, mask: u32, from: Pos, to: Pos) {
    for reg in 0..NUM_CPU_REGS {
      if mask & (1 << reg) != 0 {
        self.block_location(Location::Register(reg), from, to);
      }
    }
  }

  pub(crate) fn block_fpu_registers(&mut self, mask: u32, from: Pos, to: Pos) {
    for reg in 0..NUM_FPU_REGS {
      if mask & (1 << reg) != 0 {
        self.block_location(Location::FpuRegister(reg), from, to);
      }
    }
  }

  // ---------------------------------------------------------------------
  // Use conversion.

  /// Write the final location of a use through its slot.
  pub(crate) fn convert_use_to(&mut self, use_id: crate::liverange::UseId,
    loc: Location)
  {
    debug_assert!(!loc.is_pair());
    let slot = self.arena.use_pos(use_id).slot;
    trace!(
      "  use at {} converted to {:?}",
      self.arena.use_pos(use_id).pos,
      loc
    );
    self.fg.set_loc(slot, loc);
  }

  pub(crate) fn convert_all_uses(&mut self, range: RangeId) {
    if self.arena.range(range).vreg == NO_VREG {
      return;
    }
    let loc = self.assigned_loc(range);
    debug_assert!(!loc.is_invalid());
    trace!(
      "range [{}, {}) for v{} allocated to {:?}",
      self.arena.start(range),
      self.arena.end(range),
      self.arena.range(range).vreg,
      loc
    );

    let mut use_pos = self.arena.range(range).first_use;
    while let Some(u) = use_pos {
      self.convert_use_to(u, loc);
      use_pos = self.arena.use_pos(u).next;
    }

    // Registers live across a slow-path call must be preserved by the
    // slow path; record them on the safepoint.
    if loc.is_machine_register() {
      let rep = self.arena.range(range).representation;
      let mut safepoint = self.arena.range(range).first_safepoint;
      while let Some(sp) = safepoint {
        let site = self.arena.safepoint(sp).site;
        let summary = self.site_summary_mut(site);
        if !summary.always_calls() {
          debug_assert!(summary.can_call());
          summary.live_registers.push((loc, rep));
        }
        safepoint = self.arena.safepoint(sp).next;
      }
    }
  }

  pub(crate) fn site_summary_mut(
    &mut self,
    site: SafepointSite,
  ) -> &mut LocationSummary {
    match site {
      SafepointSite::Instr(instr) => &mut self.fg.instr_mut(instr).summary,
      SafepointSite::CatchEntry(block) => {
        &mut self.fg.block_mut(block).entry_summary
      }
    }
  }

  // ---------------------------------------------------------------------
  // Worklists.

  pub(crate) fn add_to_unallocated(&mut self, range: RangeId) {
    self.arena.finger_initialize(range);
    insert_sorted(&self.arena, &mut self.unallocated, range);
  }

  /// Queue a finished range on the worklist of its register class.
  pub(crate) fn complete_range_of_kind(
    &mut self,
    range: RangeId,
    kind: RegisterKind,
  ) {
    self.arena.finger_initialize(range);
    match kind {
      RegisterKind::Cpu => {
        insert_sorted(&self.arena, &mut self.unallocated_cpu, range)
      }
      RegisterKind::Fpu => {
        insert_sorted(&self.arena, &mut self.unallocated_fpu, range)
      }
    }
  }

  #[cfg(debug_assertions)]
  fn unallocated_is_sorted(&self) -> bool {
    for i in (1..self.unallocated.len()).rev() {
      let a = self.unallocated[i];
      let b = self.unallocated[i - 1];
      if !(self.arena.start(a) <= self.arena.start(b)) {
        return false;
      }
    }
    true
  }

  pub(crate) fn prepare_for_allocation(
    &mut self,
    kind: RegisterKind,
    number_of_registers: usize,
  ) {
    self.register_kind = kind;
    self.number_of_registers = number_of_registers;

    self.blocked_registers.clear();
    self.registers.clear();
    for _ in 0..number_of_registers {
      self.blocked_registers.push(false);
      self.registers.push(Vec::new());
    }
    debug_assert!(self.unallocated.is_empty());
    let unallocated = match kind {
      RegisterKind::Cpu => std::mem::take(&mut self.unallocated_cpu),
      RegisterKind::Fpu => std::mem::take(&mut self.unallocated_fpu),
    };
    self.unallocated = unallocated;

    for i in 0..number_of_registers {
      let reg = (i + REGISTER_ALLOCATION_BIAS) % number_of_registers;
      let (blocked, blocking) = match kind {
        RegisterKind::Cpu => {
          (self.blocked_cpu_registers[reg], self.cpu_regs[reg])
        }
        RegisterKind::Fpu => {
          (self.blocked_fpu_registers[reg], self.fpu_regs[reg])
        }
      };
      self.blocked_registers[reg] = blocked;
      debug_assert!(self.registers[reg].is_empty());
      if let Some(range) = blocking {
        if self.arena.range(range).first_interval.is_some() {
          self.arena.finger_initialize(range);
          self.registers[reg].push(range);
        }
      }
    }
  }

  /// Process live ranges sorted by start, assigning a location to each.
  pub(crate) fn allocate_unallocated_ranges(
    &mut self,
  ) -> Result<(), RegAllocError> {
    #[cfg(debug_assertions)]
    debug_assert!(self.unallocated_is_sorted());

    while let Some(range) = self.unallocated.pop() {
      let start = self.arena.start(range);
      trace!(
        "processing live range for v{} starting at {}",
        self.arena.range(range).vreg,
        start
      );
      self.advance_active_intervals(start);

      if !self.allocate_free_register(range) {
        if self.opts.intrinsic_mode {
          // No spilling when compiling intrinsics; the IR must have been
          // built with enough free registers.
          return Err(RegAllocError::OutOfRegisters(self.register_kind));
        }
        self.allocate_any_register(range);
      }
    }

    debug_assert!(self.unallocated.is_empty());
    self.advance_active_intervals(MAX_POSITION);

    // Values live into a catch entry arrive through spill slots; make
    // sure every register-allocated one has a slot to arrive in.
    for catch_entry in self.fg.catch_entries() {
      let live: Vec<usize> =
        self.liveness.live_in(self.fg, catch_entry).iter().collect();
      let catch_start = self.fg.block(catch_entry).start_pos;
      for vreg in live {
        let range = self.get_live_range(vreg as Vreg);
        let dst_cover = self.find_cover(range, catch_start);
        let dst = self.assigned_loc(dst_cover);

        if self.target_location_is_spill_slot(dst_cover, dst) {
          continue;
        }
        if dst == exception_location() || dst == stacktrace_location() {
          continue;
        }
        if dst.is_register() || dst.is_fpu_register() {
          if self.arena.range(range).spill_slot.is_invalid() {
            self.allocate_spill_slot_for(range);
          }
        }
      }
    }

    trace!("allocation round completed");
    Ok(())
  }

  /// Drop allocated ranges the cursor has passed; convert their uses.
  pub(crate) fn advance_active_intervals(&mut self, start: Pos) {
    for i in 0..self.number_of_registers {
      let reg = (i + REGISTER_ALLOCATION_BIAS) % self.number_of_registers;
      if self.registers[reg].is_empty() {
        continue;
      }
      let list = std::mem::take(&mut self.registers[reg]);
      let mut kept = Vec::with_capacity(list.len());
      for range in list {
        if self.arena.finger_advance(range, start) {
          self.convert_all_uses(range);
        } else {
          kept.push(range);
        }
      }
      self.registers[reg] = kept;
    }
  }

  // ---------------------------------------------------------------------
  // Spill slots.

  /// Find or create a spill slot whose previous occupant is dead and
  /// whose type flags match; assign it to the range.
  pub(crate) fn allocate_spill_slot_for(&mut self, range: RangeId) {
    debug_assert!(self.arena.range(range).spill_slot.is_invalid());

    // The whole logical lifetime of the value occupies the slot.
    let mut last_sibling = range;
    while let Some(next) = self.arena.range(last_sibling).next_sibling {
      last_sibling = next;
    }
    let start = self.arena.start(range);
    let end = self.arena.end(last_sibling);

    let rep = self.arena.range(range).representation;
    // FPU spill slots are measured in doubles; a quad occupies two
    // consecutive double slots and must never share an index with one.
    let need_quad =
      self.register_kind == RegisterKind::Fpu && rep.is_quad();
    let need_untagged = self.register_kind == RegisterKind::Cpu
      && rep == Representation::Untagged;

    // Slots reserved for catch entries are not recycled.
    let first = if self.register_kind == RegisterKind::Cpu {
      self.fg.fixed_slot_count
    } else {
      0
    };
    let mut idx = first;
    while idx < self.spill_slots.len() {
      if need_quad == self.quad_spill_slots[idx]
        && need_untagged == self.untagged_spill_slots[idx]
        && self.spill_slots[idx] <= start
      {
        break;
      }
      idx += 1;
    }

    while idx > self.spill_slots.len() {
      self.spill_slots.push(MAX_POSITION);
      self.quad_spill_slots.push(false);
      self.untagged_spill_slots.push(false);
    }

    if idx == self.spill_slots.len() {
      self.spill_slots.push(0);
      self.quad_spill_slots.push(need_quad);
      self.untagged_spill_slots.push(need_untagged);
      if need_quad {
        // A quad slot is a pair of double slots.
        self.spill_slots.push(0);
        self.quad_spill_slots.push(need_quad);
        self.untagged_spill_slots.push(need_untagged);
      }
    }

    self.spill_slots[idx] = end;
    if need_quad {
      debug_assert!(
        self.quad_spill_slots[idx] && self.quad_spill_slots[idx + 1]
      );
      // Use the higher index; it corresponds to the lower stack address.
      idx += 1;
      self.spill_slots[idx] = end;
    } else {
      debug_assert!(!self.quad_spill_slots[idx]);
    }

    let layout = self.opts.frame_layout;
    let location = if rep.is_unboxed_integer()
      || rep == Representation::Tagged
      || rep == Representation::PairOfTagged
      || rep == Representation::Untagged
    {
      let slot_index = layout.frame_slot_for_variable_index(-(idx as i32));
      Location::StackSlot { index: slot_index, base: BaseReg::Fp }
    } else {
      // FPU slot indices are double-based and sit on top of the CPU
      // spill area; the lowest address of the slot carries the index.
      let slot_index = layout.frame_slot_for_variable_index(
        -((self.cpu_spill_slot_count
          + idx * DOUBLE_SPILL_FACTOR
          + (DOUBLE_SPILL_FACTOR - 1)) as i32),
      );
      if rep.is_quad() {
        debug_assert!(need_quad);
        Location::QuadStackSlot { index: slot_index, base: BaseReg::Fp }
      } else {
        debug_assert!(
          rep == Representation::UnboxedFloat
            || rep == Representation::UnboxedDouble
        );
        Location::DoubleStackSlot { index: slot_index, base: BaseReg::Fp }
      }
    };
    self.arena.range_mut(range).spill_slot = location;

    self.spilled.push(range);
  }

  /// Mark the spill slot of the range as holding an object in the stack
  /// bitmap of every safepoint any sibling crosses.
  pub(crate) fn mark_as_object_at_safepoints(&mut self, range: RangeId) {
    let spill_slot = self.arena.range(range).spill_slot;
    let mut stack_index = spill_slot.stack_index();
    if spill_slot.base_reg() == BaseReg::Fp {
      stack_index = -self
        .opts
        .frame_layout
        .variable_index_for_frame_slot(spill_slot.stack_index());
    }
    debug_assert!(stack_index >= 0);

    let mut current = Some(range);
    while let Some(r) = current {
      let mut safepoint = self.arena.range(r).first_safepoint;
      while let Some(sp) = safepoint {
        let site = self.arena.safepoint(sp).site;
        self.site_summary_mut(site).set_stack_bit(stack_index as usize);
        safepoint = self.arena.safepoint(sp).next;
      }
      current = self.arena.range(r).next_sibling;
    }
  }

  /// Allocate the range to the spill slot owned by its parent range.
  pub(crate) fn spill(&mut self, range: RangeId) {
    let vreg = self.arena.range(range).vreg;
    let parent = self.get_live_range(vreg);
    if self.arena.range(parent).spill_slot.is_invalid() {
      self.allocate_spill_slot_for(parent);
      if self.arena.range(range).representation == Representation::Tagged {
        self.mark_as_object_at_safepoints(parent);
      }
    }
    let slot = self.arena.range(parent).spill_slot;
    self.set_assigned_loc(range, slot);
    self.convert_all_uses(range);
  }

  /// Reserve the spill slot pinned to the synthetic suspend-state
  /// variable ahead of all others.
  pub(crate) fn allocate_spill_slot_for_suspend_state(&mut self) {
    if self.fg.suspend_state_env_index.is_none() {
      return;
    }
    self.spill_slots.push(MAX_POSITION);
    self.quad_spill_slots.push(false);
    self.untagged_spill_slots.push(false);
    debug_assert_eq!(self.suspend_state_stack_index(), 0);
  }

  pub(crate) fn suspend_state_stack_index(&self) -> i32 {
    let layout = self.opts.frame_layout;
    -layout.variable_index_for_frame_slot(self.suspend_state_frame_slot())
  }

  pub(crate) fn suspend_state_frame_slot(&self) -> i32 {
    self.opts.frame_layout.frame_slot_for_variable_index(0)
  }

  /// The suspend-state slot holds an object at every safepoint.
  pub(crate) fn update_stackmaps_for_suspend_state(&mut self) {
    if self.fg.suspend_state_env_index.is_none() {
      return;
    }
    let stack_index = self.suspend_state_stack_index();
    debug_assert!(stack_index >= 0);
    for i in 0..self.safepoints.len() {
      let site = self.safepoints[i];
      self.site_summary_mut(site).set_stack_bit(stack_index as usize);
    }
  }

  /// Reserve the spill slot an initial definition already lives in
  /// (parameters in the spill area, OSR values) so it is not reused
  /// while the value is live.
  pub(crate) fn allocate_spill_slot_for_initial_definition(
    &mut self,
    slot_index: usize,
    range_end: Pos,
  ) {
    if slot_index < self.spill_slots.len() {
      // Several initial definitions may share the slot (OSR entry plus
      // catch entry).
      self.spill_slots[slot_index] =
        self.spill_slots[slot_index].max(range_end);
      debug_assert!(!self.quad_spill_slots[slot_index]);
      debug_assert!(!self.untagged_spill_slots[slot_index]);
    } else {
      while self.spill_slots.len() < slot_index {
        self.spill_slots.push(MAX_POSITION);
        self.quad_spill_slots.push(false);
        self.untagged_spill_slots.push(false);
      }
      self.spill_slots.push(range_end);
      self.quad_spill_slots.push(false);
      self.untagged_spill_slots.push(false);
    }
  }

  // ---------------------------------------------------------------------
  // Tracing.

  pub(crate) fn print_live_ranges(&self) {
    for &range in &self.temporaries {
      self.print_range_chain(range);
    }
    for vreg in 0..self.vreg_count {
      if let Some(range) = self.live_ranges[vreg] {
        self.print_range_chain(range);
      }
    }
  }

  fn print_range_chain(&self, range: RangeId) {
    let mut current = Some(range);
    while let Some(r) = current {
      if self.arena.range(r).first_interval.is_some() {
        trace!("  {}", self.arena.display(r, &self.fg.loc_slots));
      }
      current = self.arena.range(r).next_sibling;
    }
  }
}

/// Insert into a list kept sorted by descending start position, so the
/// earliest start is popped off the end. Ties go in front of equal
/// elements, preserving insertion order of equal starts.
pub(crate) fn insert_sorted(
  arena: &RangeArena,
  list: &mut Vec<RangeId>,
  range: RangeId,
) {
  let start = arena.start(range);
  if list.is_empty() {
    list.push(range);
    return;
  }
  for i in (0..list.len()).rev() {
    if start <= arena.start(list[i]) {
      list.insert(i + 1, range);
      return;
    }
  }
  list.insert(0, range);
}

pub(crate) fn exception_location() -> Location {
  Location::Register(crate::target::EXCEPTION_REG)
}

pub(crate) fn stacktrace_location() -> Location {
  Location::Register(crate::target::STACKTRACE_REG)
}

pub(crate) fn min_position(a: Pos, b: Pos) -> Pos {
  if a < b {
    a
  } else {
    b
  }
}
