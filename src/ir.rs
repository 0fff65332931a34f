/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The flow graph IR consumed by the allocator.
//!
//! Instructions form a closed sum: block entries, `Goto`, `Branch`,
//! `Return`, `TryEntry`, parallel moves and ordinary operations. SSA
//! definitions (instruction results, constants, parameters, phis,
//! materializations, move arguments) live in their own arena and are
//! referenced by [`DefId`]. All cross-referenced entities are identified by
//! indices into arenas owned by the [`FlowGraph`].

use crate::bitset::BitSet;
use crate::location::{ConstId, Location, RegisterKind, SlotId};
use crate::parallel_move::ParallelMove;
use smallvec::SmallVec;
use std::fmt;

/// A lifetime position. Even values denote an instruction's start, odd
/// values its end. `position / 2` identifies the instruction.
pub type Pos = i32;

macro_rules! entity_id {
  ($name:ident, $prefix:expr) => {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct $name(pub u32);

    impl $name {
      pub fn index(self) -> usize {
        self.0 as usize
      }
    }

    impl fmt::Debug for $name {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $prefix, self.0)
      }
    }
  };
}

entity_id!(BlockId, "B");
entity_id!(InstrId, "i");
entity_id!(DefId, "d");
entity_id!(EnvId, "e");
entity_id!(MoveId, "pm");

/// Virtual register number. Sentinels below zero mark ranges that do not
/// correspond to any SSA value.
pub type Vreg = i32;

pub const NO_VREG: Vreg = -1;
pub const TEMP_VREG: Vreg = -2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Representation {
  NoRep,
  Tagged,
  Untagged,
  PairOfTagged,
  UnboxedInt32,
  UnboxedUint32,
  UnboxedInt64,
  UnboxedFloat,
  UnboxedDouble,
  UnboxedFloat32x4,
  UnboxedInt32x4,
  UnboxedFloat64x2,
}

impl Representation {
  pub fn is_unboxed_integer(self) -> bool {
    matches!(
      self,
      Representation::UnboxedInt32
        | Representation::UnboxedUint32
        | Representation::UnboxedInt64
    )
  }

  pub fn is_quad(self) -> bool {
    matches!(
      self,
      Representation::UnboxedFloat32x4
        | Representation::UnboxedInt32x4
        | Representation::UnboxedFloat64x2
    )
  }

  pub fn register_kind(self) -> RegisterKind {
    match self {
      Representation::UnboxedFloat
      | Representation::UnboxedDouble
      | Representation::UnboxedFloat32x4
      | Representation::UnboxedInt32x4
      | Representation::UnboxedFloat64x2 => RegisterKind::Fpu,
      _ => RegisterKind::Cpu,
    }
  }

  /// The representation live ranges of this value are tracked with.
  /// Unboxed word-sized integers are untagged from the allocator's point
  /// of view.
  pub fn for_range(self) -> Representation {
    match self {
      Representation::UnboxedInt64 | Representation::UnboxedUint32 => {
        Representation::Untagged
      }
      other => other,
    }
  }
}

/// An entry in the constant pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Constant(pub i64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallBehavior {
  NoCall,
  /// Unconditionally calls, all allocatable registers are clobbered.
  Call,
  /// Calls, but preserves all allocatable registers.
  CalleeSafeCall,
  /// Only calls on a slow path; registers survive the fast path.
  CallOnSlowPath,
  /// Calls a leaf native function; volatile registers are clobbered, no
  /// safepoint is required.
  NativeLeafCall,
}

/// Per-instruction declaration of where inputs, temps and the output must
/// live. The allocator rewrites the slots in place.
pub struct LocationSummary {
  pub inputs: Vec<SlotId>,
  pub temps: Vec<SlotId>,
  pub output: Option<SlotId>,
  pub call_behavior: CallBehavior,
  pub call_on_shared_slow_path: bool,
  /// Filled by the allocator: registers live across a slow-path call,
  /// with the representation of the value they hold.
  pub live_registers: Vec<(Location, Representation)>,
  /// Filled by the allocator: spill slots holding tagged objects at this
  /// safepoint.
  pub stack_bitmap: BitSet,
}

impl LocationSummary {
  pub fn new(call_behavior: CallBehavior) -> Self {
    Self {
      inputs: Vec::new(),
      temps: Vec::new(),
      output: None,
      call_behavior,
      call_on_shared_slow_path: false,
      live_registers: Vec::new(),
      stack_bitmap: BitSet::new(0),
    }
  }

  pub fn can_call(&self) -> bool {
    !matches!(self.call_behavior, CallBehavior::NoCall)
  }

  pub fn always_calls(&self) -> bool {
    matches!(
      self.call_behavior,
      CallBehavior::Call | CallBehavior::CalleeSafeCall
    )
  }

  pub fn callee_safe_call(&self) -> bool {
    matches!(self.call_behavior, CallBehavior::CalleeSafeCall)
  }

  pub fn has_call_on_slow_path(&self) -> bool {
    matches!(self.call_behavior, CallBehavior::CallOnSlowPath)
  }

  pub fn native_leaf_call(&self) -> bool {
    matches!(self.call_behavior, CallBehavior::NativeLeafCall)
  }

  pub fn set_stack_bit(&mut self, index: usize) {
    self.stack_bitmap.add_grow(index);
  }
}

/// A safepoint is either a calling instruction or a catch block entry
/// (briefly a safepoint between the catch moves and the handler).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SafepointSite {
  Instr(InstrId),
  CatchEntry(BlockId),
}

pub enum InstrKind {
  /// An ordinary operation described entirely by its location summary.
  Op,
  Goto {
    succ: BlockId,
    parallel_move: Option<MoveId>,
  },
  Branch {
    succs: SmallVec<[BlockId; 2]>,
  },
  Return,
  /// Enters a try region; control continues at `body` and may divert to
  /// `catch_target`. Carries a parallel move used to shuffle values into
  /// the spill slots the catch entry reads.
  TryEntry {
    body: BlockId,
    catch_target: BlockId,
    parallel_move: Option<MoveId>,
  },
  ParallelMove(MoveId),
}

pub struct Instr {
  pub id: InstrId,
  pub block: BlockId,
  pub kind: InstrKind,
  pub summary: LocationSummary,
  pub inputs: Vec<DefId>,
  pub env: Option<EnvId>,
  /// Detached move-argument definitions materializing outgoing arguments
  /// of this (call) instruction.
  pub move_arguments: Vec<DefId>,
  /// The definition produced by this instruction, if any.
  pub def: Option<DefId>,
  pub may_throw: bool,
  pub emits_write_barrier: bool,
  pub lifetime_pos: Pos,
}

impl Instr {
  pub fn is_parallel_move(&self) -> bool {
    matches!(self.kind, InstrKind::ParallelMove(_))
  }

  pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
    match &self.kind {
      InstrKind::Goto { succ, .. } => SmallVec::from_slice(&[*succ]),
      InstrKind::Branch { succs } => succs.clone(),
      InstrKind::TryEntry { body, catch_target, .. } => {
        SmallVec::from_slice(&[*body, *catch_target])
      }
      _ => SmallVec::new(),
    }
  }
}

pub enum DefKind {
  /// Result of an ordinary instruction.
  Instr(InstrId),
  Constant(ConstId),
  Param {
    /// The location the parameter arrives in: a machine register or a
    /// stack slot (possibly a pair of those).
    location: Location,
    env_index: usize,
    block: BlockId,
  },
  Phi {
    join: BlockId,
    inputs: Vec<DefId>,
    reaching_defs: Option<BitSet>,
  },
  /// An object reconstructed at deoptimization; never materialized in
  /// generated code, only its inputs are allocated.
  Materialize {
    inputs: Vec<DefId>,
    locations: Option<Vec<SlotId>>,
    visited_for_liveness: bool,
  },
  /// An outgoing call argument. Stack arguments receive their slot after
  /// allocation; register arguments behave like fixed register inputs.
  MoveArgument {
    value: DefId,
    location_slot: SlotId,
    sp_relative_index: i32,
    is_register_move: bool,
  },
}

pub struct Def {
  pub id: DefId,
  pub vreg: Vreg,
  /// Second virtual register of a pair representation, or `NO_VREG`.
  pub second_vreg: Vreg,
  pub representation: Representation,
  pub kind: DefKind,
}

impl Def {
  pub fn has_pair_representation(&self) -> bool {
    self.second_vreg >= 0
  }

  pub fn vreg_at(&self, pair_index: usize) -> Vreg {
    if pair_index == 0 {
      self.vreg
    } else {
      debug_assert!(self.has_pair_representation());
      self.second_vreg
    }
  }

  pub fn as_constant(&self) -> Option<ConstId> {
    match &self.kind {
      DefKind::Constant(cid) => Some(*cid),
      _ => None,
    }
  }

  pub fn as_phi(&self) -> Option<&Vec<DefId>> {
    match &self.kind {
      DefKind::Phi { inputs, .. } => Some(inputs),
      _ => None,
    }
  }

  pub fn is_phi(&self) -> bool {
    matches!(self.kind, DefKind::Phi { .. })
  }

  pub fn is_materialization(&self) -> bool {
    matches!(self.kind, DefKind::Materialize { .. })
  }

  pub fn is_move_argument(&self) -> bool {
    matches!(self.kind, DefKind::MoveArgument { .. })
  }

  pub fn is_param(&self) -> bool {
    matches!(self.kind, DefKind::Param { .. })
  }

  pub fn register_kind_for_result(&self) -> RegisterKind {
    self.representation.register_kind()
  }
}

/// One frame of the deoptimization environment chain.
pub struct Environment {
  pub values: Vec<DefId>,
  /// Locations assigned by the allocator, one per value.
  pub locations: Option<Vec<SlotId>>,
  pub outer: Option<EnvId>,
}

pub enum BlockEntry {
  Graph {
    initial_defs: Vec<DefId>,
  },
  Function {
    initial_defs: Vec<DefId>,
  },
  Osr {
    initial_defs: Vec<DefId>,
  },
  CatchBlock {
    initial_defs: Vec<DefId>,
    exception_env_index: Option<usize>,
    stacktrace_env_index: Option<usize>,
    catch_try_index: usize,
  },
  Join {
    phis: Vec<DefId>,
  },
  Target,
}

pub struct Block {
  pub id: BlockId,
  pub entry: BlockEntry,
  /// Instructions in order, excluding the entry itself.
  pub body: Vec<InstrId>,
  pub preds: Vec<BlockId>,
  pub succs: Vec<BlockId>,
  pub postorder_number: usize,
  pub start_pos: Pos,
  pub end_pos: Pos,
  pub loop_id: Option<usize>,
  /// Innermost try region this block executes inside of, if any.
  pub try_index: Option<usize>,
  /// Parallel move executed at block entry, created on demand during
  /// control flow resolution.
  pub parallel_move: Option<MoveId>,
  /// Summary carrying the stack bitmap of a catch-entry safepoint.
  pub entry_summary: LocationSummary,
}

impl Block {
  pub fn new(id: BlockId, entry: BlockEntry) -> Block {
    // A catch entry clobbers all registers: values arrive on the stack.
    let call = if matches!(entry, BlockEntry::CatchBlock { .. }) {
      CallBehavior::Call
    } else {
      CallBehavior::NoCall
    };
    Block {
      id,
      entry,
      body: Vec::new(),
      preds: Vec::new(),
      succs: Vec::new(),
      postorder_number: 0,
      start_pos: -1,
      end_pos: -1,
      loop_id: None,
      try_index: None,
      parallel_move: None,
      entry_summary: LocationSummary::new(call),
    }
  }
  pub fn is_join(&self) -> bool {
    matches!(self.entry, BlockEntry::Join { .. })
  }

  pub fn is_catch_block_entry(&self) -> bool {
    matches!(self.entry, BlockEntry::CatchBlock { .. })
  }

  pub fn is_function_entry(&self) -> bool {
    matches!(self.entry, BlockEntry::Function { .. })
  }

  pub fn is_osr_entry(&self) -> bool {
    matches!(self.entry, BlockEntry::Osr { .. })
  }

  pub fn is_graph_entry(&self) -> bool {
    matches!(self.entry, BlockEntry::Graph { .. })
  }

  pub fn initial_defs(&self) -> &[DefId] {
    match &self.entry {
      BlockEntry::Graph { initial_defs }
      | BlockEntry::Function { initial_defs }
      | BlockEntry::Osr { initial_defs }
      | BlockEntry::CatchBlock { initial_defs, .. } => initial_defs,
      _ => &[],
    }
  }

  pub fn phis(&self) -> &[DefId] {
    match &self.entry {
      BlockEntry::Join { phis } => phis,
      _ => &[],
    }
  }
}

pub struct LoopInfo {
  pub id: usize,
  pub header: BlockId,
  pub outer: Option<usize>,
  pub back_edges: Vec<BlockId>,
}

impl LoopInfo {
  pub fn is_back_edge(&self, block: BlockId) -> bool {
    self.back_edges.contains(&block)
  }
}

pub struct FlowGraph {
  pub blocks: Vec<Block>,
  pub instrs: Vec<Instr>,
  pub defs: Vec<Def>,
  pub envs: Vec<Environment>,
  pub constants: Vec<Constant>,
  pub pmoves: Vec<ParallelMove>,
  pub loc_slots: Vec<Location>,

  /// Linear order used for allocation (reverse postorder).
  pub block_order: Vec<BlockId>,
  pub postorder: Vec<BlockId>,
  pub loops: Vec<LoopInfo>,

  /// Number of virtual registers (SSA values).
  pub max_vreg: usize,
  /// Environment index of the synthetic suspend-state variable, if the
  /// function suspends.
  pub suspend_state_env_index: Option<usize>,
  pub makes_copy_of_parameters: bool,
  /// Stack slots reserved for values flowing into catch entries.
  pub fixed_slot_count: usize,
  /// Maximum number of outgoing argument slots of any call.
  pub max_argument_slot_count: usize,

  // Results published by the allocator.
  pub spill_slot_count: usize,
  pub frameless: bool,
}

impl FlowGraph {
  pub fn new() -> Self {
    Self {
      blocks: Vec::new(),
      instrs: Vec::new(),
      defs: Vec::new(),
      envs: Vec::new(),
      constants: Vec::new(),
      pmoves: Vec::new(),
      loc_slots: Vec::new(),
      block_order: Vec::new(),
      postorder: Vec::new(),
      loops: Vec::new(),
      max_vreg: 0,
      suspend_state_env_index: None,
      makes_copy_of_parameters: false,
      fixed_slot_count: 0,
      max_argument_slot_count: 0,
      spill_slot_count: 0,
      frameless: false,
    }
  }

  pub fn block(&self, id: BlockId) -> &Block {
    &self.blocks[id.index()]
  }

  pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
    &mut self.blocks[id.index()]
  }

  pub fn instr(&self, id: InstrId) -> &Instr {
    &self.instrs[id.index()]
  }

  pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
    &mut self.instrs[id.index()]
  }

  pub fn def(&self, id: DefId) -> &Def {
    &self.defs[id.index()]
  }

  pub fn def_mut(&mut self, id: DefId) -> &mut Def {
    &mut self.defs[id.index()]
  }

  pub fn env(&self, id: EnvId) -> &Environment {
    &self.envs[id.index()]
  }

  pub fn env_mut(&mut self, id: EnvId) -> &mut Environment {
    &mut self.envs[id.index()]
  }

  pub fn pmove(&self, id: MoveId) -> &ParallelMove {
    &self.pmoves[id.index()]
  }

  pub fn pmove_mut(&mut self, id: MoveId) -> &mut ParallelMove {
    &mut self.pmoves[id.index()]
  }

  pub fn new_pmove(&mut self) -> MoveId {
    let id = MoveId(self.pmoves.len() as u32);
    self.pmoves.push(ParallelMove::new());
    id
  }

  /// Create a new instruction in the arena. The caller is responsible for
  /// linking it into a block body.
  pub fn new_instr(&mut self, block: BlockId, kind: InstrKind) -> InstrId {
    let id = InstrId(self.instrs.len() as u32);
    self.instrs.push(Instr {
      id,
      block,
      kind,
      summary: LocationSummary::new(CallBehavior::NoCall),
      inputs: Vec::new(),
      env: None,
      move_arguments: Vec::new(),
      def: None,
      may_throw: false,
      emits_write_barrier: false,
      lifetime_pos: -1,
    });
    id
  }

  pub fn loc(&self, slot: SlotId) -> Location {
    self.loc_slots[slot.0 as usize]
  }

  pub fn set_loc(&mut self, slot: SlotId, loc: Location) {
    self.loc_slots[slot.0 as usize] = loc;
  }

  pub fn new_slot(&mut self, loc: Location) -> SlotId {
    let id = SlotId(self.loc_slots.len() as u32);
    self.loc_slots.push(loc);
    id
  }

  /// Allocate two half slots and a pair slot referencing them.
  pub fn new_pair_slot(&mut self, lo: Location, hi: Location) -> SlotId {
    let lo = self.new_slot(lo);
    let hi = self.new_slot(hi);
    self.new_slot(Location::Pair(lo, hi))
  }

  pub fn pair_halves(&self, slot: SlotId) -> Option<(SlotId, SlotId)> {
    match self.loc(slot) {
      Location::Pair(lo, hi) => Some((lo, hi)),
      _ => None,
    }
  }

  pub fn graph_entry(&self) -> BlockId {
    debug_assert!(self.blocks[0].is_graph_entry());
    BlockId(0)
  }

  pub fn last_instruction(&self, block: BlockId) -> Option<InstrId> {
    self.block(block).body.last().copied()
  }

  pub fn get_catch_block_by_try_index(&self, try_index: usize) -> BlockId {
    for block in &self.blocks {
      if let BlockEntry::CatchBlock { catch_try_index, .. } = &block.entry {
        if *catch_try_index == try_index {
          return block.id;
        }
      }
    }
    unreachable!("no catch block for try index {}", try_index)
  }

  /// Catch targets of all try regions in the graph.
  pub fn catch_entries(&self) -> Vec<BlockId> {
    self
      .blocks
      .iter()
      .filter(|block| block.is_catch_block_entry())
      .map(|block| block.id)
      .collect()
  }

  pub fn loop_info(&self, block: BlockId) -> Option<&LoopInfo> {
    self.block(block).loop_id.map(|id| &self.loops[id])
  }

  pub fn is_loop_header(&self, block: BlockId) -> bool {
    match self.block(block).loop_id {
      Some(id) => self.loops[id].header == block,
      None => false,
    }
  }

  /// Compute successor and predecessor edges and the block orders. The
  /// first block must be the graph entry; the linear order is reverse
  /// postorder over the successor relation.
  pub fn compute_orders(&mut self) {
    for i in 0..self.blocks.len() {
      let succs = match self.blocks[i].body.last() {
        Some(&last) => self.instr(last).successors().to_vec(),
        None => Vec::new(),
      };
      // The graph entry has no terminator; its successors (function,
      // OSR and catch entries) were recorded at construction time.
      if !self.blocks[i].is_graph_entry() {
        self.blocks[i].succs = succs;
      }
      self.blocks[i].preds.clear();
    }

    for i in 0..self.blocks.len() {
      let id = self.blocks[i].id;
      for s in self.blocks[i].succs.clone() {
        self.block_mut(s).preds.push(id);
      }
    }

    // Depth first search assigning postorder numbers.
    let entry = self.graph_entry();
    let mut visited = vec![false; self.blocks.len()];
    let mut postorder = Vec::with_capacity(self.blocks.len());
    let mut stack = vec![(entry, 0usize)];
    visited[entry.index()] = true;
    while let Some((block, next_succ)) = stack.pop() {
      let succs = self.block(block).succs.clone();
      if next_succ < succs.len() {
        stack.push((block, next_succ + 1));
        let succ = succs[next_succ];
        if !visited[succ.index()] {
          visited[succ.index()] = true;
          stack.push((succ, 0));
        }
      } else {
        postorder.push(block);
      }
    }

    for (i, &block) in postorder.iter().enumerate() {
      self.block_mut(block).postorder_number = i;
    }
    self.block_order = postorder.iter().rev().copied().collect();
    self.postorder = postorder;
  }
}

impl Default for FlowGraph {
  fn default() -> Self {
    Self::new()
  }
}
