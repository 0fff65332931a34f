/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! End-to-end allocator tests over small hand-built flow graphs.

use crate::alloc::{Allocator, AllocatorOptions};
use crate::ir::*;
use crate::location::{BaseReg, ConstId, Location, RegisterKind};
use crate::parallel_move::SerializedMove;
use crate::RegAllocError;

fn init_logging() {
  let _ = pretty_env_logger::try_init();
}

// ---------------------------------------------------------------------
// Graph builder.

struct Op {
  instr: InstrId,
  def: Option<DefId>,
}

struct GraphBuilder {
  fg: FlowGraph,
  next_vreg: Vreg,
}

impl GraphBuilder {
  fn new() -> Self {
    let mut fg = FlowGraph::new();
    let entry =
      Block::new(BlockId(0), BlockEntry::Graph { initial_defs: Vec::new() });
    fg.blocks.push(entry);
    GraphBuilder { fg, next_vreg: 0 }
  }

  fn new_vreg(&mut self) -> Vreg {
    let vreg = self.next_vreg;
    self.next_vreg += 1;
    vreg
  }

  fn new_def(
    &mut self,
    vreg: Vreg,
    second_vreg: Vreg,
    representation: Representation,
    kind: DefKind,
  ) -> DefId {
    let id = DefId(self.fg.defs.len() as u32);
    self.fg.defs.push(Def { id, vreg, second_vreg, representation, kind });
    id
  }

  fn add_block(&mut self, entry: BlockEntry) -> BlockId {
    let id = BlockId(self.fg.blocks.len() as u32);
    self.fg.blocks.push(Block::new(id, entry));
    id
  }

  fn function_entry(&mut self) -> BlockId {
    let id =
      self.add_block(BlockEntry::Function { initial_defs: Vec::new() });
    self.fg.blocks[0].succs.push(id);
    id
  }

  fn target_block(&mut self) -> BlockId {
    self.add_block(BlockEntry::Target)
  }

  fn join_block(&mut self) -> BlockId {
    self.add_block(BlockEntry::Join { phis: Vec::new() })
  }

  fn constant(&mut self, value: i64) -> DefId {
    let cid = ConstId(self.fg.constants.len() as u32);
    self.fg.constants.push(Constant(value));
    let vreg = self.new_vreg();
    let def = self.new_def(
      vreg,
      NO_VREG,
      Representation::Tagged,
      DefKind::Constant(cid),
    );
    match &mut self.fg.blocks[0].entry {
      BlockEntry::Graph { initial_defs } => initial_defs.push(def),
      _ => unreachable!(),
    }
    def
  }

  fn param(
    &mut self,
    block: BlockId,
    location: Location,
    env_index: usize,
  ) -> DefId {
    let vreg = self.new_vreg();
    let def = self.new_def(
      vreg,
      NO_VREG,
      Representation::Tagged,
      DefKind::Param { location, env_index, block },
    );
    match &mut self.fg.block_mut(block).entry {
      BlockEntry::Function { initial_defs }
      | BlockEntry::Osr { initial_defs }
      | BlockEntry::CatchBlock { initial_defs, .. } => initial_defs.push(def),
      _ => unreachable!(),
    }
    def
  }

  fn op_full(
    &mut self,
    block: BlockId,
    inputs: &[(DefId, Location)],
    temps: &[Location],
    output: Option<Location>,
    representation: Representation,
    call: CallBehavior,
  ) -> Op {
    let instr = self.fg.new_instr(block, InstrKind::Op);
    self.fg.block_mut(block).body.push(instr);
    for &(def, loc) in inputs {
      let slot = self.fg.new_slot(loc);
      self.fg.instr_mut(instr).summary.inputs.push(slot);
      self.fg.instr_mut(instr).inputs.push(def);
    }
    for &loc in temps {
      let slot = self.fg.new_slot(loc);
      self.fg.instr_mut(instr).summary.temps.push(slot);
    }
    self.fg.instr_mut(instr).summary.call_behavior = call;
    let def = output.map(|out| {
      let slot = self.fg.new_slot(out);
      self.fg.instr_mut(instr).summary.output = Some(slot);
      let vreg = self.new_vreg();
      let def =
        self.new_def(vreg, NO_VREG, representation, DefKind::Instr(instr));
      self.fg.instr_mut(instr).def = Some(def);
      def
    });
    Op { instr, def }
  }

  fn op(
    &mut self,
    block: BlockId,
    inputs: &[(DefId, Location)],
    output: Option<Location>,
  ) -> Op {
    self.op_full(
      block,
      inputs,
      &[],
      output,
      Representation::Tagged,
      CallBehavior::NoCall,
    )
  }

  fn call(&mut self, block: BlockId) -> Op {
    self.op_full(
      block,
      &[],
      &[],
      None,
      Representation::Tagged,
      CallBehavior::Call,
    )
  }

  /// A definition producing a value pair (two virtual registers).
  fn op_pair(&mut self, block: BlockId) -> Op {
    let instr = self.fg.new_instr(block, InstrKind::Op);
    self.fg.block_mut(block).body.push(instr);
    let slot = self.fg.new_pair_slot(
      Location::RequiresRegister,
      Location::RequiresRegister,
    );
    self.fg.instr_mut(instr).summary.output = Some(slot);
    let vreg = self.new_vreg();
    let second = self.new_vreg();
    let def = self.new_def(
      vreg,
      second,
      Representation::PairOfTagged,
      DefKind::Instr(instr),
    );
    self.fg.instr_mut(instr).def = Some(def);
    Op { instr, def: Some(def) }
  }

  fn phi(&mut self, join: BlockId, inputs: &[DefId]) -> DefId {
    let vreg = self.new_vreg();
    let def = self.new_def(
      vreg,
      NO_VREG,
      Representation::Tagged,
      DefKind::Phi { join, inputs: inputs.to_vec(), reaching_defs: None },
    );
    match &mut self.fg.block_mut(join).entry {
      BlockEntry::Join { phis } => phis.push(def),
      _ => unreachable!(),
    }
    def
  }

  fn pair_phi(&mut self, join: BlockId, inputs: &[DefId]) -> DefId {
    let vreg = self.new_vreg();
    let second = self.new_vreg();
    let def = self.new_def(
      vreg,
      second,
      Representation::PairOfTagged,
      DefKind::Phi { join, inputs: inputs.to_vec(), reaching_defs: None },
    );
    match &mut self.fg.block_mut(join).entry {
      BlockEntry::Join { phis } => phis.push(def),
      _ => unreachable!(),
    }
    def
  }

  fn goto(&mut self, block: BlockId, succ: BlockId) {
    let instr = self
      .fg
      .new_instr(block, InstrKind::Goto { succ, parallel_move: None });
    self.fg.block_mut(block).body.push(instr);
  }

  fn branch(
    &mut self,
    block: BlockId,
    cond: Option<(DefId, Location)>,
    succs: [BlockId; 2],
  ) {
    let instr = self.fg.new_instr(
      block,
      InstrKind::Branch { succs: succs.iter().copied().collect() },
    );
    if let Some((def, loc)) = cond {
      let slot = self.fg.new_slot(loc);
      self.fg.instr_mut(instr).summary.inputs.push(slot);
      self.fg.instr_mut(instr).inputs.push(def);
    }
    self.fg.block_mut(block).body.push(instr);
  }

  fn ret(&mut self, block: BlockId, value: Option<(DefId, Location)>) {
    let instr = self.fg.new_instr(block, InstrKind::Return);
    if let Some((def, loc)) = value {
      let slot = self.fg.new_slot(loc);
      self.fg.instr_mut(instr).summary.inputs.push(slot);
      self.fg.instr_mut(instr).inputs.push(def);
    }
    self.fg.block_mut(block).body.push(instr);
  }

  fn env(&mut self, op: &Op, values: &[DefId]) {
    let id = EnvId(self.fg.envs.len() as u32);
    self.fg.envs.push(Environment {
      values: values.to_vec(),
      locations: None,
      outer: None,
    });
    self.fg.instr_mut(op.instr).env = Some(id);
  }

  fn materialize(&mut self, inputs: &[DefId]) -> DefId {
    let def = self.new_def(
      NO_VREG,
      NO_VREG,
      Representation::Tagged,
      DefKind::Materialize {
        inputs: inputs.to_vec(),
        locations: None,
        visited_for_liveness: false,
      },
    );
    def
  }

  fn mark_loop(
    &mut self,
    header: BlockId,
    back_edges: &[BlockId],
    members: &[BlockId],
  ) {
    let id = self.fg.loops.len();
    self.fg.loops.push(LoopInfo {
      id,
      header,
      outer: None,
      back_edges: back_edges.to_vec(),
    });
    for &member in members {
      self.fg.block_mut(member).loop_id = Some(id);
    }
  }

  fn finish(mut self) -> FlowGraph {
    self.fg.max_vreg = self.next_vreg as usize;
    self.fg.compute_orders();
    self.fg
  }
}

// ---------------------------------------------------------------------
// Helpers.

fn allocate(fg: &mut FlowGraph) {
  allocate_with(fg, AllocatorOptions::default()).unwrap();
}

fn allocate_with(
  fg: &mut FlowGraph,
  opts: AllocatorOptions,
) -> Result<(), RegAllocError> {
  let mut allocator = Allocator::new(fg, opts);
  allocator.allocate()?;
  allocator.verify();
  Ok(())
}

fn scheduled_moves(fg: &FlowGraph) -> Vec<SerializedMove> {
  fg.pmoves.iter().flat_map(|pm| pm.scheduled.iter().copied()).collect()
}

fn input_loc(fg: &FlowGraph, op: &Op, index: usize) -> Location {
  fg.loc(fg.instr(op.instr).summary.inputs[index])
}

fn output_loc(fg: &FlowGraph, op: &Op) -> Location {
  fg.loc(fg.instr(op.instr).summary.output.unwrap())
}

// ---------------------------------------------------------------------
// Scenarios.

#[test]
fn straight_line_spill_free() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  let use1 = b.op(entry, &[(v1, Location::RequiresRegister)], None);
  let use2 = b.op(entry, &[(v1, Location::RequiresRegister)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let loc = output_loc(&fg, &def);
  assert!(loc.is_register());
  assert_eq!(input_loc(&fg, &use1, 0), loc);
  assert_eq!(input_loc(&fg, &use2, 0), loc);
  assert_eq!(fg.spill_slot_count, 0);
  assert!(scheduled_moves(&fg).is_empty());
}

#[test]
fn value_split_across_call() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  b.call(entry);
  let use1 = b.op(entry, &[(v1, Location::RequiresRegister)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let def_loc = output_loc(&fg, &def);
  let use_loc = input_loc(&fg, &use1, 0);
  assert!(def_loc.is_register());
  assert!(use_loc.is_register());
  assert_eq!(fg.spill_slot_count, 1);

  // An eager spill stores the value right after its definition and a
  // reload brings it back after the call clobber.
  let moves = scheduled_moves(&fg);
  assert!(moves
    .iter()
    .any(|m| m.src == def_loc && m.dst.has_stack_index()));
  assert!(moves
    .iter()
    .any(|m| m.src.has_stack_index() && m.dst == use_loc));
}

#[test]
fn phi_with_agreeing_inputs_needs_no_moves() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let left = b.target_block();
  let right = b.target_block();
  let join = b.join_block();

  let cond = b.op(entry, &[], Some(Location::RequiresRegister));
  b.branch(entry, Some((cond.def.unwrap(), Location::Any)), [left, right]);

  let d1 = b.op(left, &[], Some(Location::RequiresRegister));
  b.goto(left, join);
  let d2 = b.op(right, &[], Some(Location::RequiresRegister));
  b.goto(right, join);

  let phi = b.phi(join, &[d1.def.unwrap(), d2.def.unwrap()]);
  let use1 = b.op(join, &[(phi, Location::RequiresRegister)], None);
  b.ret(join, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  // Both inputs and the phi land in the same register, so phi resolution
  // degenerates to redundant moves.
  let phi_loc = input_loc(&fg, &use1, 0);
  assert!(phi_loc.is_register());
  assert_eq!(output_loc(&fg, &d1), phi_loc);
  assert_eq!(output_loc(&fg, &d2), phi_loc);
  assert!(scheduled_moves(&fg).is_empty());
}

#[test]
fn loop_phi_receives_register() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let header = b.join_block();
  let body = b.target_block();
  let exit = b.target_block();

  let init = b.op(entry, &[], Some(Location::RequiresRegister));
  b.goto(entry, header);

  // Loop phi with an unconstrained use in the header and a register use
  // in the body. The back-edge input is wired up once the body exists.
  let phi = b.phi(header, &[init.def.unwrap()]);
  b.branch(header, Some((phi, Location::Any)), [body, exit]);

  let inc = b.op(body, &[(phi, Location::RequiresRegister)],
    Some(Location::RequiresRegister));
  b.goto(body, header);
  match &mut b.fg.def_mut(phi).kind {
    DefKind::Phi { inputs, .. } => inputs.push(inc.def.unwrap()),
    _ => unreachable!(),
  }

  b.ret(exit, None);
  b.mark_loop(header, &[body], &[header, body]);
  let mut fg = b.finish();

  allocate(&mut fg);

  let phi_use_loc = input_loc(&fg, &inc, 0);
  assert!(phi_use_loc.is_register());
}

#[test]
fn fixed_output_forwarded_to_fixed_input() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::Register(2)));
  let v1 = def.def.unwrap();
  let use1 = b.op(entry, &[(v1, Location::Register(2))], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  // The use immediately following the fixed output inherits the register
  // directly; no intermediary register and no move.
  assert_eq!(output_loc(&fg, &def), Location::Register(2));
  assert_eq!(input_loc(&fg, &use1, 0), Location::Register(2));
  assert!(scheduled_moves(&fg).is_empty());
}

#[test]
fn writable_input_gets_fresh_register() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  let clobber = b.op(
    entry,
    &[(v1, Location::WritableRegister)],
    Some(Location::RequiresRegister),
  );
  // Keep v1 alive past the clobbering instruction.
  let use1 = b.op(entry, &[(v1, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let v1_loc = output_loc(&fg, &def);
  let temp_loc = input_loc(&fg, &clobber, 0);
  assert!(v1_loc.is_register());
  assert!(temp_loc.is_register());
  assert_ne!(temp_loc, v1_loc);
  assert_eq!(input_loc(&fg, &use1, 0), v1_loc);

  // The temporary is filled from the original value.
  let moves = scheduled_moves(&fg);
  assert!(moves.iter().any(|m| m.dst == temp_loc && m.src == v1_loc));
}

#[test]
fn same_as_first_or_second_input_swaps_operands() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let a = b.op(entry, &[], Some(Location::RequiresRegister));
  let b2 = b.op(entry, &[], Some(Location::RequiresRegister));
  let va = a.def.unwrap();
  let vb = b2.def.unwrap();
  let add = b.op(
    entry,
    &[(va, Location::RequiresRegister), (vb, Location::RequiresRegister)],
    Some(Location::SameAsFirstOrSecondInput),
  );
  // The first input outlives the instruction, the second does not.
  let use_a = b.op(entry, &[(va, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  // Operands were swapped so the output can share the dying input.
  assert_eq!(fg.instr(add.instr).inputs[0], vb);
  assert_eq!(fg.instr(add.instr).inputs[1], va);
  assert_eq!(output_loc(&fg, &add), input_loc(&fg, &add, 0));
  assert!(input_loc(&fg, &use_a, 0).is_register());
}

#[test]
fn may_be_same_as_first_input_requires_register_when_input_lives() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let a = b.op(entry, &[], Some(Location::RequiresRegister));
  let va = a.def.unwrap();
  let neg = b.op(
    entry,
    &[(va, Location::RequiresRegister)],
    Some(Location::MayBeSameAsFirstInput),
  );
  let use_a = b.op(entry, &[(va, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  // The input survives, so the output must get its own register.
  assert_ne!(output_loc(&fg, &neg), input_loc(&fg, &neg, 0));
  assert_eq!(input_loc(&fg, &use_a, 0), output_loc(&fg, &a));
}

#[test]
fn constant_with_unconstrained_use_stays_constant() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let c = b.constant(42);
  let use1 = b.op(entry, &[(c, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  assert!(input_loc(&fg, &use1, 0).is_constant());
  assert!(scheduled_moves(&fg).is_empty());
}

#[test]
fn constant_with_register_use_is_loaded() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let c = b.constant(42);
  let use1 = b.op(entry, &[(c, Location::RequiresRegister)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let loc = input_loc(&fg, &use1, 0);
  assert!(loc.is_register());
  let moves = scheduled_moves(&fg);
  assert!(moves.iter().any(|m| m.src.is_constant() && m.dst == loc));
}

#[test]
fn environment_receives_locations_and_stack_map() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  let c = b.constant(7);
  let call = b.call(entry);
  b.env(&call, &[v1, c]);
  let use1 = b.op(entry, &[(v1, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let env = fg.env(fg.instr(call.instr).env.unwrap());
  let locations = env.locations.as_ref().unwrap();
  // The tagged value survives the call in its spill slot and is visible
  // to the GC there; the constant is referenced directly.
  let v1_loc = fg.loc(locations[0]);
  assert!(v1_loc.has_stack_index());
  assert!(fg.loc(locations[1]).is_constant());
  assert!(fg
    .instr(call.instr)
    .summary
    .stack_bitmap
    .contains_checked(0));
  let _ = use1;
}

#[test]
fn materialization_inputs_are_allocated() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  let c = b.constant(1);
  let mat = b.materialize(&[v1, c]);
  let call = b.call(entry);
  b.env(&call, &[mat]);
  let use1 = b.op(entry, &[(v1, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let locations = match &fg.def(mat).kind {
    DefKind::Materialize { locations, .. } => locations.as_ref().unwrap(),
    _ => unreachable!(),
  };
  assert!(fg.loc(locations[0]).has_stack_index());
  assert!(fg.loc(locations[1]).is_constant());
  let _ = use1;
}

#[test]
fn pair_values_flow_through_phis() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let left = b.target_block();
  let right = b.target_block();
  let join = b.join_block();

  let cond = b.op(entry, &[], Some(Location::RequiresRegister));
  b.branch(entry, Some((cond.def.unwrap(), Location::Any)), [left, right]);

  let p1 = b.op_pair(left);
  b.goto(left, join);
  let p2 = b.op_pair(right);
  b.goto(right, join);

  let phi = b.pair_phi(join, &[p1.def.unwrap(), p2.def.unwrap()]);
  let pair_in = b.fg.new_pair_slot(Location::Any, Location::Any);
  let use_instr = b.fg.new_instr(join, InstrKind::Op);
  b.fg.block_mut(join).body.push(use_instr);
  b.fg.instr_mut(use_instr).summary.inputs.push(pair_in);
  b.fg.instr_mut(use_instr).inputs.push(phi);
  b.ret(join, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let (lo, hi) = fg.pair_halves(pair_in).unwrap();
  let lo_loc = fg.loc(lo);
  let hi_loc = fg.loc(hi);
  assert!(lo_loc.is_register());
  assert!(hi_loc.is_register());
  assert_ne!(lo_loc, hi_loc);
}

#[test]
fn fpu_value_spills_to_double_slot() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op_full(
    entry,
    &[],
    &[],
    Some(Location::RequiresFpuRegister),
    Representation::UnboxedDouble,
    CallBehavior::NoCall,
  );
  b.call(entry);
  let use1 = b.op_full(
    entry,
    &[(def.def.unwrap(), Location::RequiresFpuRegister)],
    &[],
    None,
    Representation::Tagged,
    CallBehavior::NoCall,
  );
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  assert!(output_loc(&fg, &def).is_fpu_register());
  assert!(input_loc(&fg, &use1, 0).is_fpu_register());
  assert_eq!(fg.spill_slot_count, 1);
  let moves = scheduled_moves(&fg);
  assert!(moves
    .iter()
    .any(|m| matches!(m.dst, Location::DoubleStackSlot { .. })));
}

#[test]
fn fixed_temp_blocks_register() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  // An instruction with a fixed temp interferes with v1 in r3.
  let clobberer = b.op_full(
    entry,
    &[],
    &[Location::Register(3)],
    None,
    Representation::Tagged,
    CallBehavior::NoCall,
  );
  let use1 = b.op(entry, &[(v1, Location::RequiresRegister)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  // v1 is live across the fixed temp, so it must avoid r3.
  assert_ne!(output_loc(&fg, &def), Location::Register(3));
  assert_eq!(input_loc(&fg, &use1, 0), output_loc(&fg, &def));
  let _ = clobberer;
}

#[test]
fn frameless_function_rebases_parameters() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let param = b.param(
    entry,
    Location::StackSlot { index: 2, base: BaseReg::Fp },
    0,
  );
  let use1 = b.op(entry, &[(param, Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  let opts =
    AllocatorOptions { precompiled_mode: true, ..Default::default() };
  allocate_with(&mut fg, opts).unwrap();

  assert!(fg.frameless);
  let loc = input_loc(&fg, &use1, 0);
  assert_eq!(loc.base_reg(), BaseReg::Sp);
  assert_eq!(loc.stack_index(), 0);
}

#[test]
fn call_prevents_frame_elision() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  b.call(entry);
  b.ret(entry, None);
  let mut fg = b.finish();

  let opts =
    AllocatorOptions { precompiled_mode: true, ..Default::default() };
  allocate_with(&mut fg, opts).unwrap();

  assert!(!fg.frameless);
}

#[test]
fn intrinsic_mode_fails_instead_of_spilling() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let mut defs = Vec::new();
  for _ in 0..10 {
    let op = b.op(entry, &[], Some(Location::RequiresRegister));
    defs.push(op.def.unwrap());
  }
  let inputs: Vec<(DefId, Location)> =
    defs.iter().map(|&d| (d, Location::RequiresRegister)).collect();
  b.op(entry, &inputs, None);
  b.ret(entry, None);
  let mut fg = b.finish();

  let opts = AllocatorOptions { intrinsic_mode: true, ..Default::default() };
  let mut allocator = Allocator::new(&mut fg, opts);
  assert_eq!(
    allocator.allocate(),
    Err(RegAllocError::OutOfRegisters(RegisterKind::Cpu))
  );
}

#[test]
fn outgoing_arguments_get_stack_slots() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  let def = b.op(entry, &[], Some(Location::RequiresRegister));
  let v1 = def.def.unwrap();
  let call = b.call(entry);

  // Two stack arguments, last one on top of the stack.
  let arg_slot0 = b.fg.new_slot(Location::Invalid);
  let arg0 = b.new_def(
    NO_VREG,
    NO_VREG,
    Representation::Tagged,
    DefKind::MoveArgument {
      value: v1,
      location_slot: arg_slot0,
      sp_relative_index: 0,
      is_register_move: false,
    },
  );
  let arg_slot1 = b.fg.new_slot(Location::Invalid);
  let arg1 = b.new_def(
    NO_VREG,
    NO_VREG,
    Representation::Tagged,
    DefKind::MoveArgument {
      value: v1,
      location_slot: arg_slot1,
      sp_relative_index: 1,
      is_register_move: false,
    },
  );
  b.fg.instr_mut(call.instr).move_arguments.push(arg0);
  b.fg.instr_mut(call.instr).move_arguments.push(arg1);
  b.fg.max_argument_slot_count = 2;
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  let loc0 = fg.loc(arg_slot0);
  let loc1 = fg.loc(arg_slot1);
  assert!(loc0.has_stack_index());
  assert!(loc1.has_stack_index());
  assert_ne!(loc0, loc1);
  // Index 0 is the top of the stack, i.e. furthest from FP.
  assert!(loc0.stack_index() < loc1.stack_index());
}

#[test]
fn spill_slots_are_recycled_after_expiry() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();

  // First value dies before the second is defined; both are forced onto
  // the stack by calls, and share one spill slot.
  let d1 = b.op(entry, &[], Some(Location::RequiresRegister));
  b.call(entry);
  b.op(entry, &[(d1.def.unwrap(), Location::Any)], None);

  let d2 = b.op(entry, &[], Some(Location::RequiresRegister));
  b.call(entry);
  b.op(entry, &[(d2.def.unwrap(), Location::Any)], None);
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  assert_eq!(fg.spill_slot_count, 1);
}

#[test]
fn allocation_is_deterministic() {
  init_logging();
  let build = || {
    let mut b = GraphBuilder::new();
    let entry = b.function_entry();
    let d1 = b.op(entry, &[], Some(Location::RequiresRegister));
    let d2 = b.op(entry, &[], Some(Location::RequiresRegister));
    b.call(entry);
    let u1 = b.op(entry, &[(d1.def.unwrap(), Location::RequiresRegister)],
      None);
    let u2 = b.op(entry, &[(d2.def.unwrap(), Location::Any)], None);
    b.ret(entry, None);
    let fg = b.finish();
    (fg, d1, d2, u1, u2)
  };

  let (mut fg1, a1, b1, c1, e1) = build();
  let (mut fg2, a2, b2, c2, e2) = build();
  allocate(&mut fg1);
  allocate(&mut fg2);

  assert_eq!(output_loc(&fg1, &a1), output_loc(&fg2, &a2));
  assert_eq!(output_loc(&fg1, &b1), output_loc(&fg2, &b2));
  assert_eq!(input_loc(&fg1, &c1, 0), input_loc(&fg2, &c2, 0));
  assert_eq!(input_loc(&fg1, &e1, 0), input_loc(&fg2, &e2, 0));
}

#[test]
fn definition_without_uses_is_dropped_or_spilled() {
  init_logging();
  let mut b = GraphBuilder::new();
  let entry = b.function_entry();
  // A constant without uses is dropped entirely.
  let c = b.constant(3);
  let _ = c;
  let dead = b.op(entry, &[], Some(Location::RequiresRegister));
  b.ret(entry, None);
  let mut fg = b.finish();

  allocate(&mut fg);

  // The dead definition still receives a location for its degenerate
  // [pos, pos + 1) range.
  assert!(output_loc(&fg, &dead).is_register());
}
