/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Per-block liveness for SSA values.
//!
//! Produces the live-in / live-out / kill bit sets the allocator consumes.
//! Initial sets walk every block backwards; phis contribute their inputs to
//! the corresponding predecessors; environments and materializations keep
//! deopt-visible values alive. A straightforward fixed point then iterates
//! postorder until the sets stabilize.

use crate::bitset::BitSet;
use crate::ir::{BlockId, DefId, DefKind, FlowGraph};
use log::debug;

pub struct Liveness {
  /// All sets are indexed by postorder number.
  pub kill: Vec<BitSet>,
  pub live_in: Vec<BitSet>,
  pub live_out: Vec<BitSet>,
}

impl Liveness {
  pub fn new(block_count: usize, vreg_count: usize) -> Self {
    let mk = || (0..block_count).map(|_| BitSet::new(vreg_count)).collect();
    Self { kill: mk(), live_in: mk(), live_out: mk() }
  }

  pub fn live_in(&self, fg: &FlowGraph, block: BlockId) -> &BitSet {
    &self.live_in[fg.block(block).postorder_number]
  }

  pub fn live_out(&self, fg: &FlowGraph, block: BlockId) -> &BitSet {
    &self.live_out[fg.block(block).postorder_number]
  }

  pub fn analyze(fg: &mut FlowGraph) -> Liveness {
    let mut liveness = Liveness::new(fg.blocks.len(), fg.max_vreg);
    liveness.compute_initial_sets(fg);
    liveness.compute_fixed_point(fg);
    debug!("liveness analyzed over {} blocks", fg.blocks.len());
    liveness
  }

  fn kill_def(&mut self, fg: &FlowGraph, pn: usize, def: DefId) {
    let def = fg.def(def);
    self.kill[pn].add(def.vreg as usize);
    self.live_in[pn].remove(def.vreg as usize);
    if def.has_pair_representation() {
      self.kill[pn].add(def.second_vreg as usize);
      self.live_in[pn].remove(def.second_vreg as usize);
    }
  }

  fn use_def(&mut self, fg: &FlowGraph, pn: usize, def: DefId) {
    let def = fg.def(def);
    self.live_in[pn].add(def.vreg as usize);
    if def.has_pair_representation() {
      self.live_in[pn].add(def.second_vreg as usize);
    }
  }

  fn compute_initial_sets(&mut self, fg: &mut FlowGraph) {
    for block_index in 0..fg.blocks.len() {
      let block_id = fg.blocks[block_index].id;
      let pn = fg.blocks[block_index].postorder_number;

      // Iterate backwards starting at the last instruction.
      for i in (0..fg.block(block_id).body.len()).rev() {
        let instr_id = fg.block(block_id).body[i];

        if let Some(def) = fg.instr(instr_id).def {
          self.kill_def(fg, pn, def);
        }

        let input_count = fg.instr(instr_id).inputs.len();
        debug_assert_eq!(
          input_count,
          fg.instr(instr_id).summary.inputs.len()
        );
        for j in 0..input_count {
          let slot = fg.instr(instr_id).summary.inputs[j];
          let input = fg.instr(instr_id).inputs[j];
          debug_assert!(
            !fg.loc(slot).is_constant()
              || fg.def(input).as_constant().is_some()
          );
          if fg.loc(slot).is_constant() {
            continue;
          }
          self.use_def(fg, pn, input);
        }

        // Detached move arguments in registers act as fixed inputs.
        for k in 0..fg.instr(instr_id).move_arguments.len() {
          let move_arg = fg.instr(instr_id).move_arguments[k];
          if let DefKind::MoveArgument {
            value, is_register_move: true, ..
          } = &fg.def(move_arg).kind
          {
            self.use_def(fg, pn, *value);
          }
        }

        // Values mentioned in the deoptimization environment chain stay
        // live; materializations contribute their transitive inputs.
        let mut env = fg.instr(instr_id).env;
        while let Some(env_id) = env {
          for k in 0..fg.env(env_id).values.len() {
            let value = fg.env(env_id).values[k];
            match &fg.def(value).kind {
              DefKind::Materialize { .. } => {
                self.deep_liveness(fg, pn, value);
              }
              DefKind::MoveArgument { .. } | DefKind::Constant(_) => {}
              _ => self.use_def(fg, pn, value),
            }
          }
          env = fg.env(env_id).outer;
        }
      }

      // Phi inputs not defined by the corresponding predecessor are
      // live-in for that predecessor.
      for p in 0..fg.block(block_id).phis().len() {
        let phi = fg.block(block_id).phis()[p];
        self.kill_def(fg, pn, phi);

        let (inputs, pair) = {
          let def = fg.def(phi);
          (def.as_phi().unwrap().clone(), def.has_pair_representation())
        };
        for (k, &val) in inputs.iter().enumerate() {
          if fg.def(val).as_constant().is_some() {
            continue;
          }
          let pred = fg.block(block_id).preds[k];
          let pred_pn = fg.block(pred).postorder_number;
          let vreg = fg.def(val).vreg as usize;
          if !self.kill[pred_pn].contains(vreg) {
            self.live_in[pred_pn].add(vreg);
          }
          if pair {
            let second = fg.def(val).second_vreg as usize;
            if !self.kill[pred_pn].contains(second) {
              self.live_in[pred_pn].add(second);
            }
          }
        }
      }

      // Initial definitions (parameters, constants) are kills.
      for d in 0..fg.block(block_id).initial_defs().len() {
        let def = fg.block(block_id).initial_defs()[d];
        self.kill_def(fg, pn, def);
      }
    }
  }

  fn deep_liveness(&mut self, fg: &mut FlowGraph, pn: usize, mat: DefId) {
    match &mut fg.def_mut(mat).kind {
      DefKind::Materialize { visited_for_liveness, .. } => {
        if *visited_for_liveness {
          return;
        }
        *visited_for_liveness = true;
      }
      _ => unreachable!(),
    }

    let inputs = match &fg.def(mat).kind {
      DefKind::Materialize { inputs, .. } => inputs.clone(),
      _ => unreachable!(),
    };
    for input in inputs {
      if fg.def(input).as_constant().is_some() {
        continue;
      }
      if fg.def(input).is_materialization() {
        self.deep_liveness(fg, pn, input);
      } else {
        self.use_def(fg, pn, input);
      }
    }
  }

  fn compute_fixed_point(&mut self, fg: &FlowGraph) {
    let mut out = BitSet::new(fg.max_vreg);
    let mut changed = true;
    while changed {
      changed = false;
      for &block_id in &fg.postorder {
        let block = fg.block(block_id);
        let pn = block.postorder_number;

        // live-out is the union of successor live-ins.
        out.clear();
        for &succ in &block.succs {
          out.add_all(&self.live_in[fg.block(succ).postorder_number]);
        }
        self.live_out[pn].add_all(&out);

        if self.live_in[pn]
          .update_live_in(&self.live_out[pn], &self.kill[pn])
        {
          changed = true;
        }
      }
    }
  }
}
