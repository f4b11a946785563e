//! Probe injection into one method body
//!
//! A probe is `ldc.i4 <slot>; call RecordHit(int32)`: it pushes one value and
//! the call pops it, so stack depth is unchanged across a probe.
//!
//! Line probes go in front of the instruction they count and take over every
//! reference to it: branches that jumped to the instruction now jump to its
//! first probe, and handler boundaries and sequence points move the same way.
//!
//! Branch probes for a conditional branch `B` with next instruction `N`:
//!
//! ```text
//! B           -> stub_1 .. stub_k
//! probe(0)        fall-through path
//! br N
//! stub_1: probe(1); br T1
//! ...
//! stub_k: probe(k); br Tk
//! N: ...
//! ```
//!
//! Short branches are widened before anything moves, since inserted code can
//! push a target out of `i8` range.

use super::ids::SlotId;
use super::stack::{self, StackError};
use crate::image::{ExceptionHandler, Instruction, MethodBody, MethodRef, OpCode, Operand};
use crate::result::{CovetError, CovetResult};
use std::collections::BTreeMap;

/// Slots to count in one method, keyed by original instruction offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbePlan {
    /// Line slots hit before the instruction at each offset
    pub lines: BTreeMap<u32, Vec<SlotId>>,
    /// Per conditional branch, one slot per path: fall-through or default
    /// first, then each target in operand order
    pub branches: BTreeMap<u32, Vec<SlotId>>,
}

impl ProbePlan {
    /// Nothing to inject
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.branches.is_empty()
    }

    /// Add a line slot before `offset`, once
    pub fn add_line(&mut self, offset: u32, slot: SlotId) {
        let slots = self.lines.entry(offset).or_default();
        if !slots.contains(&slot) {
            slots.push(slot);
        }
    }
}

/// Output of [`ProbeInjector::inject`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenBody {
    /// New body
    pub body: MethodBody,
    offset_map: BTreeMap<u32, u32>,
    instruction_map: BTreeMap<u32, u32>,
}

impl RewrittenBody {
    /// New location of references to the old instruction at `old`: its
    /// first probe, or the instruction itself when it has none
    #[must_use]
    pub fn map_offset(&self, old: u32) -> Option<u32> {
        self.offset_map.get(&old).copied()
    }

    /// New offset of the old instruction itself
    #[must_use]
    pub fn instruction_offset(&self, old: u32) -> Option<u32> {
        self.instruction_map.get(&old).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Original(u32),
    Stub(usize),
}

#[derive(Debug, Clone)]
enum Pending {
    Ready(Operand),
    Label(Label),
    Labels(Vec<Label>),
}

#[derive(Debug, Clone)]
struct Emitted {
    opcode: OpCode,
    operand: Pending,
}

/// Rewrites method bodies to call the tracker
#[derive(Debug, Clone)]
pub struct ProbeInjector {
    record_hit: MethodRef,
}

impl ProbeInjector {
    /// Probes will call `record_hit`
    #[must_use]
    pub fn new(record_hit: MethodRef) -> Self {
        Self { record_hit }
    }

    /// Rewrite `body` according to `plan`
    ///
    /// `method` names the method in errors. The input is not modified.
    pub fn inject(
        &self,
        method: &str,
        body: &MethodBody,
        returns_value: bool,
        plan: &ProbePlan,
    ) -> CovetResult<RewrittenBody> {
        let fail = |e: StackError| CovetError::rewrite(method, e.to_string());
        let before = stack::analyze(body, returns_value).map_err(fail)?;
        self.validate(method, body, plan)?;

        let old_size = body.code_size();
        let mut emitted: Vec<Emitted> = Vec::with_capacity(body.instructions.len() * 2);
        let mut starts: BTreeMap<u32, usize> = BTreeMap::new();
        let mut positions: BTreeMap<u32, usize> = BTreeMap::new();
        let mut stubs: Vec<usize> = Vec::new();

        for (index, instruction) in body.instructions.iter().enumerate() {
            let _ = starts.insert(instruction.offset, emitted.len());
            for slot in plan.lines.get(&instruction.offset).into_iter().flatten() {
                self.emit_probe(method, &mut emitted, *slot)?;
            }
            let _ = positions.insert(instruction.offset, emitted.len());

            let opcode = instruction.opcode.long_form();
            let Some(paths) = plan.branches.get(&instruction.offset) else {
                let operand = match &instruction.operand {
                    Operand::Target(t) => Pending::Label(Label::Original(*t)),
                    Operand::Targets(ts) => {
                        Pending::Labels(ts.iter().map(|t| Label::Original(*t)).collect())
                    }
                    other => Pending::Ready(other.clone()),
                };
                emitted.push(Emitted { opcode, operand });
                continue;
            };

            let next = body.instructions[index + 1].offset;
            let targets = instruction.operand.targets();
            let stub_labels: Vec<Label> = (0..targets.len())
                .map(|k| Label::Stub(stubs.len() + k))
                .collect();
            emitted.push(Emitted {
                opcode,
                operand: match instruction.operand {
                    Operand::Targets(_) => Pending::Labels(stub_labels),
                    _ => Pending::Label(stub_labels[0]),
                },
            });

            self.emit_probe(method, &mut emitted, paths[0])?;
            emitted.push(jump(Label::Original(next)));
            for (k, target) in targets.iter().enumerate() {
                stubs.push(emitted.len());
                self.emit_probe(method, &mut emitted, paths[k + 1])?;
                emitted.push(jump(Label::Original(*target)));
            }
        }

        // Every emitted instruction is in long form, so placeholder operands
        // already have their final size.
        let mut new_body = MethodBody {
            max_stack: body.max_stack,
            local_count: body.local_count,
            instructions: emitted
                .iter()
                .map(|e| {
                    let placeholder = match &e.operand {
                        Pending::Ready(op) => op.clone(),
                        Pending::Label(_) => Operand::Target(0),
                        Pending::Labels(ls) => Operand::Targets(vec![0; ls.len()]),
                    };
                    Instruction::new(e.opcode, placeholder)
                })
                .collect(),
            handlers: Vec::new(),
        };
        let new_size = new_body.compute_offsets();
        let offset_at = |i: usize| new_body.instructions.get(i).map_or(new_size, |x| x.offset);

        let resolve = |label: Label| -> CovetResult<u32> {
            match label {
                Label::Original(old) if old == old_size => Ok(new_size),
                Label::Original(old) => starts.get(&old).map(|&i| offset_at(i)).ok_or_else(|| {
                    CovetError::rewrite(method, format!("no instruction at IL_{old:04x}"))
                }),
                Label::Stub(id) => stubs.get(id).map(|&i| offset_at(i)).ok_or_else(|| {
                    CovetError::rewrite(method, format!("unresolved probe stub {id}"))
                }),
            }
        };

        let mut operands = Vec::with_capacity(emitted.len());
        for e in &emitted {
            operands.push(match &e.operand {
                Pending::Ready(op) => op.clone(),
                Pending::Label(l) => Operand::Target(resolve(*l)?),
                Pending::Labels(ls) => Operand::Targets(
                    ls.iter().map(|l| resolve(*l)).collect::<CovetResult<_>>()?,
                ),
            });
        }

        let mut handlers = Vec::with_capacity(body.handlers.len());
        for h in &body.handlers {
            handlers.push(ExceptionHandler {
                kind: h.kind,
                try_start: resolve(Label::Original(h.try_start))?,
                try_end: resolve(Label::Original(h.try_end))?,
                handler_start: resolve(Label::Original(h.handler_start))?,
                handler_end: resolve(Label::Original(h.handler_end))?,
                filter_start: h
                    .filter_start
                    .map(|f| resolve(Label::Original(f)))
                    .transpose()?,
            });
        }

        let offset_map: BTreeMap<u32, u32> = starts
            .iter()
            .map(|(&old, &i)| (old, offset_at(i)))
            .chain(std::iter::once((old_size, new_size)))
            .collect();
        let instruction_map: BTreeMap<u32, u32> = positions
            .iter()
            .map(|(&old, &i)| (old, offset_at(i)))
            .collect();

        for (instruction, operand) in new_body.instructions.iter_mut().zip(operands) {
            instruction.operand = operand;
        }
        new_body.handlers = handlers;

        let after = stack::analyze(&new_body, returns_value).map_err(fail)?;
        for (index, instruction) in body.instructions.iter().enumerate() {
            let Some(expected) = before.depths[index] else {
                continue;
            };
            let new_index = instruction_map
                .get(&instruction.offset)
                .and_then(|&o| new_body.index_of(o));
            let found = new_index.and_then(|i| after.depths[i]);
            if found != Some(expected) {
                return Err(CovetError::rewrite(
                    method,
                    format!(
                        "stack depth at IL_{:04x} changed from {expected} to {found:?}",
                        instruction.offset
                    ),
                ));
            }
        }
        new_body.max_stack = body.max_stack.max(after.max);

        Ok(RewrittenBody {
            body: new_body,
            offset_map,
            instruction_map,
        })
    }

    fn validate(&self, method: &str, body: &MethodBody, plan: &ProbePlan) -> CovetResult<()> {
        let code_size = body.code_size();
        let on_boundary = |offset: u32| body.index_of(offset).is_some();
        let on_boundary_or_end = |offset: u32| offset == code_size || on_boundary(offset);

        for instruction in &body.instructions {
            if !instruction.opcode.accepts(&instruction.operand) {
                return Err(CovetError::rewrite(
                    method,
                    format!(
                        "{:?} at IL_{:04x} has operand {:?}",
                        instruction.opcode, instruction.offset, instruction.operand
                    ),
                ));
            }
            if let Some(target) = instruction
                .operand
                .targets()
                .into_iter()
                .find(|t| !on_boundary(*t))
            {
                return Err(CovetError::rewrite(
                    method,
                    format!(
                        "branch at IL_{:04x} targets IL_{target:04x}, which is not an instruction",
                        instruction.offset
                    ),
                ));
            }
        }

        for h in &body.handlers {
            let starts = [Some(h.try_start), Some(h.handler_start), h.filter_start];
            let ends = [h.try_end, h.handler_end];
            if starts.into_iter().flatten().any(|o| !on_boundary(o))
                || ends.into_iter().any(|o| !on_boundary_or_end(o))
            {
                return Err(CovetError::rewrite(
                    method,
                    format!(
                        "handler region IL_{:04x}..IL_{:04x} is not on instruction boundaries",
                        h.try_start, h.handler_end
                    ),
                ));
            }
        }

        for (&offset, paths) in &plan.branches {
            let index = body.index_of(offset).ok_or_else(|| {
                CovetError::rewrite(method, format!("no instruction at IL_{offset:04x}"))
            })?;
            let instruction = &body.instructions[index];
            if !instruction.opcode.is_conditional_branch() {
                return Err(CovetError::rewrite(
                    method,
                    format!("IL_{offset:04x} is not a conditional branch"),
                ));
            }
            if index + 1 == body.instructions.len() {
                return Err(CovetError::rewrite(
                    method,
                    format!("conditional branch at IL_{offset:04x} ends the body"),
                ));
            }
            let targets = instruction.operand.targets().len();
            if targets == 0 {
                return Err(CovetError::rewrite(
                    method,
                    format!("conditional branch at IL_{offset:04x} has no targets"),
                ));
            }
            if paths.len() != targets + 1 {
                return Err(CovetError::rewrite(
                    method,
                    format!("branch at IL_{offset:04x} planned with {} paths", paths.len()),
                ));
            }
        }
        for &offset in plan.lines.keys() {
            if !on_boundary(offset) {
                return Err(CovetError::rewrite(
                    method,
                    format!("line probe at IL_{offset:04x} is not on an instruction"),
                ));
            }
        }
        Ok(())
    }

    fn emit_probe(&self, method: &str, emitted: &mut Vec<Emitted>, slot: SlotId) -> CovetResult<()> {
        let value = i32::try_from(slot.as_u32())
            .map_err(|_| CovetError::rewrite(method, "slot table too large"))?;
        emitted.push(Emitted {
            opcode: OpCode::LdcI4,
            operand: Pending::Ready(Operand::Int32(value)),
        });
        emitted.push(Emitted {
            opcode: OpCode::Call,
            operand: Pending::Ready(Operand::Method(self.record_hit.clone())),
        });
        Ok(())
    }
}

fn jump(label: Label) -> Emitted {
    Emitted {
        opcode: OpCode::Br,
        operand: Pending::Label(label),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::builder::{MethodBuilder, ModuleBuilder, TypeBuilder};
    use crate::image::HandlerKind;

    fn record_hit() -> MethodRef {
        MethodRef {
            declaring_type: "Covet.Tracker.m".into(),
            name: "RecordHit".into(),
            parameters: vec!["int32".into()],
            return_type: "void".into(),
            has_this: false,
        }
    }

    fn body(method: MethodBuilder) -> MethodBody {
        let (image, _) = ModuleBuilder::new("m")
            .ty(TypeBuilder::new(1, "N", "T").method(method))
            .build()
            .unwrap();
        image.types[0].methods[0].body.clone().unwrap()
    }

    fn is_probe(body: &MethodBody, index: usize, slot: i32) -> bool {
        body.instructions[index].operand == Operand::Int32(slot)
            && body.instructions[index + 1].opcode == OpCode::Call
    }

    fn branchy() -> MethodBody {
        body(
            MethodBuilder::new(1, "F")
                .param("int32")
                .returns("int32")
                .ldarg(0)
                .branch(OpCode::BrtrueS, "yes")
                .ldc(2)
                .op(OpCode::Ret)
                .mark("yes")
                .ldc(1)
                .op(OpCode::Ret),
        )
    }

    #[test]
    fn test_line_probe_captures_branch_target() {
        let original = branchy();
        let mut plan = ProbePlan::default();
        plan.add_line(11, SlotId::new(0));
        let out = ProbeInjector::new(record_hit())
            .inject("F", &original, true, &plan)
            .unwrap();

        let branch = &out.body.instructions[1];
        assert_eq!(branch.opcode, OpCode::Brtrue);
        let target = branch.operand.targets()[0];
        assert_eq!(Some(target), out.map_offset(11));
        let index = out.body.index_of(target).unwrap();
        assert!(is_probe(&out.body, index, 0));
        assert_eq!(
            out.instruction_offset(11),
            Some(target + 10),
            "ldc.i4 and call are 5 bytes each"
        );
    }

    #[test]
    fn test_branch_probe_layout() {
        let original = branchy();
        let mut plan = ProbePlan::default();
        let _ = plan.branches.insert(3, vec![SlotId::new(4), SlotId::new(5)]);
        let out = ProbeInjector::new(record_hit())
            .inject("F", &original, true, &plan)
            .unwrap();
        let ins = &out.body.instructions;

        // brtrue, probe(4), br next, stub: probe(5), br yes
        assert!(is_probe(&out.body, 2, 4));
        assert_eq!(ins[4].opcode, OpCode::Br);
        assert_eq!(ins[4].operand.targets()[0], out.map_offset(5).unwrap());
        let stub = ins[1].operand.targets()[0];
        assert_eq!(out.body.index_of(stub), Some(5));
        assert!(is_probe(&out.body, 5, 5));
        assert_eq!(ins[7].operand.targets()[0], out.map_offset(11).unwrap());
        assert_eq!(out.body.max_stack, 8);
    }

    #[test]
    fn test_switch_gets_one_stub_per_case() {
        let original = body(
            MethodBuilder::new(1, "F")
                .param("int32")
                .ldarg(0)
                .switch(["a", "b"])
                .op(OpCode::Ret)
                .mark("a")
                .op(OpCode::Ret)
                .mark("b")
                .op(OpCode::Ret),
        );
        let switch_offset = original.instructions[1].offset;
        let mut plan = ProbePlan::default();
        let _ = plan
            .branches
            .insert(switch_offset, vec![SlotId::new(0), SlotId::new(1), SlotId::new(2)]);
        let out = ProbeInjector::new(record_hit())
            .inject("F", &original, false, &plan)
            .unwrap();
        let stubs = out.body.instructions[1].operand.targets();
        assert_eq!(stubs.len(), 2);
        for (k, stub) in stubs.iter().enumerate() {
            let i = out.body.index_of(*stub).unwrap();
            assert!(is_probe(&out.body, i, k as i32 + 1));
        }
    }

    #[test]
    fn test_handlers_follow_probes() {
        let original = body(
            MethodBuilder::new(1, "F")
                .mark("try")
                .op(OpCode::Nop)
                .branch(OpCode::LeaveS, "end")
                .mark("catch")
                .op(OpCode::Pop)
                .branch(OpCode::LeaveS, "end")
                .mark("end")
                .op(OpCode::Ret)
                .handler(HandlerKind::Catch, "try", "catch", "catch", "end"),
        );
        let mut plan = ProbePlan::default();
        plan.add_line(0, SlotId::new(0));
        plan.add_line(3, SlotId::new(1));
        let out = ProbeInjector::new(record_hit())
            .inject("F", &original, false, &plan)
            .unwrap();
        let h = &out.body.handlers[0];
        assert_eq!(h.try_start, 0);
        assert_eq!(h.handler_start, out.map_offset(3).unwrap());
        assert_eq!(h.try_end, h.handler_start);
        assert!(is_probe(&out.body, out.body.index_of(h.handler_start).unwrap(), 1));
        // exception object plus probe value
        assert!(out.body.max_stack >= 2);
    }

    #[test]
    fn test_branch_at_end_is_rejected() {
        let original = MethodBody {
            max_stack: 1,
            local_count: 0,
            instructions: vec![
                Instruction {
                    offset: 0,
                    opcode: OpCode::Ldnull,
                    operand: Operand::None,
                },
                Instruction {
                    offset: 1,
                    opcode: OpCode::Brtrue,
                    operand: Operand::Target(0),
                },
            ],
            handlers: Vec::new(),
        };
        let mut plan = ProbePlan::default();
        let _ = plan.branches.insert(1, vec![SlotId::new(0), SlotId::new(1)]);
        let err = ProbeInjector::new(record_hit())
            .inject("F", &original, false, &plan)
            .unwrap_err();
        assert!(matches!(err, CovetError::Rewrite { .. }));
    }

    #[test]
    fn test_target_off_boundary_is_rejected() {
        let mut original = branchy();
        original.instructions[1].operand = Operand::Target(6);
        let err = ProbeInjector::new(record_hit())
            .inject("F", &original, true, &ProbePlan::default())
            .unwrap_err();
        assert!(matches!(err, CovetError::Rewrite { .. }));
    }

    #[test]
    fn test_branch_without_target_is_rejected() {
        let mut original = branchy();
        original.instructions[1].operand = Operand::None;
        let mut plan = ProbePlan::default();
        let _ = plan.branches.insert(3, vec![SlotId::new(0)]);
        let err = ProbeInjector::new(record_hit())
            .inject("F", &original, true, &plan)
            .unwrap_err();
        assert!(matches!(err, CovetError::Rewrite { .. }));
    }

    #[test]
    fn test_empty_plan_only_widens() {
        let out = ProbeInjector::new(record_hit())
            .inject("F", &branchy(), true, &ProbePlan::default())
            .unwrap();
        assert!(out.body.instructions.iter().all(|i| !i.opcode.is_short_branch()));
        assert_eq!(out.body.instructions.len(), 6);
    }
}
