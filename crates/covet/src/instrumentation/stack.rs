//! Evaluation stack analysis
//!
//! Walks the control-flow graph of a body and assigns every reachable
//! instruction the stack depth on entry. Paths joining at an instruction must
//! agree on the depth.
//!
//! Entry points: the first instruction at depth 0, catch and filter blocks at
//! depth 1 (the exception object), finally and fault blocks at depth 0.
//! `leave` empties the stack; `ret`, `throw`, `rethrow`, `endfinally` and
//! `endfilter` end a path.

use crate::image::{FlowControl, HandlerKind, MethodBody};
use thiserror::Error;

/// Stack discipline violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// Instruction pops more than the stack holds
    #[error("stack underflow at IL_{offset:04x}")]
    Underflow {
        /// Instruction offset
        offset: u32,
    },
    /// Two paths reach an instruction with different depths
    #[error("stack depth mismatch at IL_{offset:04x}: {first} vs {second}")]
    Mismatch {
        /// Instruction offset
        offset: u32,
        /// Depth seen first
        first: u16,
        /// Conflicting depth
        second: u16,
    },
    /// Branch or handler entry not on an instruction boundary
    #[error("target IL_{target:04x} referenced at IL_{offset:04x} is not an instruction")]
    BadTarget {
        /// Referencing instruction offset
        offset: u32,
        /// Target offset
        target: u32,
    },
    /// Control runs past the last instruction
    #[error("control falls off the end of the body after IL_{offset:04x}")]
    FallsOffEnd {
        /// Last instruction offset
        offset: u32,
    },
}

/// Result of the analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDepths {
    /// Entry depth per instruction index, `None` when unreachable
    pub depths: Vec<Option<u16>>,
    /// Deepest stack seen
    pub max: u16,
}

/// Analyze `body`; `returns_value` controls what `ret` pops
pub fn analyze(body: &MethodBody, returns_value: bool) -> Result<StackDepths, StackError> {
    let count = body.instructions.len();
    let mut depths: Vec<Option<u16>> = vec![None; count];
    let mut worklist: Vec<(usize, u16)> = Vec::new();
    let mut max = 0u16;

    if count > 0 {
        worklist.push((0, 0));
    }
    for handler in &body.handlers {
        let depth = match handler.kind {
            HandlerKind::Catch | HandlerKind::Filter => 1,
            HandlerKind::Finally | HandlerKind::Fault => 0,
        };
        let mut entries = vec![handler.handler_start];
        entries.extend(handler.filter_start);
        for entry in entries {
            let index = body.index_of(entry).ok_or(StackError::BadTarget {
                offset: handler.try_start,
                target: entry,
            })?;
            worklist.push((index, depth));
        }
    }

    while let Some((index, depth)) = worklist.pop() {
        let instruction = &body.instructions[index];
        match depths[index] {
            Some(seen) if seen == depth => continue,
            Some(seen) => {
                return Err(StackError::Mismatch {
                    offset: instruction.offset,
                    first: seen,
                    second: depth,
                })
            }
            None => depths[index] = Some(depth),
        }

        let (pops, pushes) = instruction
            .opcode
            .stack_effect(&instruction.operand, returns_value);
        let after = depth
            .checked_sub(pops)
            .ok_or(StackError::Underflow {
                offset: instruction.offset,
            })?
            + pushes;
        max = max.max(depth).max(after);

        let target_index = |target: u32| {
            body.index_of(target).ok_or(StackError::BadTarget {
                offset: instruction.offset,
                target,
            })
        };
        let next = || {
            if index + 1 < count {
                Ok(index + 1)
            } else {
                Err(StackError::FallsOffEnd {
                    offset: instruction.offset,
                })
            }
        };

        match instruction.opcode.flow_control() {
            FlowControl::Next => worklist.push((next()?, after)),
            FlowControl::Branch => {
                for target in instruction.operand.targets() {
                    worklist.push((target_index(target)?, after));
                }
            }
            FlowControl::CondBranch => {
                worklist.push((next()?, after));
                for target in instruction.operand.targets() {
                    worklist.push((target_index(target)?, after));
                }
            }
            FlowControl::Leave => {
                for target in instruction.operand.targets() {
                    worklist.push((target_index(target)?, 0));
                }
            }
            FlowControl::Return | FlowControl::Throw | FlowControl::EndHandler => {}
        }
    }

    Ok(StackDepths { depths, max })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::builder::{MethodBuilder, ModuleBuilder, TypeBuilder};
    use crate::image::OpCode;

    fn body(method: MethodBuilder) -> (MethodBody, bool) {
        let (image, _) = ModuleBuilder::new("m")
            .ty(TypeBuilder::new(1, "N", "T").method(method))
            .build()
            .unwrap();
        let def = &image.types[0].methods[0];
        (def.body.clone().unwrap(), def.returns_value())
    }

    #[test]
    fn test_straight_line_depths() {
        let (b, ret) = body(
            MethodBuilder::new(1, "F")
                .returns("int32")
                .ldc(1)
                .ldc(2)
                .op(OpCode::Add)
                .op(OpCode::Ret),
        );
        let result = analyze(&b, ret).unwrap();
        assert_eq!(result.depths, vec![Some(0), Some(1), Some(2), Some(1)]);
        assert_eq!(result.max, 2);
    }

    #[test]
    fn test_unreachable_code_has_no_depth() {
        let (b, ret) = body(
            MethodBuilder::new(1, "F")
                .branch(OpCode::Br, "end")
                .op(OpCode::Nop)
                .mark("end")
                .op(OpCode::Ret),
        );
        assert_eq!(analyze(&b, ret).unwrap().depths, vec![Some(0), None, Some(0)]);
    }

    #[test]
    fn test_join_mismatch() {
        let (b, ret) = body(
            MethodBuilder::new(1, "F")
                .param("int32")
                .ldarg(0)
                .branch(OpCode::Brtrue, "join")
                .ldc(5)
                .mark("join")
                .op(OpCode::Ret),
        );
        assert!(matches!(analyze(&b, ret), Err(StackError::Mismatch { .. })));
    }

    #[test]
    fn test_underflow() {
        let (b, ret) = body(MethodBuilder::new(1, "F").op(OpCode::Pop).op(OpCode::Ret));
        assert_eq!(analyze(&b, ret), Err(StackError::Underflow { offset: 0 }));
    }

    #[test]
    fn test_falls_off_end() {
        let (b, ret) = body(MethodBuilder::new(1, "F").op(OpCode::Nop));
        assert_eq!(analyze(&b, ret), Err(StackError::FallsOffEnd { offset: 0 }));
    }

    #[test]
    fn test_catch_handler_starts_with_exception() {
        let (b, ret) = body(
            MethodBuilder::new(1, "F")
                .mark("try")
                .op(OpCode::Nop)
                .branch(OpCode::Leave, "end")
                .mark("catch")
                .op(OpCode::Pop)
                .branch(OpCode::Leave, "end")
                .mark("end")
                .op(OpCode::Ret)
                .handler(HandlerKind::Catch, "try", "catch", "catch", "end"),
        );
        let result = analyze(&b, ret).unwrap();
        assert_eq!(result.depths[2], Some(1));
        assert_eq!(result.depths[4], Some(0));
    }
}
