//! Instruction set of the managed image.
//!
//! Every opcode encodes as one byte followed by its operand. Branch targets
//! are stored as absolute offsets; the short forms only accept targets whose
//! displacement from the next instruction fits in an `i8`.

use super::{MethodRef, Operand};
use serde::{Deserialize, Serialize};

/// How control leaves an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// Falls through to the next instruction
    Next,
    /// Unconditional jump
    Branch,
    /// Jumps or falls through
    CondBranch,
    /// Leaves a protected region, emptying the stack
    Leave,
    /// Returns from the method
    Return,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter handler
    EndHandler,
}

/// Operand shape an opcode expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// 32-bit immediate
    Int32,
    /// String token
    String,
    /// Argument or local index
    Var,
    /// One branch target, 1-byte displacement
    ShortTarget,
    /// One branch target, 4-byte displacement
    Target,
    /// Jump table
    Targets,
    /// Method token
    Method,
}

/// Opcodes
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Nop,
    Ldarg,
    Starg,
    Ldloc,
    Stloc,
    LdcI4,
    Ldstr,
    Ldnull,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Ceq,
    Cgt,
    Clt,
    Dup,
    Pop,
    Call,
    Callvirt,
    Newobj,
    Ret,
    Br,
    BrS,
    Brtrue,
    BrtrueS,
    Brfalse,
    BrfalseS,
    Beq,
    BeqS,
    BneUn,
    BneUnS,
    Blt,
    BltS,
    Bgt,
    BgtS,
    Ble,
    BleS,
    Bge,
    BgeS,
    Switch,
    Leave,
    LeaveS,
    Endfinally,
    Endfilter,
    Throw,
    Rethrow,
}

impl OpCode {
    /// Operand shape
    #[must_use]
    pub const fn operand_kind(self) -> OperandKind {
        match self {
            Self::LdcI4 => OperandKind::Int32,
            Self::Ldstr => OperandKind::String,
            Self::Ldarg | Self::Starg | Self::Ldloc | Self::Stloc => OperandKind::Var,
            Self::Call | Self::Callvirt | Self::Newobj => OperandKind::Method,
            Self::Switch => OperandKind::Targets,
            Self::BrS
            | Self::BrtrueS
            | Self::BrfalseS
            | Self::BeqS
            | Self::BneUnS
            | Self::BltS
            | Self::BgtS
            | Self::BleS
            | Self::BgeS
            | Self::LeaveS => OperandKind::ShortTarget,
            Self::Br
            | Self::Brtrue
            | Self::Brfalse
            | Self::Beq
            | Self::BneUn
            | Self::Blt
            | Self::Bgt
            | Self::Ble
            | Self::Bge
            | Self::Leave => OperandKind::Target,
            _ => OperandKind::None,
        }
    }

    /// Control flow class
    #[must_use]
    pub const fn flow_control(self) -> FlowControl {
        match self {
            Self::Br | Self::BrS => FlowControl::Branch,
            Self::Leave | Self::LeaveS => FlowControl::Leave,
            Self::Ret => FlowControl::Return,
            Self::Throw | Self::Rethrow => FlowControl::Throw,
            Self::Endfinally | Self::Endfilter => FlowControl::EndHandler,
            _ if self.is_conditional_branch() => FlowControl::CondBranch,
            _ => FlowControl::Next,
        }
    }

    /// Conditional two-way branches and `switch`
    #[must_use]
    pub const fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Self::Brtrue
                | Self::BrtrueS
                | Self::Brfalse
                | Self::BrfalseS
                | Self::Beq
                | Self::BeqS
                | Self::BneUn
                | Self::BneUnS
                | Self::Blt
                | Self::BltS
                | Self::Bgt
                | Self::BgtS
                | Self::Ble
                | Self::BleS
                | Self::Bge
                | Self::BgeS
                | Self::Switch
        )
    }

    /// Whether this is a short-form branch
    #[must_use]
    pub const fn is_short_branch(self) -> bool {
        matches!(self.operand_kind(), OperandKind::ShortTarget)
    }

    /// The long form of a short branch; other opcodes map to themselves
    #[must_use]
    pub const fn long_form(self) -> Self {
        match self {
            Self::BrS => Self::Br,
            Self::BrtrueS => Self::Brtrue,
            Self::BrfalseS => Self::Brfalse,
            Self::BeqS => Self::Beq,
            Self::BneUnS => Self::BneUn,
            Self::BltS => Self::Blt,
            Self::BgtS => Self::Bgt,
            Self::BleS => Self::Ble,
            Self::BgeS => Self::Bge,
            Self::LeaveS => Self::Leave,
            other => other,
        }
    }

    /// Encoded size in bytes including the operand
    #[must_use]
    pub fn size(self, operand: &Operand) -> u32 {
        1 + match self.operand_kind() {
            OperandKind::None => 0,
            OperandKind::ShortTarget => 1,
            OperandKind::Var => 2,
            OperandKind::Int32 | OperandKind::String | OperandKind::Target | OperandKind::Method => 4,
            OperandKind::Targets => match operand {
                Operand::Targets(targets) => 4 + 4 * targets.len() as u32,
                _ => 4,
            },
        }
    }

    /// Whether `operand` has the shape this opcode needs
    #[must_use]
    pub fn accepts(self, operand: &Operand) -> bool {
        matches!(
            (self.operand_kind(), operand),
            (OperandKind::None, Operand::None)
                | (OperandKind::Int32, Operand::Int32(_))
                | (OperandKind::String, Operand::String(_))
                | (OperandKind::Var, Operand::Var(_))
                | (OperandKind::ShortTarget | OperandKind::Target, Operand::Target(_))
                | (OperandKind::Targets, Operand::Targets(_))
                | (OperandKind::Method, Operand::Method(_))
        )
    }

    /// Values popped and pushed
    ///
    /// `returns_value` describes the enclosing method and only matters for
    /// `ret`.
    #[must_use]
    pub fn stack_effect(self, operand: &Operand, returns_value: bool) -> (u16, u16) {
        match self {
            Self::Nop
            | Self::Br
            | Self::BrS
            | Self::Leave
            | Self::LeaveS
            | Self::Endfinally
            | Self::Rethrow => (0, 0),
            Self::Ldarg | Self::Ldloc | Self::LdcI4 | Self::Ldstr | Self::Ldnull => (0, 1),
            Self::Starg
            | Self::Stloc
            | Self::Pop
            | Self::Brtrue
            | Self::BrtrueS
            | Self::Brfalse
            | Self::BrfalseS
            | Self::Switch
            | Self::Endfilter
            | Self::Throw => (1, 0),
            Self::Neg | Self::Not => (1, 1),
            Self::Dup => (1, 2),
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Rem
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::Ceq
            | Self::Cgt
            | Self::Clt => (2, 1),
            Self::Beq
            | Self::BeqS
            | Self::BneUn
            | Self::BneUnS
            | Self::Blt
            | Self::BltS
            | Self::Bgt
            | Self::BgtS
            | Self::Ble
            | Self::BleS
            | Self::Bge
            | Self::BgeS => (2, 0),
            Self::Call | Self::Callvirt => match operand {
                Operand::Method(m) => (m.pops(), m.pushes()),
                _ => (0, 0),
            },
            Self::Newobj => match operand {
                Operand::Method(m) => (m.parameters.len() as u16, 1),
                _ => (0, 1),
            },
            Self::Ret => (u16::from(returns_value), 0),
        }
    }
}

impl MethodRef {
    /// Values a call to this method pops
    #[must_use]
    pub fn pops(&self) -> u16 {
        self.parameters.len() as u16 + u16::from(self.has_this)
    }

    /// Values a call to this method pushes
    #[must_use]
    pub fn pushes(&self) -> u16 {
        u16::from(self.return_type != "void")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_branches_widen() {
        assert_eq!(OpCode::BrtrueS.long_form(), OpCode::Brtrue);
        assert_eq!(OpCode::LeaveS.long_form(), OpCode::Leave);
        assert_eq!(OpCode::Add.long_form(), OpCode::Add);
        assert!(OpCode::BgeS.is_short_branch());
        assert!(!OpCode::Bge.is_short_branch());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(OpCode::Nop.size(&Operand::None), 1);
        assert_eq!(OpCode::BrS.size(&Operand::Target(0)), 2);
        assert_eq!(OpCode::Br.size(&Operand::Target(0)), 5);
        assert_eq!(OpCode::Ldloc.size(&Operand::Var(1)), 3);
        assert_eq!(OpCode::Switch.size(&Operand::Targets(vec![1, 2, 3])), 17);
    }

    #[test]
    fn test_flow_control() {
        assert_eq!(OpCode::Brfalse.flow_control(), FlowControl::CondBranch);
        assert_eq!(OpCode::Switch.flow_control(), FlowControl::CondBranch);
        assert_eq!(OpCode::Br.flow_control(), FlowControl::Branch);
        assert_eq!(OpCode::Leave.flow_control(), FlowControl::Leave);
        assert_eq!(OpCode::Ret.flow_control(), FlowControl::Return);
        assert_eq!(OpCode::Ldarg.flow_control(), FlowControl::Next);
    }

    #[test]
    fn test_call_stack_effect_follows_signature() {
        let record_hit = MethodRef {
            declaring_type: "T".into(),
            name: "RecordHit".into(),
            parameters: vec!["int32".into()],
            return_type: "void".into(),
            has_this: false,
        };
        let op = Operand::Method(record_hit);
        assert_eq!(OpCode::Call.stack_effect(&op, false), (1, 0));
        assert_eq!(OpCode::Ret.stack_effect(&Operand::None, true), (1, 0));
        assert_eq!(OpCode::Ret.stack_effect(&Operand::None, false), (0, 0));
    }

    #[test]
    fn test_accepts_operand_shapes() {
        assert!(OpCode::LdcI4.accepts(&Operand::Int32(4)));
        assert!(!OpCode::LdcI4.accepts(&Operand::None));
        assert!(OpCode::BrS.accepts(&Operand::Target(3)));
        assert!(!OpCode::Switch.accepts(&Operand::Target(3)));
    }
}
