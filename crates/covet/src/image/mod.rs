//! Managed Image Model
//!
//! A module image holds types, methods and method bodies of a stack-machine
//! module in the usual managed-IL shape: typed instructions with absolute
//! branch targets, exception-handler regions, custom attributes, and an
//! optional embedded symbol table.
//!
//! ```text
//! ModuleImage
//! ├── references, flags
//! ├── TypeDef (token, namespace, name, declaring type, attributes)
//! │   └── MethodDef (token, signature, attributes, semantics)
//! │       └── MethodBody (max stack, locals, instructions, handlers)
//! └── TrackerBinding (present once instrumented)
//! ```

pub mod builder;
mod codec;
mod opcode;

pub use codec::{decode_image, encode_image, read_image, IMAGE_MAGIC, IMAGE_VERSION};
pub use opcode::{FlowControl, OpCode, OperandKind};

use crate::symbols::SymbolTable;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Reference to a method, as used by `call`, `callvirt` and `newobj`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Full name of the declaring type
    pub declaring_type: String,
    /// Method name
    pub name: String,
    /// Parameter type names
    pub parameters: Vec<String>,
    /// Return type name, `void` for none
    pub return_type: String,
    /// Whether an instance is passed first
    pub has_this: bool,
}

/// Instruction operand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand
    None,
    /// Immediate integer
    Int32(i32),
    /// String literal
    String(String),
    /// Argument or local index
    Var(u16),
    /// Absolute branch target offset
    Target(u32),
    /// Jump table of absolute offsets
    Targets(Vec<u32>),
    /// Called method
    Method(MethodRef),
}

impl Operand {
    /// Branch targets referenced by this operand
    #[must_use]
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Self::Target(t) => vec![*t],
            Self::Targets(ts) => ts.clone(),
            _ => Vec::new(),
        }
    }
}

/// One instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Byte offset within the body
    pub offset: u32,
    /// Opcode
    pub opcode: OpCode,
    /// Operand
    pub operand: Operand,
}

impl Instruction {
    /// Create an instruction at offset 0; offsets are fixed by
    /// [`MethodBody::compute_offsets`]
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Self {
            offset: 0,
            opcode,
            operand,
        }
    }

    /// Encoded size
    #[must_use]
    pub fn size(&self) -> u32 {
        self.opcode.size(&self.operand)
    }
}

/// Exception handler kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Typed catch, exception object on the stack at handler start
    Catch,
    /// Filter block at `filter_start`, then handler
    Filter,
    /// Finally block
    Finally,
    /// Fault block
    Fault,
}

/// Protected region and its handler; ends are exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    /// Handler kind
    pub kind: HandlerKind,
    /// First instruction of the try block
    pub try_start: u32,
    /// First instruction after the try block
    pub try_end: u32,
    /// First instruction of the handler
    pub handler_start: u32,
    /// First instruction after the handler
    pub handler_end: u32,
    /// First instruction of the filter block, for [`HandlerKind::Filter`]
    pub filter_start: Option<u32>,
}

/// Method body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBody {
    /// Declared maximum evaluation stack depth
    pub max_stack: u16,
    /// Number of locals
    pub local_count: u16,
    /// Instructions in offset order
    pub instructions: Vec<Instruction>,
    /// Exception handlers, innermost first
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Assign offsets from encoded sizes; returns the code size
    pub fn compute_offsets(&mut self) -> u32 {
        let mut offset = 0;
        for instruction in &mut self.instructions {
            instruction.offset = offset;
            offset += instruction.size();
        }
        offset
    }

    /// Offset one past the last instruction
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.instructions.last().map_or(0, |i| i.offset + i.size())
    }

    /// Index of the instruction starting at `offset`
    #[must_use]
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&offset, |i| i.offset)
            .ok()
    }
}

/// Custom attribute applied to a type or method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAttribute {
    /// Fully qualified attribute type name
    pub type_name: String,
}

impl CustomAttribute {
    /// Create an attribute reference
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }

    /// Name without namespace or enclosing types
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.type_name
            .rsplit(['.', '/'])
            .next()
            .unwrap_or(&self.type_name)
    }
}

/// Role of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MethodSemantics {
    /// Ordinary method
    #[default]
    Normal,
    /// Constructor
    Constructor,
    /// Property getter
    Getter,
    /// Property setter
    Setter,
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Metadata token, unique in the module
    pub token: u32,
    /// Method name
    pub name: String,
    /// Return type name
    pub return_type: String,
    /// Parameter type names
    pub parameters: Vec<String>,
    /// Instance method
    pub has_this: bool,
    /// Role
    pub semantics: MethodSemantics,
    /// Attributes
    pub attributes: Vec<CustomAttribute>,
    /// Body, absent for abstract and runtime-provided methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Whether `ret` pops a value
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.return_type != "void"
    }
}

/// Type definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Metadata token, unique in the module
    pub token: u32,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Token of the enclosing type
    pub declaring_type: Option<u32>,
    /// Attributes
    pub attributes: Vec<CustomAttribute>,
    /// Methods
    pub methods: Vec<MethodDef>,
}

/// How the run-time host allocates a module's counter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bootstrap {
    /// Lazily through the process-wide registry
    Registry,
    /// Eagerly, as a fixed table that needs no registry or allocation
    Embedded,
}

/// Written into an image when it is instrumented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerBinding {
    /// Run identifier
    pub run_id: String,
    /// Registry key
    pub key: String,
    /// Where counters are flushed
    pub hits_file: PathBuf,
    /// Number of slots
    pub slot_count: u32,
    /// Record at most one hit per slot
    pub single_hit: bool,
    /// Counter table allocation strategy
    pub bootstrap: Bootstrap,
    /// Full name of the injected tracker type
    pub tracker_type: String,
}

impl TrackerBinding {
    /// Name of the probe method on the tracker type
    pub const RECORD_HIT: &'static str = "RecordHit";

    /// Reference used by every probe
    #[must_use]
    pub fn record_hit_ref(&self) -> MethodRef {
        MethodRef {
            declaring_type: self.tracker_type.clone(),
            name: Self::RECORD_HIT.to_string(),
            parameters: vec!["int32".to_string()],
            return_type: "void".to_string(),
            has_this: false,
        }
    }

    /// Registry parameters for the run-time host
    #[must_use]
    pub fn tracker_spec(&self) -> covet_tracker::TrackerSpec {
        covet_tracker::TrackerSpec {
            key: self.key.clone(),
            run_id: self.run_id.clone(),
            hits_file: self.hits_file.clone(),
            slot_count: self.slot_count as usize,
            single_hit: self.single_hit,
        }
    }
}

/// Whole module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    /// Module name
    pub name: String,
    /// Module version id, matched against the symbol table
    pub mvid: Uuid,
    /// Names of referenced modules
    pub references: Vec<String>,
    /// Part of the runtime's system libraries
    pub system: bool,
    /// Module-level attributes
    pub attributes: Vec<CustomAttribute>,
    /// Types in token order
    pub types: Vec<TypeDef>,
    /// Symbols carried inside the image instead of a sidecar file
    pub embedded_symbols: Option<SymbolTable>,
    /// Present once instrumented
    pub tracker: Option<TrackerBinding>,
}

impl ModuleImage {
    /// Create an empty image
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mvid: Uuid::new_v4(),
            references: Vec::new(),
            system: false,
            attributes: Vec::new(),
            types: Vec::new(),
            embedded_symbols: None,
            tracker: None,
        }
    }

    /// Whether a tracker binding is present
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.tracker.is_some()
    }

    /// The runtime's own core library: a system module referencing nothing
    #[must_use]
    pub fn is_foundational(&self) -> bool {
        self.system && self.references.is_empty()
    }

    /// Type with `token`
    #[must_use]
    pub fn type_by_token(&self, token: u32) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.token == token)
    }

    /// Enclosing types of `ty`, innermost first
    #[must_use]
    pub fn enclosing_types(&self, ty: &TypeDef) -> Vec<&TypeDef> {
        let mut chain = Vec::new();
        let mut next = ty.declaring_type;
        while let Some(token) = next {
            match self.type_by_token(token) {
                Some(parent) if !chain.iter().any(|t: &&TypeDef| t.token == parent.token) => {
                    chain.push(parent);
                    next = parent.declaring_type;
                }
                _ => break,
            }
        }
        chain
    }

    /// Outermost enclosing type, or `ty` itself
    #[must_use]
    pub fn outermost<'a>(&'a self, ty: &'a TypeDef) -> &'a TypeDef {
        self.enclosing_types(ty).last().copied().unwrap_or(ty)
    }

    /// `Namespace.Outer/Inner`
    #[must_use]
    pub fn type_full_name(&self, ty: &TypeDef) -> String {
        let mut parts: Vec<&TypeDef> = self.enclosing_types(ty);
        parts.reverse();
        parts.push(ty);

        let mut name = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i == 0 {
                if !part.namespace.is_empty() {
                    name.push_str(&part.namespace);
                    name.push('.');
                }
            } else {
                name.push('/');
            }
            name.push_str(&part.name);
        }
        name
    }

    /// `ReturnType Namespace.Type::Name(P1,P2)`
    #[must_use]
    pub fn method_signature(&self, ty: &TypeDef, method: &MethodDef) -> String {
        format!(
            "{} {}::{}({})",
            method.return_type,
            self.type_full_name(ty),
            method.name,
            method.parameters.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(token: u32, ns: &str, name: &str, parent: Option<u32>) -> TypeDef {
        TypeDef {
            token,
            namespace: ns.to_string(),
            name: name.to_string(),
            declaring_type: parent,
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    #[test]
    fn test_nested_full_name() {
        let mut image = ModuleImage::new("m");
        image.types.push(ty(1, "App.Core", "Outer", None));
        image.types.push(ty(2, "", "Inner", Some(1)));
        image.types.push(ty(3, "", "<>c", Some(2)));

        let inner = &image.types[2];
        assert_eq!(image.type_full_name(inner), "App.Core.Outer/Inner/<>c");
        assert_eq!(image.outermost(inner).name, "Outer");
    }

    #[test]
    fn test_method_signature() {
        let mut image = ModuleImage::new("m");
        image.types.push(ty(1, "App", "Calc", None));
        let method = MethodDef {
            token: 10,
            name: "Add".into(),
            return_type: "int32".into(),
            parameters: vec!["int32".into(), "int32".into()],
            has_this: true,
            semantics: MethodSemantics::Normal,
            attributes: Vec::new(),
            body: None,
        };
        assert_eq!(
            image.method_signature(&image.types[0], &method),
            "int32 App.Calc::Add(int32,int32)"
        );
    }

    #[test]
    fn test_attribute_short_name() {
        let attr = CustomAttribute::new("System.Diagnostics.CodeAnalysis.ExcludeFromCodeCoverageAttribute");
        assert_eq!(attr.short_name(), "ExcludeFromCodeCoverageAttribute");
        assert_eq!(CustomAttribute::new("Plain").short_name(), "Plain");
    }

    #[test]
    fn test_compute_offsets() {
        let mut body = MethodBody {
            max_stack: 1,
            local_count: 0,
            instructions: vec![
                Instruction::new(OpCode::LdcI4, Operand::Int32(1)),
                Instruction::new(OpCode::BrS, Operand::Target(0)),
                Instruction::new(OpCode::Ret, Operand::None),
            ],
            handlers: Vec::new(),
        };
        assert_eq!(body.compute_offsets(), 8);
        assert_eq!(body.instructions[2].offset, 7);
        assert_eq!(body.index_of(5), Some(1));
        assert_eq!(body.index_of(6), None);
    }

    #[test]
    fn test_foundational_requires_system_without_references() {
        let mut image = ModuleImage::new("corelib");
        assert!(!image.is_foundational());
        image.system = true;
        assert!(image.is_foundational());
        image.references.push("other".into());
        assert!(!image.is_foundational());
    }
}
