//! Fluent builder for module images and their symbol tables.
//!
//! Branch targets and handler boundaries are written as named labels and
//! resolved to offsets when the module is built. Source positions are attached
//! to the next emitted instruction.
//!
//! # Example
//!
//! ```rust
//! use covet::image::builder::{MethodBuilder, ModuleBuilder, TypeBuilder};
//! use covet::image::OpCode;
//!
//! let (image, symbols) = ModuleBuilder::new("Calc")
//!     .ty(TypeBuilder::new(0x0200_0001, "App", "Calc").method(
//!         MethodBuilder::new(0x0600_0001, "Answer")
//!             .returns("int32")
//!             .line("src/Calc.cs", 10)
//!             .ldc(42)
//!             .op(OpCode::Ret),
//!     ))
//!     .build()
//!     .unwrap();
//! assert_eq!(symbols.documents, vec!["src/Calc.cs".to_string()]);
//! assert_eq!(image.types[0].methods[0].name, "Answer");
//! ```

use super::{
    encode_image, CustomAttribute, ExceptionHandler, HandlerKind, Instruction, MethodBody,
    MethodDef, MethodRef, MethodSemantics, ModuleImage, OpCode, Operand, TypeDef,
};
use crate::result::{CovetError, CovetResult};
use crate::symbols::{SequencePoint, SymbolMap, SymbolTable, HIDDEN_LINE};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone)]
enum PendingOperand {
    Ready(Operand),
    Label(String),
    Labels(Vec<String>),
}

#[derive(Debug, Clone)]
struct PendingPoint {
    index: usize,
    document: Option<String>,
    start_line: u32,
    end_line: u32,
    start_column: u32,
    end_column: u32,
}

#[derive(Debug, Clone)]
struct PendingHandler {
    kind: HandlerKind,
    try_start: String,
    try_end: String,
    handler_start: String,
    handler_end: String,
    filter_start: Option<String>,
}

/// Builder for one method
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    token: u32,
    name: String,
    return_type: String,
    parameters: Vec<String>,
    has_this: bool,
    semantics: MethodSemantics,
    attributes: Vec<CustomAttribute>,
    has_body: bool,
    max_stack: u16,
    local_count: u16,
    code: Vec<(OpCode, PendingOperand)>,
    labels: HashMap<String, usize>,
    points: Vec<PendingPoint>,
    handlers: Vec<PendingHandler>,
}

impl MethodBuilder {
    /// Create a static `void` method with an empty body
    #[must_use]
    pub fn new(token: u32, name: impl Into<String>) -> Self {
        Self {
            token,
            name: name.into(),
            return_type: "void".to_string(),
            parameters: Vec::new(),
            has_this: false,
            semantics: MethodSemantics::Normal,
            attributes: Vec::new(),
            has_body: true,
            max_stack: 8,
            local_count: 0,
            code: Vec::new(),
            labels: HashMap::new(),
            points: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Set the return type
    #[must_use]
    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    /// Append a parameter
    #[must_use]
    pub fn param(mut self, ty: impl Into<String>) -> Self {
        self.parameters.push(ty.into());
        self
    }

    /// Make it an instance method
    #[must_use]
    pub fn instance(mut self) -> Self {
        self.has_this = true;
        self
    }

    /// Set the method role
    #[must_use]
    pub fn semantics(mut self, semantics: MethodSemantics) -> Self {
        self.semantics = semantics;
        self
    }

    /// Apply a custom attribute
    #[must_use]
    pub fn attribute(mut self, type_name: impl Into<String>) -> Self {
        self.attributes.push(CustomAttribute::new(type_name));
        self
    }

    /// Declare the method without a body
    #[must_use]
    pub fn without_body(mut self) -> Self {
        self.has_body = false;
        self
    }

    /// Declared maximum stack depth
    #[must_use]
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Number of locals
    #[must_use]
    pub fn locals(mut self, count: u16) -> Self {
        self.local_count = count;
        self
    }

    /// Name the next instruction (or the end of the body)
    #[must_use]
    pub fn mark(mut self, label: impl Into<String>) -> Self {
        let _ = self.labels.insert(label.into(), self.code.len());
        self
    }

    /// Sequence point for one line at the next instruction
    #[must_use]
    pub fn line(self, document: impl Into<String>, line: u32) -> Self {
        self.span(document, line, line)
    }

    /// Sequence point spanning `start..=end` at the next instruction
    #[must_use]
    pub fn span(mut self, document: impl Into<String>, start: u32, end: u32) -> Self {
        self.points.push(PendingPoint {
            index: self.code.len(),
            document: Some(document.into()),
            start_line: start,
            end_line: end,
            start_column: 9,
            end_column: 10,
        });
        self
    }

    /// Hidden sequence point at the next instruction
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.points.push(PendingPoint {
            index: self.code.len(),
            document: None,
            start_line: HIDDEN_LINE,
            end_line: HIDDEN_LINE,
            start_column: 0,
            end_column: 0,
        });
        self
    }

    /// Emit an instruction with a ready operand
    #[must_use]
    pub fn emit(mut self, opcode: OpCode, operand: Operand) -> Self {
        self.code.push((opcode, PendingOperand::Ready(operand)));
        self
    }

    /// Emit an operand-less instruction
    #[must_use]
    pub fn op(self, opcode: OpCode) -> Self {
        self.emit(opcode, Operand::None)
    }

    /// `ldc.i4`
    #[must_use]
    pub fn ldc(self, value: i32) -> Self {
        self.emit(OpCode::LdcI4, Operand::Int32(value))
    }

    /// `ldarg`
    #[must_use]
    pub fn ldarg(self, index: u16) -> Self {
        self.emit(OpCode::Ldarg, Operand::Var(index))
    }

    /// `ldloc`
    #[must_use]
    pub fn ldloc(self, index: u16) -> Self {
        self.emit(OpCode::Ldloc, Operand::Var(index))
    }

    /// `stloc`
    #[must_use]
    pub fn stloc(self, index: u16) -> Self {
        self.emit(OpCode::Stloc, Operand::Var(index))
    }

    /// `ldstr`
    #[must_use]
    pub fn ldstr(self, value: impl Into<String>) -> Self {
        self.emit(OpCode::Ldstr, Operand::String(value.into()))
    }

    /// `call`
    #[must_use]
    pub fn call(self, method: MethodRef) -> Self {
        self.emit(OpCode::Call, Operand::Method(method))
    }

    /// Branch or `leave` to a label
    #[must_use]
    pub fn branch(mut self, opcode: OpCode, label: impl Into<String>) -> Self {
        self.code.push((opcode, PendingOperand::Label(label.into())));
        self
    }

    /// `switch` over labels
    #[must_use]
    pub fn switch<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
        let labels = labels.into_iter().map(Into::into).collect();
        self.code.push((OpCode::Switch, PendingOperand::Labels(labels)));
        self
    }

    /// Protected region with a catch, finally or fault handler
    #[must_use]
    pub fn handler(
        mut self,
        kind: HandlerKind,
        try_start: impl Into<String>,
        try_end: impl Into<String>,
        handler_start: impl Into<String>,
        handler_end: impl Into<String>,
    ) -> Self {
        self.handlers.push(PendingHandler {
            kind,
            try_start: try_start.into(),
            try_end: try_end.into(),
            handler_start: handler_start.into(),
            handler_end: handler_end.into(),
            filter_start: None,
        });
        self
    }

    /// Protected region with a filter block
    #[must_use]
    pub fn filter_handler(
        mut self,
        try_start: impl Into<String>,
        try_end: impl Into<String>,
        filter_start: impl Into<String>,
        handler_start: impl Into<String>,
        handler_end: impl Into<String>,
    ) -> Self {
        self.handlers.push(PendingHandler {
            kind: HandlerKind::Filter,
            try_start: try_start.into(),
            try_end: try_end.into(),
            handler_start: handler_start.into(),
            handler_end: handler_end.into(),
            filter_start: Some(filter_start.into()),
        });
        self
    }

    fn finish(
        self,
        documents: &mut Vec<String>,
        symbols: &mut BTreeMap<u32, Vec<SequencePoint>>,
    ) -> CovetResult<MethodDef> {
        let mut def = MethodDef {
            token: self.token,
            name: self.name,
            return_type: self.return_type,
            parameters: self.parameters,
            has_this: self.has_this,
            semantics: self.semantics,
            attributes: self.attributes,
            body: None,
        };
        if !self.has_body {
            return Ok(def);
        }

        // Placeholder operands have the final size, so offsets are exact.
        let mut body = MethodBody {
            max_stack: self.max_stack,
            local_count: self.local_count,
            instructions: self
                .code
                .iter()
                .map(|(opcode, operand)| {
                    let placeholder = match operand {
                        PendingOperand::Ready(op) => op.clone(),
                        PendingOperand::Label(_) => Operand::Target(0),
                        PendingOperand::Labels(ls) => Operand::Targets(vec![0; ls.len()]),
                    };
                    Instruction::new(*opcode, placeholder)
                })
                .collect(),
            handlers: Vec::new(),
        };
        let code_size = body.compute_offsets();

        let offset_of = |index: usize| -> u32 {
            body.instructions
                .get(index)
                .map_or(code_size, |i| i.offset)
        };
        let resolve = |label: &str| -> CovetResult<u32> {
            self.labels.get(label).map(|&i| offset_of(i)).ok_or_else(|| {
                CovetError::config(format!("undefined label '{label}' in method {}", def.name))
            })
        };

        let mut operands = Vec::with_capacity(self.code.len());
        for (_, operand) in &self.code {
            operands.push(match operand {
                PendingOperand::Ready(op) => op.clone(),
                PendingOperand::Label(l) => Operand::Target(resolve(l)?),
                PendingOperand::Labels(ls) => Operand::Targets(
                    ls.iter().map(|l| resolve(l)).collect::<CovetResult<_>>()?,
                ),
            });
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for h in &self.handlers {
            handlers.push(ExceptionHandler {
                kind: h.kind,
                try_start: resolve(&h.try_start)?,
                try_end: resolve(&h.try_end)?,
                handler_start: resolve(&h.handler_start)?,
                handler_end: resolve(&h.handler_end)?,
                filter_start: h.filter_start.as_deref().map(resolve).transpose()?,
            });
        }

        let mut points = Vec::with_capacity(self.points.len());
        for p in &self.points {
            let document = match &p.document {
                Some(path) => intern(documents, path),
                None => 0,
            };
            points.push(SequencePoint {
                offset: offset_of(p.index),
                document,
                start_line: p.start_line,
                start_column: p.start_column,
                end_line: p.end_line,
                end_column: p.end_column,
            });
        }

        for (instruction, operand) in body.instructions.iter_mut().zip(operands) {
            instruction.operand = operand;
        }
        body.handlers = handlers;
        if !points.is_empty() {
            let _ = symbols.insert(def.token, points);
        }
        def.body = Some(body);
        Ok(def)
    }
}

fn intern(documents: &mut Vec<String>, path: &str) -> u32 {
    let index = documents.iter().position(|d| d == path).unwrap_or_else(|| {
        documents.push(path.to_string());
        documents.len() - 1
    });
    index as u32
}

/// Builder for one type
#[derive(Debug, Clone)]
pub struct TypeBuilder {
    token: u32,
    namespace: String,
    name: String,
    declaring_type: Option<u32>,
    attributes: Vec<CustomAttribute>,
    methods: Vec<MethodBuilder>,
}

impl TypeBuilder {
    /// Create a top-level type
    #[must_use]
    pub fn new(token: u32, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            token,
            namespace: namespace.into(),
            name: name.into(),
            declaring_type: None,
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Nest inside the type with `token`
    #[must_use]
    pub fn nested_in(mut self, token: u32) -> Self {
        self.declaring_type = Some(token);
        self.namespace.clear();
        self
    }

    /// Apply a custom attribute
    #[must_use]
    pub fn attribute(mut self, type_name: impl Into<String>) -> Self {
        self.attributes.push(CustomAttribute::new(type_name));
        self
    }

    /// Add a method
    #[must_use]
    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.methods.push(method);
        self
    }
}

/// Builder for a whole module
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    image: ModuleImage,
    types: Vec<TypeBuilder>,
    embed_symbols: bool,
}

impl ModuleBuilder {
    /// Create a module with a fresh version id
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            image: ModuleImage::new(name),
            types: Vec::new(),
            embed_symbols: false,
        }
    }

    /// Flag as a runtime system library
    #[must_use]
    pub fn system(mut self) -> Self {
        self.image.system = true;
        self
    }

    /// Add a module reference
    #[must_use]
    pub fn reference(mut self, name: impl Into<String>) -> Self {
        self.image.references.push(name.into());
        self
    }

    /// Apply a module-level attribute
    #[must_use]
    pub fn attribute(mut self, type_name: impl Into<String>) -> Self {
        self.image.attributes.push(CustomAttribute::new(type_name));
        self
    }

    /// Store symbols inside the image rather than in a sidecar
    #[must_use]
    pub fn embed_symbols(mut self) -> Self {
        self.embed_symbols = true;
        self
    }

    /// Add a type
    #[must_use]
    pub fn ty(mut self, ty: TypeBuilder) -> Self {
        self.types.push(ty);
        self
    }

    /// Resolve labels and produce the image and its symbols
    pub fn build(self) -> CovetResult<(ModuleImage, SymbolTable)> {
        let mut image = self.image;
        let mut documents = Vec::new();
        let mut methods = BTreeMap::new();

        for ty in self.types {
            let mut def = TypeDef {
                token: ty.token,
                namespace: ty.namespace,
                name: ty.name,
                declaring_type: ty.declaring_type,
                attributes: ty.attributes,
                methods: Vec::with_capacity(ty.methods.len()),
            };
            for method in ty.methods {
                def.methods.push(method.finish(&mut documents, &mut methods)?);
            }
            image.types.push(def);
        }
        image.types.sort_by_key(|t| t.token);

        let symbols = SymbolTable {
            mvid: image.mvid,
            documents,
            methods,
        };
        if self.embed_symbols {
            image.embedded_symbols = Some(symbols.clone());
        }
        Ok((image, symbols))
    }

    /// Build and write the image to `path`, with a sidecar symbol file
    /// unless symbols are embedded
    pub fn write(self, path: &Path) -> CovetResult<ModuleImage> {
        let embedded = self.embed_symbols;
        let (image, symbols) = self.build()?;
        std::fs::write(path, encode_image(&image)?)?;
        if !embedded {
            std::fs::write(SymbolMap::sidecar_path(path), symbols.to_bytes()?)?;
        }
        Ok(image)
    }
}
