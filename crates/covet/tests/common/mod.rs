//! Shared fixtures: a sample module and a tiny interpreter that runs
//! instrumented method bodies and routes probe calls to a hit tracker.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use covet::image::builder::{MethodBuilder, ModuleBuilder, TypeBuilder};
use covet::image::{MethodDef, ModuleImage, OpCode, Operand, TrackerBinding, TypeDef};
use covet::CoverageParameters;
use covet_tracker::{registry, HitCountStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CALC: &str = "src/Calc.cs";
pub const LEGACY: &str = "src/Legacy.cs";

/// Module with one branchy method, a straight-line method, a `switch`, a
/// marker-excluded class and a method carrying a custom attribute
pub fn sample_module(name: &str) -> ModuleBuilder {
    ModuleBuilder::new(name)
        .ty(TypeBuilder::new(1, name, "Calc")
            // int Pick(int flag) { var r = flag ? 1 : 2; return r; }
            .method(
                MethodBuilder::new(10, "Pick")
                    .param("int32")
                    .returns("int32")
                    .locals(1)
                    .line(CALC, 10)
                    .ldarg(0)
                    .branch(OpCode::BrtrueS, "yes")
                    .ldc(2)
                    .branch(OpCode::BrS, "store")
                    .mark("yes")
                    .ldc(1)
                    .mark("store")
                    .stloc(0)
                    .line(CALC, 11)
                    .ldloc(0)
                    .op(OpCode::Ret),
            )
            // int Sum(int a, int b) { var s = a + b; s = s * 2; return s; }
            .method(
                MethodBuilder::new(11, "Sum")
                    .param("int32")
                    .param("int32")
                    .returns("int32")
                    .locals(1)
                    .line(CALC, 20)
                    .ldarg(0)
                    .ldarg(1)
                    .op(OpCode::Add)
                    .stloc(0)
                    .line(CALC, 21)
                    .ldloc(0)
                    .ldc(2)
                    .op(OpCode::Mul)
                    .stloc(0)
                    .line(CALC, 22)
                    .ldloc(0)
                    .op(OpCode::Ret),
            )
            // int Grade(int n) { switch (n) { case 0: return 10; case 1: return 20; default: return 0; } }
            .method(
                MethodBuilder::new(12, "Grade")
                    .param("int32")
                    .returns("int32")
                    .line(CALC, 30)
                    .ldarg(0)
                    .switch(["zero", "one"])
                    .line(CALC, 31)
                    .ldc(0)
                    .op(OpCode::Ret)
                    .mark("zero")
                    .line(CALC, 32)
                    .ldc(10)
                    .op(OpCode::Ret)
                    .mark("one")
                    .line(CALC, 33)
                    .ldc(20)
                    .op(OpCode::Ret),
            )
            .method(
                MethodBuilder::new(13, "Old")
                    .attribute("System.ObsoleteAttribute")
                    .line(CALC, 40)
                    .op(OpCode::Ret),
            ))
        .ty(TypeBuilder::new(2, name, "Legacy")
            .attribute("System.Diagnostics.CodeAnalysis.ExcludeFromCodeCoverageAttribute")
            .method(
                MethodBuilder::new(20, "Run")
                    .line(LEGACY, 5)
                    .ldc(1)
                    .op(OpCode::Pop)
                    .line(LEGACY, 6)
                    .op(OpCode::Ret),
            ))
}

/// Write [`sample_module`] as `<dir>/<name>.img`
pub fn write_sample(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.img"));
    let _ = sample_module(name).write(&path).unwrap();
    path
}

/// Route library logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parameters writing hits into `dir`
pub fn params(dir: &Path) -> CoverageParameters {
    CoverageParameters::builder()
        .hits_directory(dir)
        .build()
        .unwrap()
}

/// Runs instrumented code the way a host process would
pub struct Machine {
    image: ModuleImage,
    binding: TrackerBinding,
    tracker: Arc<HitCountStore>,
}

impl Machine {
    /// Load the instrumented module and attach its tracker
    pub fn load(path: &Path) -> Self {
        let image = covet::read_image(path).unwrap();
        let binding = image.tracker.clone().expect("module is not instrumented");
        let tracker = registry::attach(&binding.tracker_spec()).unwrap();
        Self {
            image,
            binding,
            tracker,
        }
    }

    /// Call `<class>::<method>` with integer arguments
    pub fn call(&self, class: &str, method: &str, args: &[i64]) -> Option<i64> {
        let (ty, def) = self.find(class, method);
        self.invoke(ty, def, args.to_vec())
    }

    /// Write the counters to the hits file, as the process exit hook would
    pub fn flush(&self) {
        self.tracker.flush().unwrap();
        let _ = registry::detach(&self.binding.key);
    }

    pub fn tracker(&self) -> &HitCountStore {
        &self.tracker
    }

    fn find(&self, class: &str, method: &str) -> (&TypeDef, &MethodDef) {
        let ty = self
            .image
            .types
            .iter()
            .find(|t| self.image.type_full_name(t) == class)
            .unwrap_or_else(|| panic!("no type {class}"));
        let def = ty
            .methods
            .iter()
            .find(|m| m.name == method)
            .unwrap_or_else(|| panic!("no method {class}::{method}"));
        (ty, def)
    }

    fn invoke(&self, ty: &TypeDef, method: &MethodDef, args: Vec<i64>) -> Option<i64> {
        let body = method.body.as_ref().expect("method has no body");
        let mut locals = vec![0i64; usize::from(body.local_count)];
        let mut args = args;
        let mut stack: Vec<i64> = Vec::new();
        let mut pc = 0usize;

        loop {
            let instruction = &body.instructions[pc];
            let mut next = pc + 1;
            let jump = |target: u32| body.index_of(target).expect("branch into instruction");

            match (instruction.opcode.long_form(), &instruction.operand) {
                (OpCode::Nop, _) => {}
                (OpCode::LdcI4, Operand::Int32(v)) => stack.push(i64::from(*v)),
                (OpCode::Ldnull, _) | (OpCode::Ldstr, _) => stack.push(0),
                (OpCode::Ldarg, Operand::Var(i)) => stack.push(args[usize::from(*i)]),
                (OpCode::Starg, Operand::Var(i)) => args[usize::from(*i)] = pop(&mut stack),
                (OpCode::Ldloc, Operand::Var(i)) => stack.push(locals[usize::from(*i)]),
                (OpCode::Stloc, Operand::Var(i)) => locals[usize::from(*i)] = pop(&mut stack),
                (OpCode::Pop, _) => {
                    let _ = pop(&mut stack);
                }
                (OpCode::Dup, _) => {
                    let v = pop(&mut stack);
                    stack.push(v);
                    stack.push(v);
                }
                (OpCode::Neg, _) => {
                    let v = pop(&mut stack);
                    stack.push(-v);
                }
                (OpCode::Not, _) => {
                    let v = pop(&mut stack);
                    stack.push(!v);
                }
                (
                    op @ (OpCode::Add
                    | OpCode::Sub
                    | OpCode::Mul
                    | OpCode::Div
                    | OpCode::Rem
                    | OpCode::And
                    | OpCode::Or
                    | OpCode::Xor
                    | OpCode::Ceq
                    | OpCode::Cgt
                    | OpCode::Clt),
                    _,
                ) => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        OpCode::Rem => a % b,
                        OpCode::And => a & b,
                        OpCode::Or => a | b,
                        OpCode::Xor => a ^ b,
                        OpCode::Ceq => i64::from(a == b),
                        OpCode::Cgt => i64::from(a > b),
                        _ => i64::from(a < b),
                    });
                }
                (OpCode::Br | OpCode::Leave, Operand::Target(t)) => next = jump(*t),
                (OpCode::Brtrue, Operand::Target(t)) => {
                    if pop(&mut stack) != 0 {
                        next = jump(*t);
                    }
                }
                (OpCode::Brfalse, Operand::Target(t)) => {
                    if pop(&mut stack) == 0 {
                        next = jump(*t);
                    }
                }
                (
                    op @ (OpCode::Beq
                    | OpCode::BneUn
                    | OpCode::Blt
                    | OpCode::Bgt
                    | OpCode::Ble
                    | OpCode::Bge),
                    Operand::Target(t),
                ) => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    let taken = match op {
                        OpCode::Beq => a == b,
                        OpCode::BneUn => a != b,
                        OpCode::Blt => a < b,
                        OpCode::Bgt => a > b,
                        OpCode::Ble => a <= b,
                        _ => a >= b,
                    };
                    if taken {
                        next = jump(*t);
                    }
                }
                (OpCode::Switch, Operand::Targets(targets)) => {
                    let v = pop(&mut stack);
                    if let Some(t) = usize::try_from(v).ok().and_then(|i| targets.get(i)) {
                        next = jump(*t);
                    }
                }
                (OpCode::Call | OpCode::Callvirt, Operand::Method(callee)) => {
                    let mut call_args: Vec<i64> =
                        (0..callee.pops()).map(|_| pop(&mut stack)).collect();
                    call_args.reverse();
                    if callee.declaring_type == self.binding.tracker_type
                        && callee.name == TrackerBinding::RECORD_HIT
                    {
                        self.tracker.record_hit(u32::try_from(call_args[0]).unwrap());
                    } else {
                        let (ty, def) = self.find(&callee.declaring_type, &callee.name);
                        if let Some(v) = self.invoke(ty, def, call_args) {
                            stack.push(v);
                        }
                    }
                }
                (OpCode::Ret, _) => {
                    return method.returns_value().then(|| pop(&mut stack));
                }
                (op, operand) => panic!("{op:?} {operand:?} not supported in {}", ty.name),
            }
            pc = next;
        }
    }
}

fn pop(stack: &mut Vec<i64>) -> i64 {
    stack.pop().expect("stack underflow")
}
