//! Module instrumentation
//!
//! Planning and rewriting are separate passes. Planning walks types and
//! methods in token order, applies the exclusion policy, and hands out one
//! slot per source line and one per branch path. Only once the slot count is
//! known is the tracker binding created and every planned body rewritten.

use super::backup::{backup_module, commit_module};
use super::ids::{SlotAllocator, SlotId};
use super::injector::{ProbeInjector, ProbePlan};
use super::record::{Branch, Document, HitCandidate, InstrumenterResult, Line, MethodRecord};
use crate::config::CoverageParameters;
use crate::filter::{ExclusionFilter, Member, SourceFileFilter};
use crate::image::{
    decode_image, encode_image, read_image, Bootstrap, CustomAttribute, MethodDef,
    MethodSemantics, ModuleImage, TrackerBinding, TypeDef,
};
use crate::result::{CovetError, CovetResult};
use crate::symbols::{SequencePoint, SymbolMap};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Namespace of injected tracker types
pub const TRACKER_NAMESPACE: &str = "Covet.Tracker";

#[derive(Debug)]
struct MethodPlan {
    ty: usize,
    method: usize,
    signature: String,
    plan: ProbePlan,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: SlotAllocator,
    lines: HashMap<(String, u32), SlotId>,
    ordinals: HashMap<(String, u32), u32>,
}

/// Instruments one module
///
/// Holds no mutable state, so one instrumenter per module can run on its own
/// thread.
#[derive(Debug, Clone)]
pub struct Instrumenter {
    module_path: PathBuf,
    run_id: String,
    params: CoverageParameters,
    filter: ExclusionFilter,
    source_filter: SourceFileFilter,
}

impl Instrumenter {
    /// Prepare to instrument the module at `module_path`
    #[must_use]
    pub fn new(
        module_path: impl Into<PathBuf>,
        run_id: impl Into<String>,
        params: &CoverageParameters,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            run_id: run_id.into(),
            params: params.clone(),
            filter: ExclusionFilter::new(params),
            source_filter: SourceFileFilter::new(&params.exclude_by_file),
        }
    }

    /// Module path
    #[must_use]
    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// File stem of the module
    #[must_use]
    pub fn module_name(&self) -> String {
        self.module_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `<hits dir>/<module>_<run id>`
    #[must_use]
    pub fn hits_file_path(&self) -> PathBuf {
        self.params.hits_directory().join(self.tracker_key())
    }

    fn tracker_key(&self) -> String {
        format!("{}_{}", self.module_name(), self.run_id)
    }

    /// Cheap pre-check: whether [`Self::instrument`] should be attempted
    #[must_use]
    pub fn can_instrument(&self) -> bool {
        match self.rejection() {
            None => true,
            Some(reason) => {
                info!(module = %self.module_path.display(), %reason, "module will not be instrumented");
                false
            }
        }
    }

    fn rejection(&self) -> Option<String> {
        let image = match read_image(&self.module_path) {
            Ok(image) => image,
            Err(e) => return Some(e.to_string()),
        };
        if image.is_instrumented() {
            return Some("already instrumented".to_string());
        }
        if !SymbolMap::available(&self.module_path, &image) {
            return Some("no symbols".to_string());
        }
        if image.system && !image.is_foundational() {
            return Some("system library".to_string());
        }
        if self.filter.is_module_excluded(&image.name) {
            return Some("excluded by module filter".to_string());
        }
        if self.params.exclude_modules_without_sources {
            let symbols = match SymbolMap::load(&self.module_path, &image) {
                Ok(symbols) => symbols,
                Err(e) => return Some(e.to_string()),
            };
            if !symbols.documents().iter().any(|d| Path::new(d).is_file()) {
                return Some("no source files found".to_string());
            }
        }
        None
    }

    /// Rewrite the module in place and describe what was instrumented
    ///
    /// The module and its symbols are replaced together or not at all.
    pub fn instrument(&self) -> CovetResult<InstrumenterResult> {
        let original = std::fs::read(&self.module_path)
            .map_err(|e| CovetError::parse(&self.module_path, e.to_string()))?;
        let fingerprint = format!("{:x}", Sha256::digest(&original));
        let mut image = decode_image(&original, &self.module_path)?;
        if image.is_instrumented() {
            return Err(CovetError::AlreadyInstrumented {
                path: self.module_path.clone(),
            });
        }
        let mut symbols = SymbolMap::load(&self.module_path, &image)?;

        let mut result = InstrumenterResult {
            module: self.module_name(),
            module_path: self.module_path.clone(),
            hits_file_path: self.hits_file_path(),
            run_id: self.run_id.clone(),
            documents: BTreeMap::new(),
            hit_candidates: Vec::new(),
            methods: BTreeMap::new(),
            excluded_types: Vec::new(),
            conflicts: Vec::new(),
            fingerprint,
            backup_path: None,
        };
        let plans = self.plan(&image, &symbols, &mut result);

        let binding = self.binding(&image, result.slot_count() as u32);
        let injector = ProbeInjector::new(binding.record_hit_ref());
        for planned in &plans {
            let method = &mut image.types[planned.ty].methods[planned.method];
            let Some(body) = &method.body else {
                continue;
            };
            let rewritten =
                injector.inject(&planned.signature, body, method.returns_value(), &planned.plan)?;
            symbols.remap_offsets(method.token, |old| rewritten.map_offset(old).unwrap_or(old));
            method.body = Some(rewritten.body);
        }
        add_tracker_type(&mut image, &binding);
        image.tracker = Some(binding);

        let embedded = image.embedded_symbols.is_some();
        let table = symbols.into_table();
        let symbol_bytes = if embedded {
            image.embedded_symbols = Some(table);
            None
        } else {
            Some(table.to_bytes()?)
        };
        let image_bytes = encode_image(&image)?;

        if let Some(dir) = &self.params.backup_directory {
            result.backup_path = Some(backup_module(&self.module_path, dir, &self.run_id)?);
        }
        commit_module(
            &self.module_path,
            &original,
            &image_bytes,
            symbol_bytes.as_deref(),
        )?;

        info!(
            module = %result.module,
            run_id = %self.run_id,
            slots = result.slot_count(),
            methods = plans.len(),
            excluded_types = result.excluded_types.len(),
            "instrumented module"
        );
        Ok(result)
    }

    fn binding(&self, image: &ModuleImage, slot_count: u32) -> TrackerBinding {
        let key = self.tracker_key();
        let ident: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        TrackerBinding {
            run_id: self.run_id.clone(),
            hits_file: self.hits_file_path(),
            key,
            slot_count,
            single_hit: self.params.single_hit,
            bootstrap: if image.is_foundational() {
                Bootstrap::Embedded
            } else {
                Bootstrap::Registry
            },
            tracker_type: format!("{TRACKER_NAMESPACE}.{ident}"),
        }
    }

    fn plan(
        &self,
        image: &ModuleImage,
        symbols: &SymbolMap,
        result: &mut InstrumenterResult,
    ) -> Vec<MethodPlan> {
        let mut table = SlotTable::default();
        let mut plans = Vec::new();

        let mut types: Vec<usize> = (0..image.types.len()).collect();
        types.sort_by_key(|&i| image.types[i].token);

        for ti in types {
            let ty = &image.types[ti];
            let class = image.type_full_name(ty);

            if let Some(conflict) = self.filter.conflict(image, ty) {
                warn!(
                    class = %conflict.type_name,
                    marker = %conflict.marker,
                    filter = %conflict.include_filter,
                    "exclusion marker overrides include filter"
                );
                result.conflicts.push(conflict);
            }
            let type_reason = self.filter.exclusion(image, Member::Type(ty));
            if let Some(reason) = &type_reason {
                debug!(class = %class, ?reason, "excluded type");
                result.excluded_types.push(class.clone());
            }

            let mut methods: Vec<usize> = (0..ty.methods.len()).collect();
            methods.sort_by_key(|&i| ty.methods[i].token);

            for mi in methods {
                let method = &ty.methods[mi];
                if method.body.is_none() {
                    continue;
                }
                let signature = image.method_signature(ty, method);
                let points = symbols.sequence_points(method.token);

                let reason = type_reason
                    .clone()
                    .or_else(|| self.filter.exclusion(image, Member::Method(ty, method)));
                if let Some(reason) = reason {
                    debug!(method = %signature, ?reason, "excluded method");
                    let _ = result.methods.insert(
                        signature,
                        MethodRecord {
                            class: class.clone(),
                            excluded: Some(reason),
                            sequence_points: points,
                            branch_points: 0,
                        },
                    );
                    continue;
                }

                let mut plan = ProbePlan::default();
                self.plan_lines(symbols, &points, &class, &signature, &mut table, &mut plan, result);
                let branch_points = self.plan_branches(
                    symbols, method, &points, &class, &signature, &mut table, &mut plan, result,
                );

                let _ = result.methods.insert(
                    signature.clone(),
                    MethodRecord {
                        class: class.clone(),
                        excluded: None,
                        sequence_points: points,
                        branch_points,
                    },
                );
                if !plan.is_empty() {
                    plans.push(MethodPlan {
                        ty: ti,
                        method: mi,
                        signature,
                        plan,
                    });
                }
            }
        }
        plans
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_lines(
        &self,
        symbols: &SymbolMap,
        points: &[SequencePoint],
        class: &str,
        signature: &str,
        table: &mut SlotTable,
        plan: &mut ProbePlan,
        result: &mut InstrumenterResult,
    ) {
        for point in points.iter().filter(|p| !p.is_hidden()) {
            let Some(path) = symbols.document(point.document) else {
                continue;
            };
            if self.source_filter.is_excluded(path) {
                continue;
            }
            let document = result
                .documents
                .entry(path.to_string())
                .or_insert_with(|| Document::new(path, point.document));

            for line in point.lines() {
                let key = (path.to_string(), line);
                let slot = if let Some(slot) = table.lines.get(&key) {
                    *slot
                } else {
                    let slot = table.slots.allocate();
                    result.hit_candidates.push(HitCandidate::Line {
                        document: path.to_string(),
                        line,
                    });
                    let _ = document.lines.insert(
                        line,
                        Line {
                            number: line,
                            class: class.to_string(),
                            method: signature.to_string(),
                            hits: 0,
                            is_branch_point: false,
                        },
                    );
                    let _ = table.lines.insert(key, slot);
                    slot
                };
                plan.add_line(point.offset, slot);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_branches(
        &self,
        symbols: &SymbolMap,
        method: &MethodDef,
        points: &[SequencePoint],
        class: &str,
        signature: &str,
        table: &mut SlotTable,
        plan: &mut ProbePlan,
        result: &mut InstrumenterResult,
    ) -> u32 {
        let Some(body) = &method.body else {
            return 0;
        };
        let mut tracked = 0;

        for instruction in body
            .instructions
            .iter()
            .filter(|i| i.opcode.is_conditional_branch())
        {
            let Some(anchor) = points
                .iter()
                .filter(|p| p.offset <= instruction.offset && !p.is_hidden())
                .last()
            else {
                continue;
            };
            let Some(path) = symbols.document(anchor.document) else {
                continue;
            };
            if self.source_filter.is_excluded(path) {
                continue;
            }

            let line = anchor.start_line;
            let fall_through = instruction.offset + instruction.size();
            let ends: Vec<u32> = std::iter::once(fall_through)
                .chain(instruction.operand.targets())
                .collect();

            let document = result
                .documents
                .entry(path.to_string())
                .or_insert_with(|| Document::new(path, anchor.document));
            let ordinal = table.ordinals.entry((path.to_string(), line)).or_insert(0);

            let mut slots = Vec::with_capacity(ends.len());
            for (index, end) in ends.iter().enumerate() {
                let slot = table.slots.allocate();
                result.hit_candidates.push(HitCandidate::Branch {
                    document: path.to_string(),
                    line,
                    ordinal: *ordinal,
                });
                document.branches.push(Branch {
                    line,
                    ordinal: *ordinal,
                    offset: instruction.offset,
                    end_offset: *end,
                    path: index as u32,
                    class: class.to_string(),
                    method: signature.to_string(),
                    hits: 0,
                });
                *ordinal += 1;
                slots.push(slot);
            }
            if let Some(entry) = document.lines.get_mut(&line) {
                entry.is_branch_point = true;
            }
            tracked += slots.len() as u32;
            let _ = plan.branches.insert(instruction.offset, slots);
        }
        tracked
    }
}

/// Declare the tracker type the probes call into
fn add_tracker_type(image: &mut ModuleImage, binding: &TrackerBinding) {
    let type_token = image.types.iter().map(|t| t.token).max().unwrap_or(0) + 1;
    let method_token = image
        .types
        .iter()
        .flat_map(|t| t.methods.iter())
        .map(|m| m.token)
        .max()
        .unwrap_or(0)
        + 1;
    let (namespace, name) = binding
        .tracker_type
        .rsplit_once('.')
        .unwrap_or(("", binding.tracker_type.as_str()));

    image.types.push(TypeDef {
        token: type_token,
        namespace: namespace.to_string(),
        name: name.to_string(),
        declaring_type: None,
        attributes: vec![CustomAttribute::new(
            "System.Diagnostics.CodeAnalysis.ExcludeFromCodeCoverageAttribute",
        )],
        methods: vec![MethodDef {
            token: method_token,
            name: TrackerBinding::RECORD_HIT.to_string(),
            return_type: "void".to_string(),
            parameters: vec!["int32".to_string()],
            has_this: false,
            semantics: MethodSemantics::Normal,
            attributes: Vec::new(),
            body: None,
        }],
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::image::builder::{MethodBuilder, ModuleBuilder, TypeBuilder};
    use crate::image::{OpCode, Operand};

    fn write_module(dir: &Path, builder: ModuleBuilder) -> PathBuf {
        let path = dir.join("App.img");
        let _ = builder.write(&path).unwrap();
        path
    }

    fn calc() -> ModuleBuilder {
        ModuleBuilder::new("App").ty(
            TypeBuilder::new(1, "App", "Calc")
                .method(
                    MethodBuilder::new(10, "Pick")
                        .param("int32")
                        .returns("int32")
                        .locals(1)
                        .line("src/Calc.cs", 10)
                        .ldarg(0)
                        .branch(OpCode::BrtrueS, "yes")
                        .ldc(2)
                        .branch(OpCode::BrS, "store")
                        .mark("yes")
                        .ldc(1)
                        .mark("store")
                        .stloc(0)
                        .line("src/Calc.cs", 11)
                        .ldloc(0)
                        .op(OpCode::Ret),
                )
                .method(
                    MethodBuilder::new(11, "Skip")
                        .attribute("ExcludeFromCodeCoverage")
                        .line("src/Calc.cs", 20)
                        .op(OpCode::Ret),
                ),
        )
    }

    fn params(dir: &Path) -> CoverageParameters {
        CoverageParameters::builder()
            .hits_directory(dir)
            .build()
            .unwrap()
    }

    #[test]
    fn test_module_name_and_hits_path() {
        let params = CoverageParameters::builder()
            .hits_directory("/tmp/hits")
            .build()
            .unwrap();
        let ins = Instrumenter::new("/bin/App.Core.img", "r1", &params);
        assert_eq!(ins.module_name(), "App.Core");
        assert_eq!(ins.hits_file_path(), PathBuf::from("/tmp/hits/App.Core_r1"));
    }

    #[test]
    fn test_instrument_records_lines_and_branches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        let ins = Instrumenter::new(&path, "run", &params(dir.path()));
        assert!(ins.can_instrument());

        let result = ins.instrument().unwrap();
        let doc = &result.documents["src/Calc.cs"];
        assert_eq!(doc.lines.keys().copied().collect::<Vec<_>>(), vec![10, 11]);
        assert!(doc.lines[&10].is_branch_point);
        assert_eq!(doc.branches.len(), 2);
        assert_eq!(doc.branches[0].path, 0);
        assert_eq!(doc.branches[1].ordinal, 1);
        assert_eq!(result.slot_count(), 4);
        assert_eq!(
            result.methods["void App.Calc::Skip()"].excluded,
            Some(crate::filter::ExclusionReason::Marker(
                crate::filter::MarkerKind::ExcludeFromCodeCoverage
            ))
        );
        assert_eq!(result.instrumented_methods().count(), 1);
        assert_eq!(result.fingerprint.len(), 64);
    }

    #[test]
    fn test_instrumented_image_calls_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        let _ = Instrumenter::new(&path, "run", &params(dir.path()))
            .instrument()
            .unwrap();

        let image = read_image(&path).unwrap();
        let binding = image.tracker.clone().unwrap();
        assert_eq!(binding.slot_count, 4);
        assert_eq!(binding.bootstrap, Bootstrap::Registry);
        assert_eq!(binding.tracker_type, "Covet.Tracker.App_run");
        let probes = image.types[0].methods[0]
            .body
            .as_ref()
            .unwrap()
            .instructions
            .iter()
            .filter(|i| i.operand == Operand::Method(binding.record_hit_ref()))
            .count();
        assert_eq!(probes, 4);
        // excluded method untouched
        assert_eq!(
            image.types[0].methods[1].body.as_ref().unwrap().instructions.len(),
            1
        );
        assert!(image.type_by_token(2).is_some());
    }

    #[test]
    fn test_reinstrument_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        let ins = Instrumenter::new(&path, "run", &params(dir.path()));
        let _ = ins.instrument().unwrap();

        assert!(!ins.can_instrument());
        assert!(matches!(
            ins.instrument(),
            Err(CovetError::AlreadyInstrumented { .. })
        ));
    }

    #[test]
    fn test_system_modules() {
        let dir = tempfile::tempdir().unwrap();
        let lib = write_module(dir.path(), calc().system().reference("corelib"));
        assert!(!Instrumenter::new(&lib, "r", &params(dir.path())).can_instrument());

        let core = dir.path().join("corelib.img");
        let _ = calc().system().write(&core).unwrap();
        let ins = Instrumenter::new(&core, "r", &params(dir.path()));
        assert!(ins.can_instrument());
        let _ = ins.instrument().unwrap();
        let binding = read_image(&core).unwrap().tracker.unwrap();
        assert_eq!(binding.bootstrap, Bootstrap::Embedded);
    }

    #[test]
    fn test_missing_symbols_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        std::fs::remove_file(SymbolMap::sidecar_path(&path)).unwrap();
        let ins = Instrumenter::new(&path, "run", &params(dir.path()));
        assert!(!ins.can_instrument());
        assert!(matches!(ins.instrument(), Err(CovetError::Parse { .. })));
    }

    #[test]
    fn test_modules_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        let params = CoverageParameters::builder()
            .hits_directory(dir.path())
            .exclude_modules_without_sources(true)
            .build()
            .unwrap();
        assert!(!Instrumenter::new(&path, "run", &params).can_instrument());
    }

    #[test]
    fn test_excluded_source_file_has_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        let params = CoverageParameters::builder()
            .hits_directory(dir.path())
            .exclude_by_file("**/Calc.cs")
            .build()
            .unwrap();
        let result = Instrumenter::new(&path, "run", &params).instrument().unwrap();
        assert!(result.documents.is_empty());
        assert_eq!(result.slot_count(), 0);
    }

    #[test]
    fn test_sequence_points_follow_probes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc().embed_symbols());
        let _ = Instrumenter::new(&path, "run", &params(dir.path()))
            .instrument()
            .unwrap();

        let image = read_image(&path).unwrap();
        let symbols = SymbolMap::load(&path, &image).unwrap();
        let body = image.types[0].methods[0].body.as_ref().unwrap();
        for point in symbols.sequence_points(10) {
            let index = body.index_of(point.offset).unwrap();
            assert_eq!(body.instructions[index].opcode, OpCode::LdcI4);
            assert_eq!(body.instructions[index + 1].opcode, OpCode::Call);
        }
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), calc());
        let before = std::fs::read(&path).unwrap();
        let params = CoverageParameters::builder()
            .hits_directory(dir.path())
            .backup_directory(dir.path().join("backup"))
            .build()
            .unwrap();

        let result = Instrumenter::new(&path, "run", &params).instrument().unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), before);
        super::super::backup::restore_original_module(&result).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
