//! Exclusion policy
//!
//! Decides which types and methods are instrumented. Checks run in a fixed
//! precedence order and the first one that applies names the reason:
//!
//! 1. a recognized coverage-exclusion marker on the type, an enclosing type,
//!    or the method
//! 2. a caller-configured marker attribute on the same
//! 3. compiler-generated code: constructs whose owner method is excluded,
//!    `<PrivateImplementationDetails>`, generated types with no owner, and
//!    (optionally) auto-property accessors
//! 4. `[module]type` name filters, exclude before include
//!
//! Everything else is included.

use crate::config::CoverageParameters;
use crate::image::{CustomAttribute, MethodDef, MethodSemantics, ModuleImage, TypeDef};
use crate::result::{CovetError, CovetResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tracing::warn;

const COMPILER_GENERATED: &str = "CompilerGeneratedAttribute";
const PRIVATE_IMPLEMENTATION_DETAILS: &str = "<PrivateImplementationDetails>";

/// Recognized coverage-exclusion markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// `ExcludeFromCodeCoverageAttribute`
    ExcludeFromCodeCoverage,
    /// `ExcludeFromCoverageAttribute`
    ExcludeFromCoverage,
}

impl MarkerKind {
    /// All recognized markers
    pub const ALL: [Self; 2] = [Self::ExcludeFromCodeCoverage, Self::ExcludeFromCoverage];

    /// Attribute type name without namespace
    #[must_use]
    pub const fn attribute_name(self) -> &'static str {
        match self {
            Self::ExcludeFromCodeCoverage => "ExcludeFromCodeCoverageAttribute",
            Self::ExcludeFromCoverage => "ExcludeFromCoverageAttribute",
        }
    }

    /// Marker an attribute stands for, if any
    #[must_use]
    pub fn recognize(attribute: &CustomAttribute) -> Option<Self> {
        let short = normalize_attribute_name(attribute.short_name());
        Self::ALL
            .into_iter()
            .find(|kind| kind.attribute_name() == short)
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attribute_name())
    }
}

/// `Obsolete` becomes `ObsoleteAttribute`; names already ending in
/// `Attribute` are unchanged
#[must_use]
pub fn normalize_attribute_name(name: &str) -> String {
    if name.ends_with("Attribute") {
        name.to_string()
    } else {
        format!("{name}Attribute")
    }
}

/// Why a type or method is not instrumented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    /// Recognized marker
    Marker(MarkerKind),
    /// Configured marker attribute, by full name
    CustomMarker(String),
    /// Compiler-generated construct whose owner method is excluded
    ExcludedOwner(String),
    /// Compiler-generated artifact with no source of its own
    CompilerGenerated,
    /// Auto-property accessor
    AutoProperty,
    /// Matched an exclude filter
    ExcludeFilter(String),
    /// Include filters are configured and none matched
    NotIncluded,
}

impl ExclusionReason {
    /// Excluded by an attribute rather than by name
    #[must_use]
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker(_) | Self::CustomMarker(_))
    }
}

/// A marker excluded a type that an include filter names explicitly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionConflict {
    /// Full type name
    pub type_name: String,
    /// Marker attribute that won
    pub marker: String,
    /// Include filter that lost
    pub include_filter: String,
}

/// What is being checked
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    /// A type, with its enclosing types
    Type(&'a TypeDef),
    /// A method of a type
    Method(&'a TypeDef, &'a MethodDef),
}

impl<'a> Member<'a> {
    fn ty(self) -> &'a TypeDef {
        match self {
            Self::Type(ty) | Self::Method(ty, _) => ty,
        }
    }

    fn method(self) -> Option<&'a MethodDef> {
        match self {
            Self::Type(_) => None,
            Self::Method(_, method) => Some(method),
        }
    }
}

/// Parsed `[module-glob]type-glob` expression
#[derive(Debug, Clone)]
pub struct FilterExpression {
    raw: String,
    module: Regex,
    ty: Regex,
    module_wide: bool,
}

impl FilterExpression {
    /// Parse an expression; `*` and `?` are wildcards
    pub fn parse(raw: &str) -> CovetResult<Self> {
        let expression = raw.trim();
        let rest = expression
            .strip_prefix('[')
            .ok_or_else(|| CovetError::invalid_filter(raw, "expected '[module]type'"))?;
        let (module, ty) = rest
            .split_once(']')
            .ok_or_else(|| CovetError::invalid_filter(raw, "missing ']'"))?;

        if module.is_empty() || ty.is_empty() {
            return Err(CovetError::invalid_filter(
                raw,
                "module and type patterns must not be empty",
            ));
        }
        if let Some(c) = module
            .chars()
            .chain(ty.chars())
            .find(|c| !is_filter_char(*c))
        {
            return Err(CovetError::invalid_filter(
                raw,
                format!("unexpected character '{c}'"),
            ));
        }

        Ok(Self {
            raw: expression.to_string(),
            module: glob_regex(raw, module)?,
            ty: glob_regex(raw, ty)?,
            module_wide: ty == "*",
        })
    }

    /// Expression as given
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the module pattern matches
    #[must_use]
    pub fn matches_module(&self, module: &str) -> bool {
        self.module.is_match(module)
    }

    /// Whether both patterns match
    #[must_use]
    pub fn matches(&self, module: &str, type_name: &str) -> bool {
        self.matches_module(module) && self.ty.is_match(type_name)
    }

    /// Type pattern is a bare `*`
    #[must_use]
    pub fn is_module_wide(&self) -> bool {
        self.module_wide
    }
}

fn is_filter_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '*' | '?' | '<' | '>' | '`' | '/' | '+')
}

fn glob_regex(raw: &str, glob: &str) -> CovetResult<Regex> {
    let pattern = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{pattern}$")).map_err(|e| CovetError::invalid_filter(raw, e.to_string()))
}

fn owner_regex() -> &'static Regex {
    static OWNER: OnceLock<Regex> = OnceLock::new();
    OWNER.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^<([^>]+)>").expect("owner pattern is valid")
    })
}

/// Owner method of a compiler-generated name: `<Compute>d__3` gives `Compute`
#[must_use]
pub fn generated_owner(name: &str) -> Option<&str> {
    owner_regex()
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn is_generated_name(name: &str) -> bool {
    name.starts_with('<')
}

fn has_compiler_generated(attributes: &[CustomAttribute]) -> bool {
    attributes.iter().any(|a| a.short_name() == COMPILER_GENERATED)
}

/// Exclusion decisions for one configuration
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    includes: Vec<FilterExpression>,
    excludes: Vec<FilterExpression>,
    short_markers: Vec<String>,
    qualified_markers: Vec<String>,
    skip_auto_props: bool,
}

impl ExclusionFilter {
    /// Build from parameters; malformed filter expressions are skipped
    #[must_use]
    pub fn new(params: &CoverageParameters) -> Self {
        let mut short_markers = Vec::new();
        let mut qualified_markers = Vec::new();
        for name in &params.exclude_attributes {
            let name = normalize_attribute_name(name.trim());
            if name.contains('.') {
                qualified_markers.push(name);
            } else {
                short_markers.push(name);
            }
        }

        Self {
            includes: parse_filters(&params.include_filters),
            excludes: parse_filters(&params.exclude_filters),
            short_markers,
            qualified_markers,
            skip_auto_props: params.skip_auto_props,
        }
    }

    /// Whether include filters are configured
    #[must_use]
    pub fn has_includes(&self) -> bool {
        !self.includes.is_empty()
    }

    /// Whole module ruled out by the filters
    #[must_use]
    pub fn is_module_excluded(&self, module: &str) -> bool {
        if self
            .excludes
            .iter()
            .any(|f| f.is_module_wide() && f.matches_module(module))
        {
            return true;
        }
        self.has_includes() && !self.includes.iter().any(|f| f.matches_module(module))
    }

    /// Whether `member` is excluded
    #[must_use]
    pub fn is_excluded(&self, image: &ModuleImage, member: Member<'_>) -> bool {
        self.exclusion(image, member).is_some()
    }

    /// First applicable exclusion reason for `member`
    #[must_use]
    pub fn exclusion(&self, image: &ModuleImage, member: Member<'_>) -> Option<ExclusionReason> {
        self.marker_exclusion(image, member)
            .or_else(|| self.generated_exclusion(image, member))
            .or_else(|| self.name_exclusion(image, member.ty()))
    }

    /// Conflict between a marker exclusion and an explicit include filter
    #[must_use]
    pub fn conflict(&self, image: &ModuleImage, ty: &TypeDef) -> Option<ExclusionConflict> {
        let reason = self.marker_exclusion(image, Member::Type(ty))?;
        let outer = image.outermost(ty);
        let outer_name = image.type_full_name(outer);
        let include = self
            .includes
            .iter()
            .find(|f| !f.is_module_wide() && f.matches(&image.name, &outer_name))?;
        Some(ExclusionConflict {
            type_name: image.type_full_name(ty),
            marker: match reason {
                ExclusionReason::Marker(kind) => kind.to_string(),
                ExclusionReason::CustomMarker(name) => name,
                _ => return None,
            },
            include_filter: include.as_str().to_string(),
        })
    }

    fn marker_exclusion(&self, image: &ModuleImage, member: Member<'_>) -> Option<ExclusionReason> {
        let ty = member.ty();
        let mut attribute_sets: Vec<&[CustomAttribute]> = vec![ty.attributes.as_slice()];
        attribute_sets.extend(image.enclosing_types(ty).into_iter().map(|t| t.attributes.as_slice()));
        if let Some(method) = member.method() {
            attribute_sets.push(method.attributes.as_slice());
        }

        let attributes = || attribute_sets.iter().flat_map(|set| set.iter());
        if let Some(kind) = attributes().find_map(MarkerKind::recognize) {
            return Some(ExclusionReason::Marker(kind));
        }
        attributes()
            .find(|a| self.is_custom_marker(a))
            .map(|a| ExclusionReason::CustomMarker(a.type_name.clone()))
    }

    /// Configured marker match: short name ignoring ASCII case, or the
    /// exact fully qualified name
    #[must_use]
    pub fn is_custom_marker(&self, attribute: &CustomAttribute) -> bool {
        let short = normalize_attribute_name(attribute.short_name());
        self.short_markers.iter().any(|m| m.eq_ignore_ascii_case(&short))
            || self
                .qualified_markers
                .iter()
                .any(|m| *m == normalize_attribute_name(&attribute.type_name))
    }

    fn generated_exclusion(&self, image: &ModuleImage, member: Member<'_>) -> Option<ExclusionReason> {
        let ty = member.ty();

        // Owner lookups walk outward: the construct's own name first, then
        // each enclosing generated type.
        let mut names: Vec<(&str, &TypeDef)> = Vec::new();
        if let Some(method) = member.method() {
            names.push((method.name.as_str(), ty));
        }
        names.push((ty.name.as_str(), ty));
        for enclosing in image.enclosing_types(ty) {
            names.push((enclosing.name.as_str(), enclosing));
        }
        for (name, scope) in names {
            if let Some(owner) = generated_owner(name) {
                if let Some(reason) = self.owner_exclusion(image, scope, owner) {
                    return Some(reason);
                }
            }
        }

        if image.outermost(ty).name == PRIVATE_IMPLEMENTATION_DETAILS {
            return Some(ExclusionReason::CompilerGenerated);
        }
        if is_owner_less_generated(ty) {
            return Some(ExclusionReason::CompilerGenerated);
        }
        if let Some(method) = member.method() {
            let accessor = matches!(
                method.semantics,
                MethodSemantics::Getter | MethodSemantics::Setter
            );
            if self.skip_auto_props && accessor && has_compiler_generated(&method.attributes) {
                return Some(ExclusionReason::AutoProperty);
            }
        }
        None
    }

    fn owner_exclusion(
        &self,
        image: &ModuleImage,
        scope: &TypeDef,
        owner: &str,
    ) -> Option<ExclusionReason> {
        let mut candidates = vec![scope];
        candidates.extend(image.enclosing_types(scope));
        for ty in candidates {
            for method in ty.methods.iter().filter(|m| m.name == owner) {
                if self.marker_exclusion(image, Member::Method(ty, method)).is_some() {
                    return Some(ExclusionReason::ExcludedOwner(
                        image.method_signature(ty, method),
                    ));
                }
            }
        }
        None
    }

    fn name_exclusion(&self, image: &ModuleImage, ty: &TypeDef) -> Option<ExclusionReason> {
        let outer = image.type_full_name(image.outermost(ty));
        if let Some(filter) = self.excludes.iter().find(|f| f.matches(&image.name, &outer)) {
            return Some(ExclusionReason::ExcludeFilter(filter.as_str().to_string()));
        }
        if self.has_includes() && !self.includes.iter().any(|f| f.matches(&image.name, &outer)) {
            return Some(ExclusionReason::NotIncluded);
        }
        None
    }
}

/// Generated type none of whose methods point back at a user method
fn is_owner_less_generated(ty: &TypeDef) -> bool {
    has_compiler_generated(&ty.attributes)
        && generated_owner(&ty.name).is_none()
        && !ty
            .methods
            .iter()
            .any(|m| is_generated_name(&m.name) && generated_owner(&m.name).is_some())
}

fn parse_filters(raw: &[String]) -> Vec<FilterExpression> {
    raw.iter()
        .filter_map(|r| match FilterExpression::parse(r) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(filter = %r, error = %e, "skipping invalid filter");
                None
            }
        })
        .collect()
}

/// Source files whose lines are not tracked
#[derive(Debug, Clone, Default)]
pub struct SourceFileFilter {
    patterns: Vec<glob::Pattern>,
}

impl SourceFileFilter {
    /// Compile glob patterns; malformed ones are skipped
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(&p.replace('\\', "/")) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid source file pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether `document` matches any pattern
    #[must_use]
    pub fn is_excluded(&self, document: &str) -> bool {
        let path = document.replace('\\', "/");
        self.patterns.iter().any(|p| p.matches(&path))
    }
}
