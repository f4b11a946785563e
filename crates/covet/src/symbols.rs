//! Debug symbols: instruction offsets to source positions.
//!
//! Symbols live in a sidecar `<stem>.sym` file next to the image, or inside
//! the image itself. Either way they carry the image's module version id so a
//! stale symbol file is rejected instead of silently mis-mapping lines.

use crate::image::ModuleImage;
use crate::result::{CovetError, CovetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Magic bytes at the start of a symbol file
pub const SYMBOLS_MAGIC: [u8; 4] = *b"CVSY";

/// Current symbol file version
pub const SYMBOLS_VERSION: u16 = 1;

/// Line number compilers use for sequence points that map to no source
pub const HIDDEN_LINE: u32 = 0x00FE_EFEE;

/// An instruction offset annotated with a source span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePoint {
    /// Instruction offset
    pub offset: u32,
    /// Index into the document table
    pub document: u32,
    /// First line
    pub start_line: u32,
    /// First column
    pub start_column: u32,
    /// Last line
    pub end_line: u32,
    /// Column after the span
    pub end_column: u32,
}

impl SequencePoint {
    /// Compiler-generated point with no source
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE
    }

    /// Lines covered by the span
    pub fn lines(&self) -> impl Iterator<Item = u32> {
        self.start_line..=self.end_line.max(self.start_line)
    }
}

/// Resolved source position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Document path
    pub file: String,
    /// Line
    pub line: u32,
    /// Column
    pub column: u32,
}

/// Serialized symbol data
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Version id of the image these symbols describe
    pub mvid: Uuid,
    /// Document paths
    pub documents: Vec<String>,
    /// Sequence points per method token, ascending offset
    pub methods: BTreeMap<u32, Vec<SequencePoint>>,
}

impl SymbolTable {
    /// Encode as a symbol file
    pub fn to_bytes(&self) -> CovetResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(payload.len() + 6);
        out.extend_from_slice(&SYMBOLS_MAGIC);
        out.extend_from_slice(&SYMBOLS_VERSION.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a symbol file
    pub fn from_bytes(bytes: &[u8], path: &Path) -> CovetResult<Self> {
        if bytes.len() < 6 || bytes[..4] != SYMBOLS_MAGIC {
            return Err(CovetError::parse(path, "not a symbol file"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != SYMBOLS_VERSION {
            return Err(CovetError::parse(
                path,
                format!("unsupported symbol file version {version}"),
            ));
        }
        bincode::deserialize(&bytes[6..]).map_err(|e| CovetError::parse(path, e.to_string()))
    }
}

/// Where symbols were loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolSource {
    /// Sidecar file
    Sidecar(PathBuf),
    /// Inside the image
    Embedded,
}

/// Loaded symbols for one module
#[derive(Debug, Clone)]
pub struct SymbolMap {
    table: SymbolTable,
    source: SymbolSource,
}

impl SymbolMap {
    /// Sidecar path for a module: same stem, `.sym` extension
    #[must_use]
    pub fn sidecar_path(module_path: &Path) -> PathBuf {
        module_path.with_extension("sym")
    }

    /// Whether symbols can be found for the module, without reading them
    #[must_use]
    pub fn available(module_path: &Path, image: &ModuleImage) -> bool {
        image.embedded_symbols.is_some() || Self::sidecar_path(module_path).is_file()
    }

    /// Load symbols for `image`, preferring embedded ones
    pub fn load(module_path: &Path, image: &ModuleImage) -> CovetResult<Self> {
        let (table, source) = if let Some(table) = &image.embedded_symbols {
            (table.clone(), SymbolSource::Embedded)
        } else {
            let path = Self::sidecar_path(module_path);
            let bytes = std::fs::read(&path)
                .map_err(|e| CovetError::parse(&path, format!("no symbols: {e}")))?;
            (SymbolTable::from_bytes(&bytes, &path)?, SymbolSource::Sidecar(path))
        };

        if table.mvid != image.mvid {
            return Err(CovetError::parse(
                module_path,
                format!(
                    "symbols belong to module {} but image is {}",
                    table.mvid, image.mvid
                ),
            ));
        }
        let map = Self { table, source };
        map.validate(module_path)?;
        Ok(map)
    }

    /// Wrap an in-memory table
    #[must_use]
    pub fn from_table(table: SymbolTable, source: SymbolSource) -> Self {
        Self { table, source }
    }

    fn validate(&self, module_path: &Path) -> CovetResult<()> {
        for (token, points) in &self.table.methods {
            for point in points {
                if point.document as usize >= self.table.documents.len() {
                    return Err(CovetError::parse(
                        module_path,
                        format!(
                            "method {token:#x} references missing document {}",
                            point.document
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Where the symbols came from
    #[must_use]
    pub fn source(&self) -> &SymbolSource {
        &self.source
    }

    /// Document paths
    #[must_use]
    pub fn documents(&self) -> &[String] {
        &self.table.documents
    }

    /// Document path by index
    #[must_use]
    pub fn document(&self, index: u32) -> Option<&str> {
        self.table.documents.get(index as usize).map(String::as_str)
    }

    /// Sequence points of a method in ascending offset order
    #[must_use]
    pub fn sequence_points(&self, token: u32) -> Vec<SequencePoint> {
        let mut points = self.table.methods.get(&token).cloned().unwrap_or_default();
        points.sort_by_key(|p| p.offset);
        points
    }

    /// Source position of the instruction at `offset`: the nearest visible
    /// sequence point at or before it
    #[must_use]
    pub fn location(&self, token: u32, offset: u32) -> Option<SourceLocation> {
        let point = self
            .sequence_points(token)
            .into_iter()
            .filter(|p| p.offset <= offset && !p.is_hidden())
            .last()?;
        Some(SourceLocation {
            file: self.document(point.document)?.to_string(),
            line: point.start_line,
            column: point.start_column,
        })
    }

    /// Move every sequence point of `token` through `map`
    pub fn remap_offsets(&mut self, token: u32, map: impl Fn(u32) -> u32) {
        if let Some(points) = self.table.methods.get_mut(&token) {
            for point in points.iter_mut() {
                point.offset = map(point.offset);
            }
        }
    }

    /// Underlying table
    #[must_use]
    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    /// Consume into the underlying table
    #[must_use]
    pub fn into_table(self) -> SymbolTable {
        self.table
    }
}
