//! Writing instrumented modules to disk, and putting originals back.

use super::record::InstrumenterResult;
use crate::result::{CovetError, CovetResult};
use crate::symbols::SymbolMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

fn temp_beside(path: &Path, bytes: &[u8]) -> CovetResult<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Replace `path` with `bytes` through a temporary file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> CovetResult<()> {
    let tmp = temp_beside(path, bytes)?;
    let _ = tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Replace the module image and, when given, its sidecar symbols together
///
/// Both are staged first. If the image lands but the symbols do not, the
/// image is put back to `original` so the module is never left half-written.
pub fn commit_module(
    module_path: &Path,
    original: &[u8],
    image: &[u8],
    symbols: Option<&[u8]>,
) -> CovetResult<()> {
    let staged_image = temp_beside(module_path, image)?;
    let staged_symbols = match symbols {
        Some(bytes) => Some(temp_beside(&SymbolMap::sidecar_path(module_path), bytes)?),
        None => None,
    };

    let _ = staged_image.persist(module_path).map_err(|e| e.error)?;
    if let Some(staged) = staged_symbols {
        if let Err(e) = staged.persist(SymbolMap::sidecar_path(module_path)) {
            warn!(
                module = %module_path.display(),
                error = %e.error,
                "symbol commit failed, restoring original module"
            );
            write_atomic(module_path, original)?;
            return Err(CovetError::Io(e.error));
        }
    }
    debug!(module = %module_path.display(), "committed instrumented module");
    Ok(())
}

fn backup_name(module_path: &Path, run_id: &str) -> CovetResult<String> {
    let name = module_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CovetError::config(format!("bad module path {}", module_path.display())))?;
    Ok(format!("{run_id}.{name}"))
}

/// Copy the module and its sidecar symbols into `backup_dir`
///
/// Returns the backup path of the module.
pub fn backup_module(module_path: &Path, backup_dir: &Path, run_id: &str) -> CovetResult<PathBuf> {
    std::fs::create_dir_all(backup_dir)?;
    let backup = backup_dir.join(backup_name(module_path, run_id)?);
    let _ = std::fs::copy(module_path, &backup)?;

    let sidecar = SymbolMap::sidecar_path(module_path);
    if sidecar.is_file() {
        let _ = std::fs::copy(&sidecar, SymbolMap::sidecar_path(&backup))?;
    }
    debug!(module = %module_path.display(), backup = %backup.display(), "backed up module");
    Ok(backup)
}

/// Put the original module back from its backup
pub fn restore_original_module(result: &InstrumenterResult) -> CovetResult<()> {
    let Some(backup) = &result.backup_path else {
        return Err(CovetError::config(format!(
            "no backup recorded for module {}",
            result.module
        )));
    };
    let original = std::fs::read(backup)?;
    let sidecar = SymbolMap::sidecar_path(backup);
    let symbols = if sidecar.is_file() {
        Some(std::fs::read(&sidecar)?)
    } else {
        None
    };

    let current = std::fs::read(&result.module_path)?;
    commit_module(&result.module_path, &current, &original, symbols.as_deref())?;
    info!(module = %result.module, "restored original module");
    Ok(())
}
