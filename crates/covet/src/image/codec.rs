//! On-disk encoding of module images: magic, version, bincode payload.

use super::ModuleImage;
use crate::result::{CovetError, CovetResult};
use std::path::Path;

/// Magic bytes at the start of an image file
pub const IMAGE_MAGIC: [u8; 4] = *b"CVIM";

/// Current image format version
pub const IMAGE_VERSION: u16 = 1;

/// Encode an image
pub fn encode_image(image: &ModuleImage) -> CovetResult<Vec<u8>> {
    let payload = bincode::serialize(image)?;
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.extend_from_slice(&IMAGE_MAGIC);
    out.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode an image; `path` is used for error context
pub fn decode_image(bytes: &[u8], path: &Path) -> CovetResult<ModuleImage> {
    if bytes.len() < 6 || bytes[..4] != IMAGE_MAGIC {
        return Err(CovetError::parse(path, "not a managed image"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != IMAGE_VERSION {
        return Err(CovetError::parse(
            path,
            format!("unsupported image version {version}"),
        ));
    }
    let image: ModuleImage =
        bincode::deserialize(&bytes[6..]).map_err(|e| CovetError::parse(path, e.to_string()))?;
    check_operands(&image, path)?;
    Ok(image)
}

/// Every instruction must carry the operand shape its opcode declares
fn check_operands(image: &ModuleImage, path: &Path) -> CovetResult<()> {
    for ty in &image.types {
        for method in &ty.methods {
            let Some(body) = &method.body else { continue };
            if let Some(bad) = body
                .instructions
                .iter()
                .find(|i| !i.opcode.accepts(&i.operand))
            {
                return Err(CovetError::parse(
                    path,
                    format!(
                        "{}::{} IL_{:04x}: {:?} expects {:?}, found {:?}",
                        image.type_full_name(ty),
                        method.name,
                        bad.offset,
                        bad.opcode,
                        bad.opcode.operand_kind(),
                        bad.operand
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Read and decode an image file
pub fn read_image(path: &Path) -> CovetResult<ModuleImage> {
    let bytes = std::fs::read(path).map_err(|e| CovetError::parse(path, e.to_string()))?;
    decode_image(&bytes, path)
}
