//! Metadata layout finalization: decides inlined-vs-out-of-line placement
//! for each bytecode variant's metadata struct, assigns the 32-bit offset
//! used when out-of-line, and validates alignment against the configured
//! maximum.

use crate::config::BuildConfig;
use crate::diagnostics::MetadataError;
use crate::variant::{MetadataPlacement, MetadataStructLayout};
use serde::Serialize;

/// Threshold below which a metadata struct is inlined directly after the
/// bytecode struct rather than referenced by an out-of-line offset. Matches
/// the rationale in the algorithm description: small metadata costs more in
/// offset-field overhead than it saves, so it is inlined.
const INLINE_SIZE_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMetadata {
    pub variant_name: String,
    pub layout: MetadataStructLayout,
    /// Byte offset from the start of the bytecode struct at which the
    /// metadata (or its out-of-line pointer) lives. Always present: for
    /// `Inlined` placement this is where the struct itself starts; for
    /// `OutOfLine` it is where the 32-bit offset field starts.
    pub offset: u32,
}

pub struct MetadataRegistry {
    config: BuildConfig,
    entries: Vec<ResolvedMetadata>,
}

impl MetadataRegistry {
    pub fn new(config: BuildConfig) -> Self {
        MetadataRegistry { config, entries: Vec::new() }
    }

    /// Finalize placement for one variant's raw (unplaced) metadata size
    /// and alignment request, appending it after the previously registered
    /// entries' bytecode-struct tail at `bytecode_struct_size`.
    pub fn register(
        &mut self,
        variant_name: &str,
        raw_size: u32,
        raw_alignment: u32,
        bytecode_struct_size: u32,
    ) -> Result<(), MetadataError> {
        if raw_alignment > self.config.max_metadata_alignment {
            return Err(MetadataError::AlignmentExceeded(
                variant_name.to_string(),
                raw_alignment,
                self.config.max_metadata_alignment,
            ));
        }

        let placement = if raw_size <= INLINE_SIZE_THRESHOLD {
            MetadataPlacement::Inlined
        } else {
            MetadataPlacement::OutOfLine
        };

        let offset = match placement {
            MetadataPlacement::Inlined => bytecode_struct_size,
            MetadataPlacement::OutOfLine => {
                // The offset field itself is a fixed 4 bytes appended right
                // after the bytecode struct.
                bytecode_struct_size
            }
        };

        if offset.checked_add(raw_size).is_none() {
            return Err(MetadataError::OffsetOverflow(variant_name.to_string()));
        }

        self.entries.push(ResolvedMetadata {
            variant_name: variant_name.to_string(),
            layout: MetadataStructLayout { placement, size: raw_size, alignment: raw_alignment },
            offset,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[ResolvedMetadata] {
        &self.entries
    }
}
