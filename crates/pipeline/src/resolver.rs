//! Turns a mapped cell into a typed field write.

use bulkedit_core::fields::{ConversionError, FieldValue, ParseOptions};
use bulkedit_core::mapping::ColumnMapping;

/// Resolves the raw text of one mapped cell into the value written to the
/// mapped downstream field.
pub trait FieldResolver: Send + Sync {
    fn resolve(
        &self,
        mapping: &ColumnMapping,
        raw: &str,
        opts: &ParseOptions,
    ) -> Result<FieldValue, ConversionError>;
}

/// Resolver driven entirely by the field kinds stored in the job mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappingResolver;

impl FieldResolver for MappingResolver {
    fn resolve(
        &self,
        mapping: &ColumnMapping,
        raw: &str,
        opts: &ParseOptions,
    ) -> Result<FieldValue, ConversionError> {
        mapping.field.convert(raw, opts)
    }
}
