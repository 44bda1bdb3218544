/// Translation from backend result metadata to protocol column descriptors
///
/// Every column is projected in the text display format. Type widths,
/// precision and scale are not carried over, and the originating table is
/// always reported as 0.
use super::writer::{ColumnDescriptor, FieldFormat};
use crate::driver::types::type_name;
use crate::driver::FieldDescription;
use tracing::debug;

pub struct ResultProjector;

impl ResultProjector {
    /// Project backend fields into column descriptors, in backend order
    pub fn columns(fields: &[FieldDescription]) -> Vec<ColumnDescriptor> {
        fields
            .iter()
            .map(|field| {
                debug!(
                    "Column read: {} ({})",
                    field.name,
                    type_name(field.type_oid)
                );
                ColumnDescriptor {
                    name: field.name.clone(),
                    table: 0,
                    type_oid: field.type_oid,
                    format: FieldFormat::Text,
                }
            })
            .collect()
    }

    /// Row values are already text; they pass through untouched
    pub fn row(values: &[Option<String>]) -> &[Option<String>] {
        values
    }
}
