/// Client-facing result sink
///
/// The front-end hands the engine a [`ResultWriter`] per query. The engine
/// calls `define_columns` exactly once, then `emit_row` per row, then
/// `complete` exactly once, or returns an error instead.
use crate::error::EspejoResult;
use async_trait::async_trait;

/// Display format of a column. Only text is ever produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    Text,
}

impl FieldFormat {
    /// Format code used on the wire
    pub fn code(&self) -> i16 {
        match self {
            FieldFormat::Text => 0,
        }
    }
}

/// Protocol-level column descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Originating table OID; always 0
    pub table: u32,
    pub type_oid: u32,
    pub format: FieldFormat,
}

#[async_trait]
pub trait ResultWriter: Send {
    async fn define_columns(&mut self, columns: &[ColumnDescriptor]) -> EspejoResult<()>;

    async fn emit_row(&mut self, values: &[Option<String>]) -> EspejoResult<()>;

    async fn complete(&mut self, status: &str) -> EspejoResult<()>;
}
