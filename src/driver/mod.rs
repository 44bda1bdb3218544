/// Backend driver seam
///
/// The engine never talks to the network directly. It opens sessions through a
/// [`Driver`] and runs queries through the returned [`Session`]. The crate ships
/// a `tokio-postgres` implementation in [`postgres`].
pub mod postgres;
pub mod text;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::BackendError;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use postgres::PostgresDriver;

/// A row as text values, `None` for SQL NULL
pub type TextRow = Vec<Option<String>>;

/// Column metadata reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: u32,
}

/// What the backend reports for a statement without running it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementDescription {
    /// Parameter type OIDs, declared or inferred
    pub param_types: Vec<u32>,
    pub fields: Vec<FieldDescription>,
}

/// Output of a query: every field description, then a stream of rows
pub struct QueryStream {
    pub fields: Vec<FieldDescription>,
    pub rows: BoxStream<'static, Result<TextRow, BackendError>>,
}

/// Opens sessions against a backend address
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn Session>, BackendError>;
}

/// A live connection to one backend
#[async_trait]
pub trait Session: Send + Sync {
    /// Run a query whose result will be streamed to a client
    async fn query(
        &self,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<QueryStream, BackendError>;

    /// Run a query, drain and discard the result, return the affected row count
    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64, BackendError>;

    /// Parameter and result types of `sql`. `param_types` holds the types the
    /// client declared, 0 where it left one open.
    async fn describe(
        &self,
        sql: &str,
        param_types: &[u32],
    ) -> Result<StatementDescription, BackendError>;

    /// First column of the first row, if any
    async fn query_scalar(&self, sql: &str) -> Result<Option<String>, BackendError>;

    /// Release the connection. Later calls fail with [`BackendError::Closed`].
    async fn close(&self) -> Result<(), BackendError>;
}
