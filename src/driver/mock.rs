/// In-memory driver for unit tests
use super::{Driver, FieldDescription, QueryStream, Session, StatementDescription, TextRow};
use crate::error::BackendError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Query,
    Execute,
    Describe,
    Scalar,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub address: String,
    pub kind: CallKind,
    pub sql: String,
    pub params: Vec<Option<String>>,
}

/// Scripted behaviour of one backend
#[derive(Debug, Clone, Default)]
pub(crate) struct MockBackend {
    pub version: Option<String>,
    pub version_error: bool,
    pub param_types: Vec<u32>,
    pub fields: Vec<FieldDescription>,
    pub rows: Vec<TextRow>,
    pub query_error: Option<BackendError>,
    pub fail_after_rows: Option<usize>,
    pub delay: Option<Duration>,
    pub hang: bool,
    pub connect_hang: bool,
    pub close_error: bool,
}

impl MockBackend {
    pub fn with_version(version: &str) -> Self {
        Self {
            version: Some(version.to_string()),
            ..Default::default()
        }
    }

    pub fn returning(mut self, fields: &[(&str, u32)], rows: Vec<TextRow>) -> Self {
        self.fields = fields
            .iter()
            .map(|(name, oid)| FieldDescription {
                name: name.to_string(),
                type_oid: *oid,
            })
            .collect();
        self.rows = rows;
        self
    }

    pub fn with_params(mut self, param_types: &[u32]) -> Self {
        self.param_types = param_types.to_vec();
        self
    }

    pub fn reporting_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn failing(mut self, error: BackendError) -> Self {
        self.query_error = Some(error);
        self
    }
}

pub(crate) fn row(values: &[&str]) -> TextRow {
    values.iter().map(|v| Some(v.to_string())).collect()
}

/// Driver serving [`MockBackend`]s by address. Unknown addresses refuse connections.
#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    backends: HashMap<String, MockBackend>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, address: &str, backend: MockBackend) -> Self {
        self.backends.insert(address.to_string(), backend);
        self
    }

    pub fn calls(&self, address: &str, kind: CallKind) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.address == address && c.kind == kind)
            .cloned()
            .collect()
    }

    /// Poll until `address` has seen `count` calls of `kind`, or give up after a second
    pub async fn wait_for_calls(&self, address: &str, kind: CallKind, count: usize) -> Vec<Call> {
        for _ in 0..200 {
            let calls = self.calls(address, kind);
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.calls(address, kind)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, address: &str) -> Result<Box<dyn Session>, BackendError> {
        match self.backends.get(address) {
            Some(backend) if backend.connect_hang => {
                futures::future::pending::<()>().await;
                Err(BackendError::Closed)
            }
            Some(backend) => Ok(Box::new(MockSession {
                address: address.to_string(),
                backend: backend.clone(),
                calls: Arc::clone(&self.calls),
                closed: Mutex::new(false),
            })),
            None => Err(BackendError::Connect("connection refused".to_string())),
        }
    }
}

struct MockSession {
    address: String,
    backend: MockBackend,
    calls: Arc<Mutex<Vec<Call>>>,
    closed: Mutex<bool>,
}

impl MockSession {
    fn record(
        &self,
        kind: CallKind,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<(), BackendError> {
        if *self.closed.lock().unwrap() {
            return Err(BackendError::Closed);
        }
        self.calls.lock().unwrap().push(Call {
            address: self.address.clone(),
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Ok(())
    }

    async fn stall(&self) {
        if self.backend.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = self.backend.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn query(
        &self,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<QueryStream, BackendError> {
        self.record(CallKind::Query, sql, params)?;
        self.stall().await;
        if let Some(error) = &self.backend.query_error {
            return Err(error.clone());
        }

        let mut rows: Vec<Result<TextRow, BackendError>> =
            self.backend.rows.iter().cloned().map(Ok).collect();
        if let Some(n) = self.backend.fail_after_rows {
            rows.truncate(n);
            rows.push(Err(BackendError::query("connection lost mid-result")));
        }

        Ok(QueryStream {
            fields: self.backend.fields.clone(),
            rows: futures::stream::iter(rows).boxed(),
        })
    }

    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64, BackendError> {
        self.record(CallKind::Execute, sql, params)?;
        self.stall().await;
        if let Some(error) = &self.backend.query_error {
            return Err(error.clone());
        }
        if self.backend.fail_after_rows.is_some() {
            return Err(BackendError::query("connection lost mid-result"));
        }
        Ok(self.backend.rows.len() as u64)
    }

    async fn describe(
        &self,
        sql: &str,
        param_types: &[u32],
    ) -> Result<StatementDescription, BackendError> {
        let declared: Vec<Option<String>> =
            param_types.iter().map(|oid| Some(oid.to_string())).collect();
        self.record(CallKind::Describe, sql, &declared)?;
        if let Some(error) = &self.backend.query_error {
            return Err(error.clone());
        }

        // declared types win over the scripted ones
        let mut params = self.backend.param_types.clone();
        if params.len() < param_types.len() {
            params.resize(param_types.len(), 0);
        }
        for (slot, oid) in params.iter_mut().zip(param_types) {
            if *oid != 0 {
                *slot = *oid;
            }
        }

        Ok(StatementDescription {
            param_types: params,
            fields: self.backend.fields.clone(),
        })
    }

    async fn query_scalar(&self, sql: &str) -> Result<Option<String>, BackendError> {
        self.record(CallKind::Scalar, sql, &[])?;
        if self.backend.version_error {
            return Err(BackendError::query("permission denied"));
        }
        Ok(self.backend.version.clone())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.record(CallKind::Close, "", &[])?;
        *self.closed.lock().unwrap() = true;
        if self.backend.close_error {
            return Err(BackendError::Connect("socket already gone".to_string()));
        }
        Ok(())
    }
}
