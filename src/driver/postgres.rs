/// `tokio-postgres` backed driver
///
/// Statements are prepared only to learn their column and parameter types.
/// Without parameters the statement then runs as a simple query, so values
/// arrive already in the server's own text form. With parameters it runs over
/// the extended protocol with every parameter sent as text, and the binary
/// results are rendered back to text by [`super::text`].
use super::{text, Driver, FieldDescription, QueryStream, Session, StatementDescription, TextRow};
use crate::error::BackendError;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::{StreamExt, TryStreamExt};
use std::error::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, Format, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage, Statement};
use tracing::{debug, warn};

type BoxError = Box<dyn Error + Sync + Send>;

/// Settings applied to every session so rendered values match the
/// `DateStyle`, `IntervalStyle` and `TimeZone` announced to clients
pub const SESSION_SETUP: &str =
    "SET TIME ZONE 'UTC'; SET DateStyle TO 'ISO, MDY'; SET IntervalStyle TO 'postgres'";

/// Opens plain-TCP sessions with `tokio_postgres::connect`
#[derive(Debug, Clone, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn connect(&self, address: &str) -> Result<Box<dyn Session>, BackendError> {
        let (client, connection) = tokio_postgres::connect(address, NoTls)
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let task = tokio::spawn(async move {
            let result = connection.await;
            if let Err(e) = &result {
                warn!("Backend connection terminated: {}", e);
            }
            result
        });

        client.batch_execute(SESSION_SETUP).await?;

        Ok(Box::new(PgSession {
            client: RwLock::new(Some(client)),
            connection: Mutex::new(Some(task)),
        }))
    }
}

/// One `tokio-postgres` client plus the task driving its socket
struct PgSession {
    client: RwLock<Option<Client>>,
    connection: Mutex<Option<JoinHandle<Result<(), tokio_postgres::Error>>>>,
}

#[async_trait]
impl Session for PgSession {
    async fn query(
        &self,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<QueryStream, BackendError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(BackendError::Closed)?;

        let statement = client.prepare(sql).await?;
        let fields = describe_fields(&statement);

        let rows = if params.is_empty() {
            client
                .simple_query_raw(sql)
                .await?
                .try_filter_map(|message| async move {
                    Ok(match message {
                        SimpleQueryMessage::Row(row) => Some(
                            (0..row.len())
                                .map(|i| row.get(i).map(str::to_string))
                                .collect::<TextRow>(),
                        ),
                        _ => None,
                    })
                })
                .map_err(BackendError::from)
                .boxed()
        } else {
            let params = text_params(params);
            client
                .query_raw(&statement, params.iter().map(|p| p as &(dyn ToSql + Sync)))
                .await?
                .map(|row| row.map_err(BackendError::from).and_then(|row| decode_row(&row)))
                .boxed()
        };

        Ok(QueryStream { fields, rows })
    }

    async fn execute(&self, sql: &str, params: &[Option<String>]) -> Result<u64, BackendError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(BackendError::Closed)?;

        if params.is_empty() {
            let mut affected = 0;
            for message in client.simple_query(sql).await? {
                if let SimpleQueryMessage::CommandComplete(count) = message {
                    affected = count;
                }
            }
            return Ok(affected);
        }

        let params = text_params(params);
        let affected = client
            .execute_raw(sql, params.iter().map(|p| p as &(dyn ToSql + Sync)))
            .await?;
        Ok(affected)
    }

    async fn describe(
        &self,
        sql: &str,
        param_types: &[u32],
    ) -> Result<StatementDescription, BackendError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(BackendError::Closed)?;

        let declared: Vec<Type> = param_types
            .iter()
            .map(|oid| Type::from_oid(*oid).unwrap_or(Type::UNKNOWN))
            .collect();
        let statement = client.prepare_typed(sql, &declared).await?;

        Ok(StatementDescription {
            param_types: statement.params().iter().map(Type::oid).collect(),
            fields: describe_fields(&statement),
        })
    }

    async fn query_scalar(&self, sql: &str) -> Result<Option<String>, BackendError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(BackendError::Closed)?;

        for message in client.simple_query(sql).await? {
            if let SimpleQueryMessage::Row(row) = message {
                return Ok(row.get(0).map(str::to_string));
            }
        }
        Ok(None)
    }

    async fn close(&self) -> Result<(), BackendError> {
        // Waits for in-flight queries holding the read lock.
        let client = self.client.write().await.take();
        if client.is_none() {
            return Err(BackendError::Closed);
        }
        drop(client);

        let task = self.connection.lock().await.take();
        match task {
            Some(task) => match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BackendError::Connect(e.to_string())),
                Err(e) => Err(BackendError::Connect(format!("connection task failed: {}", e))),
            },
            None => Ok(()),
        }
    }
}

fn describe_fields(statement: &Statement) -> Vec<FieldDescription> {
    statement
        .columns()
        .iter()
        .map(|column| FieldDescription {
            name: column.name().to_string(),
            type_oid: column.type_().oid(),
        })
        .collect()
}

fn text_params(params: &[Option<String>]) -> Vec<TextParam<'_>> {
    params.iter().map(|p| TextParam(p.as_deref())).collect()
}

fn decode_row(row: &Row) -> Result<TextRow, BackendError> {
    (0..row.len())
        .map(|i| {
            row.try_get::<_, Option<TextValue>>(i)
                .map(|value| value.map(|v| v.0))
                .map_err(|e| {
                    debug!("Column {} failed to render: {}", i, e);
                    BackendError::Decode(e.to_string())
                })
        })
        .collect()
}

/// A parameter sent in text format so the server applies its own input coercion
#[derive(Debug)]
struct TextParam<'a>(Option<&'a str>);

impl ToSql for TextParam<'_> {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            Some(value) => {
                out.put_slice(value.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Any backend value rendered as Postgres text output
struct TextValue(String);

impl<'a> FromSql<'a> for TextValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        text::render(ty, raw).map(TextValue)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}
