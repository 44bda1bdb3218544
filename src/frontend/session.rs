/// One client connection speaking the simple and extended query protocols
///
/// Extended-protocol statements and portals live only in the session. The
/// primary describes a statement when the client asks, and a portal runs
/// through the same path as a simple query once it is executed, so mirrors see
/// the statement text with its bound parameters as text.
use super::codec::{
    BackendMessage, ErrorSeverity, FrontendMessage, PgEncoder, PgParser, StartupMessage, Target,
    TransactionStatus,
};
use crate::core::projector::ResultProjector;
use crate::core::{ColumnDescriptor, ProxyEngine, ResultWriter};
use crate::driver::text;
use crate::error::{EspejoError, EspejoResult};
use crate::utils::display_server_version;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Buffered output is written to the socket once it grows past this size
const FLUSH_THRESHOLD: usize = 8 * 1024;

const FEATURE_NOT_SUPPORTED: &str = "0A000";
const PROTOCOL_VIOLATION: &str = "08P01";
const INVALID_STATEMENT_NAME: &str = "26000";
const INVALID_CURSOR_NAME: &str = "34000";
const DUPLICATE_STATEMENT: &str = "42P05";
const DUPLICATE_CURSOR: &str = "42P03";
const CHARACTER_NOT_IN_REPERTOIRE: &str = "22021";
const INVALID_BINARY_REPRESENTATION: &str = "22P03";

/// Wire format code for binary values
const BINARY: i16 = 1;

/// A parsed statement; a 0 type is left for the server to infer
struct PreparedStatement {
    query: String,
    param_types: Vec<u32>,
}

/// A statement with its parameters bound, ready to execute
struct Portal {
    query: String,
    param_types: Vec<u32>,
    params: Vec<Option<String>>,
}

pub struct ClientSession<S> {
    id: String,
    stream: S,
    engine: Arc<ProxyEngine>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    statements: FnvHashMap<String, PreparedStatement>,
    portals: FnvHashMap<String, Portal>,
    /// Set after an extended-protocol error until the next Sync
    discarding: bool,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: String, stream: S, engine: Arc<ProxyEngine>) -> Self {
        Self {
            id,
            stream,
            engine,
            read_buf: BytesMut::with_capacity(FLUSH_THRESHOLD),
            write_buf: BytesMut::with_capacity(FLUSH_THRESHOLD),
            statements: FnvHashMap::default(),
            portals: FnvHashMap::default(),
            discarding: false,
        }
    }

    /// Run the startup handshake, then serve queries until the client leaves
    pub async fn run(mut self) -> EspejoResult<()> {
        let Some(startup) = self.negotiate().await? else {
            return Ok(());
        };

        match startup {
            StartupMessage::Startup { .. } => {
                info!(
                    "Client {} connected (user {:?}, database {:?})",
                    self.id,
                    startup.param("user").unwrap_or_default(),
                    startup.param("database").unwrap_or_default()
                );
                self.greet(startup.param("application_name").unwrap_or_default())
                    .await?;
                self.serve().await
            }
            StartupMessage::CancelRequest { process_id, .. } => {
                debug!(
                    "Client {} sent a cancel request for {}, ignoring",
                    self.id, process_id
                );
                Ok(())
            }
            // negotiate answers these itself
            StartupMessage::SslRequest | StartupMessage::GssEncRequest => Ok(()),
        }
    }

    /// Complete the handshake only to report a fatal error, then hang up
    pub async fn refuse(mut self, code: &str, message: &str) -> EspejoResult<()> {
        if let Some(StartupMessage::Startup { .. }) = self.negotiate().await? {
            self.send_error(ErrorSeverity::Fatal, code, message);
            self.flush().await?;
        }
        Ok(())
    }

    /// Read startup packets, refusing encryption, until a real startup or cancel arrives
    async fn negotiate(&mut self) -> EspejoResult<Option<StartupMessage>> {
        loop {
            let parsed = PgParser::parse_startup(&mut self.read_buf);
            let message = match parsed {
                Ok(Some(message)) => message,
                Ok(None) => {
                    if !self.fill().await? {
                        return Ok(None);
                    }
                    continue;
                }
                Err(e) => {
                    self.send_error(ErrorSeverity::Fatal, PROTOCOL_VIOLATION, &e.to_string());
                    self.flush().await?;
                    return Err(EspejoError::protocol(e.to_string()));
                }
            };

            match message {
                StartupMessage::SslRequest | StartupMessage::GssEncRequest => {
                    self.stream.write_all(b"N").await?;
                    self.stream.flush().await?;
                }
                other => return Ok(Some(other)),
            }
        }
    }

    async fn greet(&mut self, application_name: &str) -> EspejoResult<()> {
        let version_num = self.engine.announced_version().to_string();
        let version = display_server_version(&version_num);

        let buf = &mut self.write_buf;
        PgEncoder::encode_into(buf, &BackendMessage::AuthenticationOk);
        for (name, value) in [
            ("server_version", version.as_str()),
            ("server_version_num", version_num.as_str()),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("TimeZone", "UTC"),
            ("IntervalStyle", "postgres"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
            ("application_name", application_name),
        ] {
            PgEncoder::encode_into(buf, &BackendMessage::ParameterStatus { name, value });
        }
        PgEncoder::encode_into(
            buf,
            &BackendMessage::BackendKeyData {
                process_id: std::process::id() as i32,
                secret_key: rand::random(),
            },
        );
        PgEncoder::encode_into(
            buf,
            &BackendMessage::ReadyForQuery(TransactionStatus::Idle),
        );
        self.flush().await
    }

    async fn serve(&mut self) -> EspejoResult<()> {
        loop {
            let Some(message) = self.next_message().await? else {
                debug!("Client {} disconnected", self.id);
                return Ok(());
            };

            match message {
                FrontendMessage::Sync => {
                    self.discarding = false;
                    // every Sync ends the implicit transaction, and its portals with it
                    self.portals.clear();
                    self.ready_for_query().await?;
                }
                FrontendMessage::Terminate => {
                    debug!("Client {} terminated the session", self.id);
                    return Ok(());
                }
                FrontendMessage::Unsupported(tag) => {
                    let message = format!("unsupported frontend message type {:?}", tag as char);
                    self.send_error(ErrorSeverity::Fatal, PROTOCOL_VIOLATION, &message);
                    self.flush().await?;
                    return Err(EspejoError::protocol(message));
                }
                _ if self.discarding => {}
                FrontendMessage::Query(sql) => self.simple_query(&sql).await?,
                FrontendMessage::Flush => self.flush().await?,
                extended => {
                    if let Err(e) = self.extended(extended).await {
                        self.discarding = true;
                        self.report_failure(e).await?;
                    }
                }
            }
        }
    }

    async fn simple_query(&mut self, sql: &str) -> EspejoResult<()> {
        // a simple query replaces the unnamed statement
        self.statements.remove("");

        if sql.trim().is_empty() {
            PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::EmptyQueryResponse);
            return self.ready_for_query().await;
        }

        if let Err(e) = self.run_query(sql, &[], true).await {
            self.report_failure(e).await?;
        }
        self.ready_for_query().await
    }

    /// Run one statement through the engine, streaming its result to the client
    async fn run_query(
        &mut self,
        sql: &str,
        params: &[Option<String>],
        describe_rows: bool,
    ) -> EspejoResult<()> {
        let engine = Arc::clone(&self.engine);
        let mut writer = WireWriter {
            stream: &mut self.stream,
            buf: &mut self.write_buf,
            describe_rows,
        };

        let report = engine.handle(sql, params, &mut writer).await?;
        debug!(
            "Client {} query returned {} rows ({} mirrors dispatched, {} dropped)",
            self.id, report.rows, report.mirrors_dispatched, report.mirrors_dropped
        );
        Ok(())
    }

    /// Relay a failed request. Anything the session cannot continue after is
    /// sent as FATAL and returned, which ends the session.
    async fn report_failure(&mut self, e: EspejoError) -> EspejoResult<()> {
        // the client socket itself failed; nothing more can be sent
        if matches!(e, EspejoError::Network(_)) {
            return Err(e);
        }

        if e.is_recoverable() {
            debug!("Client {} request failed: {}", self.id, e);
            self.send_error(ErrorSeverity::Error, e.sqlstate(), &e.client_message());
            return Ok(());
        }

        warn!("Client {} session cannot continue: {}", self.id, e);
        self.send_error(ErrorSeverity::Fatal, e.sqlstate(), &e.client_message());
        self.flush().await?;
        Err(e)
    }

    async fn extended(&mut self, message: FrontendMessage) -> EspejoResult<()> {
        match message {
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => self.parse(name, query, param_types),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                self.bind(portal, &statement, &param_formats, params, &result_formats)
                    .await
            }
            FrontendMessage::Describe { target, name } => self.describe(target, &name).await,
            FrontendMessage::Execute { portal, max_rows } => self.execute(&portal, max_rows).await,
            FrontendMessage::Close { target, name } => {
                // closing a name that does not exist is not an error
                match target {
                    Target::Statement => {
                        self.statements.remove(&name);
                    }
                    Target::Portal => {
                        self.portals.remove(&name);
                    }
                }
                PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::CloseComplete);
                Ok(())
            }
            other => Err(EspejoError::internal(format!(
                "{:?} is not an extended query message",
                other
            ))),
        }
    }

    fn parse(&mut self, name: String, query: String, param_types: Vec<u32>) -> EspejoResult<()> {
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(EspejoError::rejected(
                DUPLICATE_STATEMENT,
                format!("prepared statement \"{}\" already exists", name),
            ));
        }

        debug!("Client {} parsed statement {:?}: {}", self.id, name, query);
        self.statements
            .insert(name, PreparedStatement { query, param_types });
        PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::ParseComplete);
        Ok(())
    }

    async fn bind(
        &mut self,
        portal: String,
        statement: &str,
        param_formats: &[i16],
        params: Vec<Option<Bytes>>,
        result_formats: &[i16],
    ) -> EspejoResult<()> {
        let Some(prepared) = self.statements.get(statement) else {
            return Err(EspejoError::rejected(
                INVALID_STATEMENT_NAME,
                format!("prepared statement \"{}\" does not exist", statement),
            ));
        };
        if !portal.is_empty() && self.portals.contains_key(&portal) {
            return Err(EspejoError::rejected(
                DUPLICATE_CURSOR,
                format!("cursor \"{}\" already exists", portal),
            ));
        }
        if result_formats.iter().any(|format| *format == BINARY) {
            return Err(EspejoError::rejected(
                FEATURE_NOT_SUPPORTED,
                "binary result format is not supported, request text results",
            ));
        }

        let formats = param_formats_for(param_formats, params.len())?;
        let query = prepared.query.clone();
        let mut param_types = prepared.param_types.clone();

        // binary values are decoded by type, so undeclared types are looked up first
        let undeclared_binary = formats
            .iter()
            .enumerate()
            .any(|(i, format)| *format == BINARY && param_types.get(i).copied().unwrap_or(0) == 0);
        if undeclared_binary {
            param_types = self.engine.describe(&query, &param_types).await?.param_types;
        }

        let params = params
            .into_iter()
            .zip(formats)
            .enumerate()
            .map(|(i, (value, format))| {
                let type_oid = param_types.get(i).copied().unwrap_or(0);
                value.map(|raw| param_text(&raw, format, type_oid)).transpose()
            })
            .collect::<EspejoResult<Vec<_>>>()?;

        self.portals.insert(
            portal,
            Portal {
                query,
                param_types,
                params,
            },
        );
        PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::BindComplete);
        Ok(())
    }

    async fn describe(&mut self, target: Target, name: &str) -> EspejoResult<()> {
        let (query, param_types) = match target {
            Target::Statement => self
                .statements
                .get(name)
                .map(|s| (s.query.clone(), s.param_types.clone()))
                .ok_or_else(|| {
                    EspejoError::rejected(
                        INVALID_STATEMENT_NAME,
                        format!("prepared statement \"{}\" does not exist", name),
                    )
                })?,
            Target::Portal => self
                .portals
                .get(name)
                .map(|p| (p.query.clone(), p.param_types.clone()))
                .ok_or_else(|| missing_portal(name))?,
        };

        let description = if query.trim().is_empty() {
            Default::default()
        } else {
            self.engine.describe(&query, &param_types).await?
        };

        if target == Target::Statement {
            PgEncoder::encode_into(
                &mut self.write_buf,
                &BackendMessage::ParameterDescription(&description.param_types),
            );
        }
        if description.fields.is_empty() {
            PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::NoData);
        } else {
            let columns = ResultProjector::columns(&description.fields);
            PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::RowDescription(&columns));
        }
        Ok(())
    }

    /// Run a portal to completion. A row limit is not honoured: the whole
    /// result is sent and the portal is consumed.
    async fn execute(&mut self, name: &str, max_rows: i32) -> EspejoResult<()> {
        let portal = self.portals.remove(name).ok_or_else(|| missing_portal(name))?;
        if max_rows > 0 {
            debug!(
                "Client {} asked for {} rows from portal {:?}, sending all of them",
                self.id, max_rows, name
            );
        }

        if portal.query.trim().is_empty() {
            PgEncoder::encode_into(&mut self.write_buf, &BackendMessage::EmptyQueryResponse);
            return Ok(());
        }
        self.run_query(&portal.query, &portal.params, false).await
    }

    async fn ready_for_query(&mut self) -> EspejoResult<()> {
        PgEncoder::encode_into(
            &mut self.write_buf,
            &BackendMessage::ReadyForQuery(TransactionStatus::Idle),
        );
        self.flush().await
    }

    fn send_error(&mut self, severity: ErrorSeverity, code: &str, message: &str) {
        PgEncoder::encode_into(
            &mut self.write_buf,
            &BackendMessage::ErrorResponse {
                severity,
                code,
                message,
            },
        );
    }

    async fn next_message(&mut self) -> EspejoResult<Option<FrontendMessage>> {
        loop {
            if let Some(message) = PgParser::parse(&mut self.read_buf)
                .map_err(|e| EspejoError::protocol(e.to_string()))?
            {
                return Ok(Some(message));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Read more bytes. Returns false on a clean end of stream.
    async fn fill(&mut self) -> EspejoResult<bool> {
        if self.stream.read_buf(&mut self.read_buf).await? > 0 {
            return Ok(true);
        }
        if self.read_buf.is_empty() {
            Ok(false)
        } else {
            Err(EspejoError::protocol("connection closed in the middle of a message"))
        }
    }

    async fn flush(&mut self) -> EspejoResult<()> {
        flush_buf(&mut self.stream, &mut self.write_buf).await
    }
}

fn missing_portal(name: &str) -> EspejoError {
    EspejoError::rejected(
        INVALID_CURSOR_NAME,
        format!("portal \"{}\" does not exist", name),
    )
}

/// Per-parameter format codes: none means all text, one applies to every parameter
fn param_formats_for(formats: &[i16], count: usize) -> EspejoResult<Vec<i16>> {
    match formats.len() {
        0 => Ok(vec![0; count]),
        1 => Ok(vec![formats[0]; count]),
        n if n == count => Ok(formats.to_vec()),
        n => Err(EspejoError::rejected(
            PROTOCOL_VIOLATION,
            format!("bind message has {} parameter formats but {} parameters", n, count),
        )),
    }
}

/// A bound parameter value as the text both primary and mirrors receive
fn param_text(raw: &[u8], format: i16, type_oid: u32) -> EspejoResult<String> {
    if format == BINARY {
        return text::render_oid(type_oid, raw).map_err(|e| {
            EspejoError::rejected(
                INVALID_BINARY_REPRESENTATION,
                format!("could not read binary parameter: {}", e),
            )
        });
    }
    String::from_utf8(raw.to_vec()).map_err(|_| {
        EspejoError::rejected(
            CHARACTER_NOT_IN_REPERTOIRE,
            "invalid byte sequence for encoding \"UTF8\" in parameter",
        )
    })
}

async fn flush_buf<S>(stream: &mut S, buf: &mut BytesMut) -> EspejoResult<()>
where
    S: AsyncWrite + Unpin + Send,
{
    if !buf.is_empty() {
        stream.write_all(buf).await?;
        buf.clear();
    }
    stream.flush().await?;
    Ok(())
}

/// Encodes a primary result straight into the client's output buffer
struct WireWriter<'a, S> {
    stream: &'a mut S,
    buf: &'a mut BytesMut,
    /// Extended-protocol results carry no RowDescription; Describe sends it
    describe_rows: bool,
}

#[async_trait]
impl<'a, S> ResultWriter for WireWriter<'a, S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn define_columns(&mut self, columns: &[ColumnDescriptor]) -> EspejoResult<()> {
        if self.describe_rows {
            PgEncoder::encode_into(self.buf, &BackendMessage::RowDescription(columns));
        }
        Ok(())
    }

    async fn emit_row(&mut self, values: &[Option<String>]) -> EspejoResult<()> {
        PgEncoder::encode_into(self.buf, &BackendMessage::DataRow(values));
        if self.buf.len() >= FLUSH_THRESHOLD {
            flush_buf(&mut *self.stream, &mut *self.buf).await?;
        }
        Ok(())
    }

    async fn complete(&mut self, status: &str) -> EspejoResult<()> {
        PgEncoder::encode_into(self.buf, &BackendMessage::CommandComplete(status));
        Ok(())
    }
}
