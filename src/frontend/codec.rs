/// PostgreSQL v3 wire protocol parsing and generation (server side)
use crate::core::ColumnDescriptor;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

pub const PROTOCOL_VERSION_3: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Largest startup packet accepted, as the server enforces
const MAX_STARTUP_LEN: usize = 10_000;
/// Largest regular message accepted
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// First packet a client sends, which carries no type byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup { params: Vec<(String, String)> },
}

impl StartupMessage {
    /// Value of a startup parameter such as `user` or `database`
    pub fn param(&self, name: &str) -> Option<&str> {
        match self {
            StartupMessage::Startup { params } => params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

/// What a Describe or Close message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

/// Typed messages after startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Simple query ('Q')
    Query(String),
    /// Parse ('P'); a 0 type leaves the parameter type to the server
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    /// Bind ('B'); `None` values are SQL NULL
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<i16>,
    },
    /// Describe ('D')
    Describe { target: Target, name: String },
    /// Execute ('E'); a `max_rows` of 0 means no limit
    Execute { portal: String, max_rows: i32 },
    /// Close ('C')
    Close { target: Target, name: String },
    Flush,
    Sync,
    Terminate,
    /// Anything else; the session cannot continue
    Unsupported(u8),
}

/// Transaction status reported with ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
}

impl TransactionStatus {
    fn code(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Fatal,
}

impl ErrorSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Fatal => "FATAL",
        }
    }
}

/// Messages the proxy sends to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage<'a> {
    AuthenticationOk,
    ParameterStatus { name: &'a str, value: &'a str },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(&'a [ColumnDescriptor]),
    DataRow(&'a [Option<String>]),
    CommandComplete(&'a str),
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription(&'a [u32]),
    ErrorResponse {
        severity: ErrorSeverity,
        code: &'a str,
        message: &'a str,
    },
}

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum PgParseError {
    #[error("Invalid message length {length} for message type {tag:?}")]
    InvalidLength { tag: Option<char>, length: usize },
    #[error("Unsupported frontend protocol {major}.{minor}")]
    UnsupportedProtocol { major: i32, minor: i32 },
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Frontend message parser
pub struct PgParser;

/// Backend message encoder
pub struct PgEncoder;

impl PgParser {
    /// Parse the untyped startup packet. `Ok(None)` means more bytes are needed.
    pub fn parse_startup(buf: &mut BytesMut) -> Result<Option<StartupMessage>, PgParseError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len < 8 || len as usize > MAX_STARTUP_LEN {
            return Err(PgParseError::InvalidLength {
                tag: None,
                length: len.max(0) as usize,
            });
        }
        let len = len as usize;
        if buf.len() < len {
            return Ok(None);
        }

        let mut packet = buf.split_to(len);
        packet.advance(4);
        let code = packet.get_i32();

        match code {
            SSL_REQUEST_CODE => Ok(Some(StartupMessage::SslRequest)),
            GSSENC_REQUEST_CODE => Ok(Some(StartupMessage::GssEncRequest)),
            CANCEL_REQUEST_CODE => {
                if packet.remaining() < 8 {
                    return Err(PgParseError::Malformed("short cancel request".to_string()));
                }
                Ok(Some(StartupMessage::CancelRequest {
                    process_id: packet.get_i32(),
                    secret_key: packet.get_i32(),
                }))
            }
            PROTOCOL_VERSION_3 => {
                let mut params = Vec::new();
                loop {
                    let key = read_cstring(&mut packet)?;
                    if key.is_empty() {
                        break;
                    }
                    let value = read_cstring(&mut packet)?;
                    params.push((key, value));
                }
                Ok(Some(StartupMessage::Startup { params }))
            }
            other => Err(PgParseError::UnsupportedProtocol {
                major: other >> 16,
                minor: other & 0xffff,
            }),
        }
    }

    /// Parse one typed message. `Ok(None)` means more bytes are needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<FrontendMessage>, PgParseError> {
        if buf.len() < 5 {
            return Ok(None);
        }

        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgParseError::InvalidLength {
                tag: Some(tag as char),
                length: len.max(0) as usize,
            });
        }
        let len = len as usize;
        if buf.len() < len + 1 {
            return Ok(None);
        }

        let mut body = buf.split_to(len + 1);
        body.advance(5);

        let message = match tag {
            b'Q' => FrontendMessage::Query(read_cstring(&mut body)?),
            b'P' => {
                let name = read_cstring(&mut body)?;
                let query = read_cstring(&mut body)?;
                let count = read_count(&mut body)?;
                let param_types = (0..count)
                    .map(|_| read_u32(&mut body))
                    .collect::<Result<_, _>>()?;
                FrontendMessage::Parse {
                    name,
                    query,
                    param_types,
                }
            }
            b'B' => {
                let portal = read_cstring(&mut body)?;
                let statement = read_cstring(&mut body)?;
                let count = read_count(&mut body)?;
                let param_formats = (0..count)
                    .map(|_| read_i16(&mut body))
                    .collect::<Result<_, _>>()?;
                let count = read_count(&mut body)?;
                let params = (0..count)
                    .map(|_| read_value(&mut body))
                    .collect::<Result<_, _>>()?;
                let count = read_count(&mut body)?;
                let result_formats = (0..count)
                    .map(|_| read_i16(&mut body))
                    .collect::<Result<_, _>>()?;
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            b'D' => FrontendMessage::Describe {
                target: read_target(&mut body)?,
                name: read_cstring(&mut body)?,
            },
            b'E' => FrontendMessage::Execute {
                portal: read_cstring(&mut body)?,
                max_rows: read_i32(&mut body)?,
            },
            b'C' => FrontendMessage::Close {
                target: read_target(&mut body)?,
                name: read_cstring(&mut body)?,
            },
            b'H' => FrontendMessage::Flush,
            b'S' => FrontendMessage::Sync,
            b'X' => FrontendMessage::Terminate,
            other => FrontendMessage::Unsupported(other),
        };
        Ok(Some(message))
    }
}

fn ensure(buf: &BytesMut, len: usize, what: &str) -> Result<(), PgParseError> {
    if buf.remaining() < len {
        return Err(PgParseError::Malformed(format!("truncated {}", what)));
    }
    Ok(())
}

fn read_i16(buf: &mut BytesMut) -> Result<i16, PgParseError> {
    ensure(buf, 2, "int16")?;
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut BytesMut) -> Result<i32, PgParseError> {
    ensure(buf, 4, "int32")?;
    Ok(buf.get_i32())
}

fn read_u32(buf: &mut BytesMut) -> Result<u32, PgParseError> {
    ensure(buf, 4, "type oid")?;
    Ok(buf.get_u32())
}

fn read_count(buf: &mut BytesMut) -> Result<usize, PgParseError> {
    let count = read_i16(buf)?;
    if count < 0 {
        return Err(PgParseError::Malformed(format!("negative count {}", count)));
    }
    Ok(count as usize)
}

/// Length-prefixed parameter value; length -1 is NULL
fn read_value(buf: &mut BytesMut) -> Result<Option<Bytes>, PgParseError> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    ensure(buf, len as usize, "parameter value")?;
    Ok(Some(buf.split_to(len as usize).freeze()))
}

fn read_target(buf: &mut BytesMut) -> Result<Target, PgParseError> {
    ensure(buf, 1, "describe target")?;
    match buf.get_u8() {
        b'S' => Ok(Target::Statement),
        b'P' => Ok(Target::Portal),
        other => Err(PgParseError::Malformed(format!(
            "unknown target {:?}",
            other as char
        ))),
    }
}

fn read_cstring(buf: &mut BytesMut) -> Result<String, PgParseError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgParseError::Malformed("missing string terminator".to_string()))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    Ok(str::from_utf8(&raw)?.to_string())
}

impl PgEncoder {
    /// Append a message to the buffer
    pub fn encode_into(buf: &mut BytesMut, message: &BackendMessage<'_>) {
        match message {
            BackendMessage::AuthenticationOk => {
                let start = begin(buf, b'R');
                buf.put_i32(0);
                finish(buf, start);
            }
            BackendMessage::ParameterStatus { name, value } => {
                let start = begin(buf, b'S');
                put_cstring(buf, name);
                put_cstring(buf, value);
                finish(buf, start);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                let start = begin(buf, b'K');
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
                finish(buf, start);
            }
            BackendMessage::ReadyForQuery(status) => {
                let start = begin(buf, b'Z');
                buf.put_u8(status.code());
                finish(buf, start);
            }
            BackendMessage::RowDescription(columns) => {
                let start = begin(buf, b'T');
                buf.put_i16(columns.len() as i16);
                for column in columns.iter() {
                    put_cstring(buf, &column.name);
                    buf.put_u32(column.table);
                    // attribute number
                    buf.put_i16(0);
                    buf.put_u32(column.type_oid);
                    // type size and modifier are not computed
                    buf.put_i16(-1);
                    buf.put_i32(-1);
                    buf.put_i16(column.format.code());
                }
                finish(buf, start);
            }
            BackendMessage::DataRow(values) => {
                let start = begin(buf, b'D');
                buf.put_i16(values.len() as i16);
                for value in values.iter() {
                    match value {
                        Some(text) => {
                            buf.put_i32(text.len() as i32);
                            buf.put_slice(text.as_bytes());
                        }
                        None => buf.put_i32(-1),
                    }
                }
                finish(buf, start);
            }
            BackendMessage::CommandComplete(tag) => {
                let start = begin(buf, b'C');
                put_cstring(buf, tag);
                finish(buf, start);
            }
            BackendMessage::EmptyQueryResponse => {
                let start = begin(buf, b'I');
                finish(buf, start);
            }
            BackendMessage::ParseComplete => {
                let start = begin(buf, b'1');
                finish(buf, start);
            }
            BackendMessage::BindComplete => {
                let start = begin(buf, b'2');
                finish(buf, start);
            }
            BackendMessage::CloseComplete => {
                let start = begin(buf, b'3');
                finish(buf, start);
            }
            BackendMessage::NoData => {
                let start = begin(buf, b'n');
                finish(buf, start);
            }
            BackendMessage::ParameterDescription(types) => {
                let start = begin(buf, b't');
                buf.put_i16(types.len() as i16);
                for oid in types.iter() {
                    buf.put_u32(*oid);
                }
                finish(buf, start);
            }
            BackendMessage::ErrorResponse {
                severity,
                code,
                message,
            } => {
                let start = begin(buf, b'E');
                buf.put_u8(b'S');
                put_cstring(buf, severity.as_str());
                buf.put_u8(b'V');
                put_cstring(buf, severity.as_str());
                buf.put_u8(b'C');
                put_cstring(buf, code);
                buf.put_u8(b'M');
                put_cstring(buf, message);
                buf.put_u8(0);
                finish(buf, start);
            }
        }
    }

    /// Encode a single message into a fresh buffer
    pub fn encode(message: &BackendMessage<'_>) -> BytesMut {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, message);
        buf
    }
}

/// Write the type byte and a length placeholder, returning the length offset
fn begin(buf: &mut BytesMut, tag: u8) -> usize {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    start
}

fn finish(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldFormat;

    fn startup_packet(code: i32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32((8 + body.len()) as i32);
        buf.put_i32(code);
        buf.put_slice(body);
        buf
    }

    fn typed(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_i32((4 + body.len()) as i32);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn test_parse_ssl_request() {
        let mut buf = startup_packet(SSL_REQUEST_CODE, &[]);
        assert_eq!(
            PgParser::parse_startup(&mut buf).unwrap(),
            Some(StartupMessage::SslRequest)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_startup_params() {
        let mut buf = startup_packet(PROTOCOL_VERSION_3, b"user\0app\0database\0orders\0\0");
        let message = PgParser::parse_startup(&mut buf).unwrap().unwrap();

        assert_eq!(message.param("user"), Some("app"));
        assert_eq!(message.param("database"), Some("orders"));
        assert_eq!(message.param("application_name"), None);
    }

    #[test]
    fn test_parse_cancel_request() {
        let mut body = BytesMut::new();
        body.put_i32(42);
        body.put_i32(7);
        let mut buf = startup_packet(CANCEL_REQUEST_CODE, &body);

        assert_eq!(
            PgParser::parse_startup(&mut buf).unwrap(),
            Some(StartupMessage::CancelRequest {
                process_id: 42,
                secret_key: 7
            })
        );
    }

    #[test]
    fn test_parse_startup_rejects_old_protocol() {
        let mut buf = startup_packet(2 << 16, b"\0");
        assert!(matches!(
            PgParser::parse_startup(&mut buf),
            Err(PgParseError::UnsupportedProtocol { major: 2, minor: 0 })
        ));
    }

    #[test]
    fn test_parse_startup_rejects_oversized_packet() {
        let mut buf = BytesMut::new();
        buf.put_i32(1_000_000);
        assert!(matches!(
            PgParser::parse_startup(&mut buf),
            Err(PgParseError::InvalidLength { tag: None, .. })
        ));
    }

    #[test]
    fn test_parse_query() {
        let mut buf = typed(b'Q', b"SELECT 1\0");
        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Query("SELECT 1".to_string()))
        );
    }

    #[test]
    fn test_parse_pipelined_messages() {
        let mut buf = typed(b'P', b"\0SELECT $1\0\0\0");
        buf.extend_from_slice(&typed(b'S', b""));
        buf.extend_from_slice(&typed(b'X', b""));

        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Parse {
                name: String::new(),
                query: "SELECT $1".to_string(),
                param_types: vec![],
            })
        );
        assert_eq!(PgParser::parse(&mut buf).unwrap(), Some(FrontendMessage::Sync));
        assert_eq!(PgParser::parse(&mut buf).unwrap(), Some(FrontendMessage::Terminate));
        assert_eq!(PgParser::parse(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_parse_with_declared_types() {
        let mut body = BytesMut::new();
        body.put_slice(b"find\0SELECT * FROM t WHERE a = $1 AND b = $2\0");
        body.put_i16(2);
        body.put_u32(23);
        body.put_u32(0);
        let mut buf = typed(b'P', &body);

        match PgParser::parse(&mut buf).unwrap() {
            Some(FrontendMessage::Parse {
                name, param_types, ..
            }) => {
                assert_eq!(name, "find");
                assert_eq!(param_types, vec![23, 0]);
            }
            other => panic!("expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bind_with_null_and_formats() {
        let mut body = BytesMut::new();
        body.put_slice(b"p1\0find\0");
        body.put_i16(1);
        body.put_i16(0);
        body.put_i16(2);
        body.put_i32(2);
        body.put_slice(b"42");
        body.put_i32(-1);
        body.put_i16(1);
        body.put_i16(0);
        let mut buf = typed(b'B', &body);

        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Bind {
                portal: "p1".to_string(),
                statement: "find".to_string(),
                param_formats: vec![0],
                params: vec![Some(Bytes::from_static(b"42")), None],
                result_formats: vec![0],
            })
        );
    }

    #[test]
    fn test_parse_describe_execute_close_flush() {
        let mut buf = typed(b'D', b"Sfind\0");
        let mut execute = BytesMut::new();
        execute.put_slice(b"p1\0");
        execute.put_i32(0);
        buf.extend_from_slice(&typed(b'E', &execute));
        buf.extend_from_slice(&typed(b'C', b"Pp1\0"));
        buf.extend_from_slice(&typed(b'H', b""));

        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Describe {
                target: Target::Statement,
                name: "find".to_string()
            })
        );
        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Execute {
                portal: "p1".to_string(),
                max_rows: 0
            })
        );
        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Close {
                target: Target::Portal,
                name: "p1".to_string()
            })
        );
        assert_eq!(PgParser::parse(&mut buf).unwrap(), Some(FrontendMessage::Flush));
    }

    #[test]
    fn test_truncated_bind_is_malformed() {
        let mut body = BytesMut::new();
        body.put_slice(b"\0\0");
        body.put_i16(0);
        body.put_i16(1);
        body.put_i32(10);
        body.put_slice(b"abc");
        let mut buf = typed(b'B', &body);
        assert!(matches!(PgParser::parse(&mut buf), Err(PgParseError::Malformed(_))));

        let mut buf = typed(b'D', b"Xname\0");
        assert!(matches!(PgParser::parse(&mut buf), Err(PgParseError::Malformed(_))));
    }

    #[test]
    fn test_encode_extended_replies() {
        assert_eq!(&PgEncoder::encode(&BackendMessage::ParseComplete)[..], &[b'1', 0, 0, 0, 4]);
        assert_eq!(&PgEncoder::encode(&BackendMessage::BindComplete)[..], &[b'2', 0, 0, 0, 4]);
        assert_eq!(&PgEncoder::encode(&BackendMessage::CloseComplete)[..], &[b'3', 0, 0, 0, 4]);
        assert_eq!(&PgEncoder::encode(&BackendMessage::NoData)[..], &[b'n', 0, 0, 0, 4]);
        assert_eq!(
            &PgEncoder::encode(&BackendMessage::ParameterDescription(&[23, 25]))[..],
            &[b't', 0, 0, 0, 14, 0, 2, 0, 0, 0, 23, 0, 0, 0, 25]
        );
    }

    #[test]
    fn test_incomplete_data() {
        let full = typed(b'Q', b"SELECT 1\0");
        let mut buf = BytesMut::from(&full[..6]);
        assert_eq!(PgParser::parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&full[6..]);
        assert!(PgParser::parse(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = typed(b'd', b"copy data");
        assert_eq!(
            PgParser::parse(&mut buf).unwrap(),
            Some(FrontendMessage::Unsupported(b'd'))
        );
    }

    #[test]
    fn test_query_without_terminator_is_malformed() {
        let mut buf = typed(b'Q', b"SELECT 1");
        assert!(matches!(PgParser::parse(&mut buf), Err(PgParseError::Malformed(_))));
    }

    #[test]
    fn test_encode_ready_for_query() {
        let buf = PgEncoder::encode(&BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        assert_eq!(&buf[..], &[b'Z', 0, 0, 0, 5, b'I']);
    }

    #[test]
    fn test_encode_row_description() {
        let columns = vec![ColumnDescriptor {
            name: "id".to_string(),
            table: 0,
            type_oid: 23,
            format: FieldFormat::Text,
        }];
        let buf = PgEncoder::encode(&BackendMessage::RowDescription(&columns));

        let mut expected = BytesMut::new();
        expected.put_u8(b'T');
        expected.put_i32(4 + 2 + 3 + 18);
        expected.put_i16(1);
        expected.put_slice(b"id\0");
        expected.put_u32(0);
        expected.put_i16(0);
        expected.put_u32(23);
        expected.put_i16(-1);
        expected.put_i32(-1);
        expected.put_i16(0);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_encode_data_row_with_null() {
        let values = vec![Some("7".to_string()), None];
        let buf = PgEncoder::encode(&BackendMessage::DataRow(&values));
        assert_eq!(
            &buf[..],
            &[b'D', 0, 0, 0, 15, 0, 2, 0, 0, 0, 1, b'7', 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_encode_error_response() {
        let buf = PgEncoder::encode(&BackendMessage::ErrorResponse {
            severity: ErrorSeverity::Error,
            code: "42601",
            message: "syntax error",
        });

        assert_eq!(buf[0], b'E');
        let body = &buf[5..];
        assert!(body.windows(6).any(|w| w == b"C42601"));
        assert!(body.ends_with(b"Msyntax error\0\0"));
    }
}
