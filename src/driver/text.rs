/// Text rendering of binary-format Postgres values
///
/// Output matches what the server prints for the same value under the session
/// settings [`super::postgres::PostgresDriver`] establishes: `DateStyle` ISO,
/// `IntervalStyle` postgres, `TimeZone` UTC and shortest-exact floats. Money
/// is rendered for the C locale and `reg*` types as their numeric OID.
use super::types as oid;
use bytes::Buf;
use chrono::{Datelike, NaiveDate};
use std::error::Error;
use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio_postgres::types::{Field, Kind, Type};

pub type RenderError = Box<dyn Error + Sync + Send>;

const USECS_PER_SEC: i64 = 1_000_000;
const USECS_PER_MINUTE: i64 = 60 * USECS_PER_SEC;
const USECS_PER_HOUR: i64 = 60 * USECS_PER_MINUTE;
const USECS_PER_DAY: i64 = 24 * USECS_PER_HOUR;

/// Render one binary value of type `ty`
pub fn render(ty: &Type, raw: &[u8]) -> Result<String, RenderError> {
    match ty.kind() {
        Kind::Array(member) => return render_array(member, raw),
        Kind::Domain(base) => return render(base, raw),
        Kind::Enum(_) => return utf8(raw),
        Kind::Range(subtype) => return render_range(subtype, raw),
        Kind::Composite(fields) => return render_record(Some(fields.as_slice()), raw),
        _ => {}
    }

    let mut buf = raw;
    let text = match ty.oid() {
        oid::BOOL => (if take_u8(&mut buf)? != 0 { "t" } else { "f" }).to_string(),
        oid::CHAR => match take_u8(&mut buf)? {
            0 => String::new(),
            b if b < 0x80 => (b as char).to_string(),
            b => format!("\\{:03o}", b),
        },
        oid::INT2 => take_i16(&mut buf)?.to_string(),
        oid::INT4 => take_i32(&mut buf)?.to_string(),
        oid::INT8 => take_i64(&mut buf)?.to_string(),
        oid::OID
        | oid::XID
        | oid::CID
        | oid::REGPROC
        | oid::REGPROCEDURE
        | oid::REGOPER
        | oid::REGOPERATOR
        | oid::REGCLASS
        | oid::REGTYPE
        | oid::REGNAMESPACE
        | oid::REGROLE => take_u32(&mut buf)?.to_string(),
        oid::XID8 => take_u64(&mut buf)?.to_string(),
        oid::TID => {
            let block = take_u32(&mut buf)?;
            let offset = take_u16(&mut buf)?;
            format!("({},{})", block, offset)
        }
        oid::FLOAT4 => render_float4(f32::from_bits(take_u32(&mut buf)?)),
        oid::FLOAT8 => render_float8(f64::from_bits(take_u64(&mut buf)?)),
        oid::NUMERIC => render_numeric(raw)?,
        oid::MONEY => render_money(take_i64(&mut buf)?),
        oid::TEXT
        | oid::VARCHAR
        | oid::BPCHAR
        | oid::NAME
        | oid::UNKNOWN
        | oid::XML
        | oid::JSON
        | oid::CSTRING => utf8(raw)?,
        oid::JSONB | oid::JSONPATH => match raw.split_first() {
            Some((1, body)) => utf8(body)?,
            _ => return Err(format!("unsupported {} version", ty.name()).into()),
        },
        oid::BYTEA => format!("\\x{}", hex::encode(raw)),
        oid::UUID => uuid::Uuid::from_slice(raw)?.to_string(),
        oid::DATE => render_date(take_i32(&mut buf)?)?,
        oid::TIME => format_time(take_i64(&mut buf)?),
        oid::TIMETZ => {
            let time = take_i64(&mut buf)?;
            // stored as seconds west of UTC
            let zone = take_i32(&mut buf)?;
            format!("{}{}", format_time(time), format_offset(-zone))
        }
        oid::TIMESTAMP => render_timestamp(take_i64(&mut buf)?, None)?,
        oid::TIMESTAMPTZ => render_timestamp(take_i64(&mut buf)?, Some(0))?,
        oid::INTERVAL => {
            let time = take_i64(&mut buf)?;
            let days = take_i32(&mut buf)?;
            let months = take_i32(&mut buf)?;
            render_interval(time, days, months)
        }
        oid::INET | oid::CIDR => render_inet(raw, ty.oid() == oid::CIDR)?,
        oid::MACADDR | oid::MACADDR8 => raw
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
        oid::BIT | oid::VARBIT => {
            let bits = take_i32(&mut buf)?;
            if bits < 0 || buf.len() * 8 < bits as usize {
                return Err("bit string length does not match payload".into());
            }
            (0..bits as usize)
                .map(|i| if buf[i / 8] & (0x80 >> (i % 8)) != 0 { '1' } else { '0' })
                .collect::<String>()
        }
        oid::POINT => render_point(&mut buf)?,
        oid::LSEG => {
            let a = render_point(&mut buf)?;
            let b = render_point(&mut buf)?;
            format!("[{},{}]", a, b)
        }
        oid::BOX => {
            let a = render_point(&mut buf)?;
            let b = render_point(&mut buf)?;
            format!("{},{}", a, b)
        }
        oid::PATH => {
            let closed = take_u8(&mut buf)? != 0;
            let points = render_points(&mut buf)?;
            if closed {
                format!("({})", points)
            } else {
                format!("[{}]", points)
            }
        }
        oid::POLYGON => format!("({})", render_points(&mut buf)?),
        oid::LINE => {
            let a = render_float8(take_f64(&mut buf)?);
            let b = render_float8(take_f64(&mut buf)?);
            let c = render_float8(take_f64(&mut buf)?);
            format!("{{{},{},{}}}", a, b, c)
        }
        oid::CIRCLE => {
            let center = render_point(&mut buf)?;
            let radius = render_float8(take_f64(&mut buf)?);
            format!("<{},{}>", center, radius)
        }
        oid::PG_LSN => {
            let lsn = take_u64(&mut buf)?;
            format!("{:X}/{:X}", lsn >> 32, lsn & 0xffff_ffff)
        }
        oid::VOID => String::new(),
        oid::RECORD => render_record(None, raw)?,
        // extension types without a binary codec of their own send plain text
        _ if Type::from_oid(ty.oid()).is_none() && is_plain_text(raw) => utf8(raw)?,
        _ => return Err(format!("cannot render binary {} value as text", ty.name()).into()),
    };
    Ok(text)
}

/// Render a value whose type is known only by OID
pub fn render_oid(type_oid: u32, raw: &[u8]) -> Result<String, RenderError> {
    match Type::from_oid(type_oid) {
        Some(ty) => render(&ty, raw),
        None if is_plain_text(raw) => utf8(raw),
        None => Err(format!("cannot render binary value of type {} as text", type_oid).into()),
    }
}

fn utf8(raw: &[u8]) -> Result<String, RenderError> {
    Ok(std::str::from_utf8(raw)?.to_string())
}

fn is_plain_text(raw: &[u8]) -> bool {
    std::str::from_utf8(raw)
        .map(|s| !s.chars().any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r')))
        .unwrap_or(false)
}

fn need(buf: &[u8], len: usize) -> Result<(), RenderError> {
    if buf.len() < len {
        return Err(format!("value truncated: need {} bytes, have {}", len, buf.len()).into());
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, RenderError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, RenderError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_i16(buf: &mut &[u8]) -> Result<i16, RenderError> {
    need(buf, 2)?;
    Ok(buf.get_i16())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32, RenderError> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, RenderError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_i64(buf: &mut &[u8]) -> Result<i64, RenderError> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, RenderError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn take_f64(buf: &mut &[u8]) -> Result<f64, RenderError> {
    Ok(f64::from_bits(take_u64(buf)?))
}

/// Take a length-prefixed element; `None` for NULL
fn take_element<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, RenderError> {
    let len = take_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    need(buf, len)?;
    let (element, rest) = buf.split_at(len);
    *buf = rest;
    Ok(Some(element))
}

pub fn render_float8(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return (if value < 0.0 { "-Infinity" } else { "Infinity" }).to_string();
    }
    float_text(&format!("{:e}", value), value.to_string(), 15)
}

pub fn render_float4(value: f32) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return (if value < 0.0 { "-Infinity" } else { "Infinity" }).to_string();
    }
    float_text(&format!("{:e}", value), value.to_string(), 6)
}

/// Shortest round-trip digits, switching to exponent form outside
/// `[1e-4, 10^precision)` the way the server does
fn float_text(scientific: &str, fixed: String, precision: i32) -> String {
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return fixed;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if fixed.trim_start_matches('-') == "0" || (-4..precision).contains(&exponent) {
        return fixed;
    }
    format!(
        "{}e{}{:02}",
        mantissa,
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary `numeric` format (base-10000 digit groups)
pub fn render_numeric(mut raw: &[u8]) -> Result<String, RenderError> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let ndigits = raw.get_i16();
    let weight = raw.get_i16() as i32;
    let sign = raw.get_u16();
    let dscale = raw.get_u16() as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    if ndigits < 0 || raw.len() < ndigits as usize * 2 {
        return Err("numeric digit count does not match payload".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|_| raw.get_i16()).collect();
    let digit = |i: i32| -> i16 {
        if i < 0 {
            0
        } else {
            digits.get(i as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                write!(out, "{}", digit(i))?;
            } else {
                write!(out, "{:04}", digit(i))?;
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", digit(i))?;
            i += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

/// `money` in the C locale: `$1,234.56`, `-$0.05`
fn render_money(cents: i64) -> String {
    let magnitude = cents.unsigned_abs();
    let units = (magnitude / 100).to_string();

    let mut grouped = String::with_capacity(units.len() + units.len() / 3);
    for (i, c) in units.chars().enumerate() {
        if i > 0 && (units.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    format!(
        "{}${}.{:02}",
        if cents < 0 { "-" } else { "" },
        grouped,
        magnitude % 100
    )
}

fn postgres_epoch() -> Result<NaiveDate, RenderError> {
    NaiveDate::from_ymd_opt(2000, 1, 1).ok_or_else(|| "invalid epoch".into())
}

fn date_from_days(days: i64) -> Result<NaiveDate, RenderError> {
    postgres_epoch()?
        .checked_add_signed(chrono::Duration::days(days))
        .ok_or_else(|| "date out of range".into())
}

/// ISO date plus the era suffix the server appends for years before 1 AD
fn format_date(date: NaiveDate) -> (String, bool) {
    let year = date.year();
    let bc = year <= 0;
    let shown = if bc { 1 - year } else { year };
    (
        format!("{:04}-{:02}-{:02}", shown, date.month(), date.day()),
        bc,
    )
}

fn render_date(days: i32) -> Result<String, RenderError> {
    match days {
        i32::MAX => Ok("infinity".to_string()),
        i32::MIN => Ok("-infinity".to_string()),
        _ => {
            let (text, bc) = format_date(date_from_days(days as i64)?);
            Ok(if bc { format!("{} BC", text) } else { text })
        }
    }
}

/// `HH:MM:SS` with trailing fractional zeros removed
fn format_time(micros: i64) -> String {
    let hours = micros / USECS_PER_HOUR;
    let minutes = (micros % USECS_PER_HOUR) / USECS_PER_MINUTE;
    let seconds = (micros % USECS_PER_MINUTE) / USECS_PER_SEC;
    format!(
        "{:02}:{:02}:{:02}{}",
        hours,
        minutes,
        seconds,
        fraction(micros % USECS_PER_SEC)
    )
}

fn fraction(micros: i64) -> String {
    if micros == 0 {
        return String::new();
    }
    let digits = format!("{:06}", micros.abs());
    format!(".{}", digits.trim_end_matches('0'))
}

/// UTC offset in seconds east, as `+05`, `-03:30` or `+01:02:03`
fn format_offset(east: i32) -> String {
    let sign = if east < 0 { '-' } else { '+' };
    let east = east.unsigned_abs();
    let (hours, minutes, seconds) = (east / 3600, (east % 3600) / 60, east % 60);
    match (minutes, seconds) {
        (0, 0) => format!("{}{:02}", sign, hours),
        (_, 0) => format!("{}{:02}:{:02}", sign, hours, minutes),
        _ => format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds),
    }
}

fn render_timestamp(micros: i64, offset: Option<i32>) -> Result<String, RenderError> {
    match micros {
        i64::MAX => return Ok("infinity".to_string()),
        i64::MIN => return Ok("-infinity".to_string()),
        _ => {}
    }

    let days = micros.div_euclid(USECS_PER_DAY);
    let time = micros.rem_euclid(USECS_PER_DAY);
    let (date, bc) = format_date(date_from_days(days)?);

    let mut out = format!("{} {}", date, format_time(time));
    if let Some(offset) = offset {
        out.push_str(&format_offset(offset));
    }
    if bc {
        out.push_str(" BC");
    }
    Ok(out)
}

/// `IntervalStyle = postgres` output, e.g. `1 year 2 mons -3 days +04:05:06.5`
fn render_interval(time: i64, days: i32, months: i32) -> String {
    let mut out = String::new();
    let mut is_zero = true;
    let mut is_before = false;

    for (value, unit) in [
        (months as i64 / 12, "year"),
        (months as i64 % 12, "mon"),
        (days as i64, "day"),
    ] {
        if value == 0 {
            continue;
        }
        let _ = write!(
            out,
            "{}{}{} {}{}",
            if is_zero { "" } else { " " },
            if is_before && value > 0 { "+" } else { "" },
            value,
            unit,
            if value != 1 { "s" } else { "" }
        );
        is_before = value < 0;
        is_zero = false;
    }

    if is_zero || time != 0 {
        let hours = time / USECS_PER_HOUR;
        let minutes = (time % USECS_PER_HOUR) / USECS_PER_MINUTE;
        let seconds = (time % USECS_PER_MINUTE) / USECS_PER_SEC;
        let micros = time % USECS_PER_SEC;
        let minus = hours < 0 || minutes < 0 || seconds < 0 || micros < 0;
        let _ = write!(
            out,
            "{}{}{:02}:{:02}:{:02}{}",
            if is_zero { "" } else { " " },
            if minus {
                "-"
            } else if is_before {
                "+"
            } else {
                ""
            },
            hours.abs(),
            minutes.abs(),
            seconds.abs(),
            fraction(micros)
        );
    }

    out
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

fn render_inet(mut raw: &[u8], cidr: bool) -> Result<String, RenderError> {
    need(raw, 4)?;
    let family = raw.get_u8();
    let bits = raw.get_u8();
    let _is_cidr = raw.get_u8();
    let len = raw.get_u8() as usize;
    need(raw, len)?;

    let (address, max_bits) = match (family, len) {
        (PGSQL_AF_INET, 4) => (
            Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
            32,
        ),
        (PGSQL_AF_INET6, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => return Err(format!("unknown inet family {} ({} bytes)", family, len).into()),
    };

    if cidr || bits != max_bits {
        Ok(format!("{}/{}", address, bits))
    } else {
        Ok(address)
    }
}

fn render_point(buf: &mut &[u8]) -> Result<String, RenderError> {
    let x = render_float8(take_f64(buf)?);
    let y = render_float8(take_f64(buf)?);
    Ok(format!("({},{})", x, y))
}

fn render_points(buf: &mut &[u8]) -> Result<String, RenderError> {
    let count = take_i32(buf)?;
    let points = (0..count.max(0))
        .map(|_| render_point(buf))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(points.join(","))
}

/// Array literal such as `{1,NULL,"a b"}` or `[0:1]={{1,2},{3,4}}`
fn render_array(member: &Type, mut raw: &[u8]) -> Result<String, RenderError> {
    let buf = &mut raw;
    let ndim = take_i32(buf)?;
    let _has_nulls = take_i32(buf)?;
    let _element_oid = take_u32(buf)?;

    if ndim == 0 {
        return Ok("{}".to_string());
    }
    if !(1..=6).contains(&ndim) {
        return Err(format!("array has {} dimensions", ndim).into());
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let len = take_i32(buf)?;
        let lower = take_i32(buf)?;
        if len < 0 {
            return Err("negative array dimension".into());
        }
        dims.push((len as usize, lower));
    }

    let mut out = String::new();
    if dims.iter().any(|(_, lower)| *lower != 1) {
        for (len, lower) in &dims {
            write!(out, "[{}:{}]", lower, *lower as i64 + *len as i64 - 1)?;
        }
        out.push('=');
    }

    let delimiter = if member.oid() == oid::BOX { ';' } else { ',' };
    write_dimension(&mut out, &dims, buf, member, delimiter)?;
    Ok(out)
}

fn write_dimension(
    out: &mut String,
    dims: &[(usize, i32)],
    buf: &mut &[u8],
    member: &Type,
    delimiter: char,
) -> Result<(), RenderError> {
    out.push('{');
    for i in 0..dims[0].0 {
        if i > 0 {
            out.push(delimiter);
        }
        if dims.len() > 1 {
            write_dimension(out, &dims[1..], buf, member, delimiter)?;
            continue;
        }
        match take_element(buf)? {
            None => out.push_str("NULL"),
            Some(element) => {
                let text = render(member, element)?;
                let needs_quotes = text.is_empty()
                    || text.eq_ignore_ascii_case("NULL")
                    || text.chars().any(|c| {
                        matches!(c, '{' | '}' | '"' | '\\') || c == delimiter || is_array_space(c)
                    });
                if needs_quotes {
                    out.push('"');
                    for c in text.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
        }
    }
    out.push('}');
    Ok(())
}

fn is_array_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\u{0b}' | '\u{0c}')
}

/// Row literal such as `(1,,"a b")`
fn render_record(fields: Option<&[Field]>, mut raw: &[u8]) -> Result<String, RenderError> {
    let buf = &mut raw;
    let count = take_i32(buf)?;

    let mut out = String::from("(");
    for i in 0..count.max(0) as usize {
        if i > 0 {
            out.push(',');
        }
        let type_oid = take_u32(buf)?;
        let Some(element) = take_element(buf)? else {
            continue;
        };
        let text = match fields.and_then(|f| f.get(i)) {
            Some(field) => render(field.type_(), element)?,
            None => render_oid(type_oid, element)?,
        };
        push_quoted_bound(&mut out, &text, &['(', ')', ',']);
    }
    out.push(')');
    Ok(out)
}

const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

/// Range literal such as `[1,10)`, `(,5]` or `empty`
fn render_range(subtype: &Type, mut raw: &[u8]) -> Result<String, RenderError> {
    let buf = &mut raw;
    let flags = take_u8(buf)?;
    if flags & RANGE_EMPTY != 0 {
        return Ok("empty".to_string());
    }

    let mut out = String::new();
    out.push(if flags & RANGE_LB_INC != 0 { '[' } else { '(' });
    if flags & RANGE_LB_INF == 0 {
        if let Some(bound) = take_element(buf)? {
            push_quoted_bound(&mut out, &render(subtype, bound)?, &['(', ')', '[', ']', ',']);
        }
    }
    out.push(',');
    if flags & RANGE_UB_INF == 0 {
        if let Some(bound) = take_element(buf)? {
            push_quoted_bound(&mut out, &render(subtype, bound)?, &['(', ')', '[', ']', ',']);
        }
    }
    out.push(if flags & RANGE_UB_INC != 0 { ']' } else { ')' });
    Ok(out)
}

/// Quote a record field or range bound the way the server does: double
/// quotes around, embedded quotes and backslashes doubled
fn push_quoted_bound(out: &mut String, text: &str, special: &[char]) {
    let needs_quotes = text.is_empty()
        || text
            .chars()
            .any(|c| c == '"' || c == '\\' || special.contains(&c) || c.is_ascii_whitespace());
    if !needs_quotes {
        out.push_str(text);
        return;
    }
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('"');
}
