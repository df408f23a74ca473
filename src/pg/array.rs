//! One-dimensional array codecs.
//!
//! Elements are delegated to the registry codec of the element type, in
//! the same wire format as the array itself.

use bytes::{Buf, BufMut, BytesMut};

use super::protocol::Format;
use super::types::{Oid, PgValue, TypeRegistry};
use crate::error::{Error, Result};

fn multi_dimensional() -> Error {
    Error::Type("Multi-dimensional arrays are not supported".to_string())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(Error::Type("Truncated array header".to_string()));
    }
    Ok(buf.get_i32())
}

/// Binary layout: `ndim, has_null, element oid, (len, lower bound) * ndim`,
/// then every element as a length-prefixed value (-1 for NULL).
pub(crate) fn decode_binary(registry: &TypeRegistry, data: &[u8]) -> Result<PgValue> {
    let mut buf = data;
    let ndim = take_i32(&mut buf)?;
    let _has_null = take_i32(&mut buf)?;
    let element = Oid::from_i32(take_i32(&mut buf)?);

    match ndim {
        0 => {
            return Ok(PgValue::Array {
                element,
                values: Vec::new(),
            })
        }
        1 => {}
        n if n > 1 => return Err(multi_dimensional()),
        n => return Err(Error::Type(format!("Invalid array dimension count: {}", n))),
    }

    let len = take_i32(&mut buf)?;
    let _lower_bound = take_i32(&mut buf)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::Type(format!("Invalid array length: {}", len)))?;

    let mut values = Vec::with_capacity(len.min(buf.remaining() / 4));
    for _ in 0..len {
        let size = take_i32(&mut buf)?;
        if size < 0 {
            values.push(PgValue::Null);
            continue;
        }
        let size = size as usize;
        if buf.remaining() < size {
            return Err(Error::Type("Truncated array element".to_string()));
        }
        let (item, rest) = buf.split_at(size);
        values.push(registry.decode(element, Format::Binary, Some(item))?);
        buf = rest;
    }

    if buf.has_remaining() {
        return Err(Error::Type(format!(
            "{} trailing bytes after array",
            buf.remaining()
        )));
    }
    Ok(PgValue::Array { element, values })
}

pub(crate) fn encode_binary(
    registry: &TypeRegistry,
    element: Oid,
    values: &[PgValue],
    buf: &mut BytesMut,
) -> Result<()> {
    let kind = registry
        .kind(element)
        .ok_or_else(|| Error::Type(format!("No binary codec for element type {}", element.0)))?;

    if values.is_empty() {
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i32(element.as_i32());
        return Ok(());
    }

    buf.put_i32(1);
    buf.put_i32(values.iter().any(PgValue::is_null) as i32);
    buf.put_i32(element.as_i32());
    buf.put_i32(values.len() as i32);
    buf.put_i32(1);

    for value in values {
        if value.is_null() {
            buf.put_i32(-1);
            continue;
        }
        let start = buf.len();
        buf.put_i32(0);
        registry.write_binary(kind, value, buf)?;
        let len = (buf.len() - start - 4) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
    Ok(())
}

/// Text form `{a,"b c",NULL}`; an optional `[lo:hi]=` prefix is ignored.
pub(crate) fn decode_text(registry: &TypeRegistry, element: Oid, text: &str) -> Result<PgValue> {
    let invalid = || Error::Type(format!("Invalid array literal: {:?}", text));

    let mut body = text.trim();
    if body.starts_with('[') {
        body = body.split_once('=').map(|(_, rest)| rest).ok_or_else(invalid)?;
    }
    let inner = body
        .strip_prefix('{')
        .and_then(|b| b.strip_suffix('}'))
        .ok_or_else(invalid)?;

    let mut values = Vec::new();
    if inner.trim().is_empty() {
        return Ok(PgValue::Array { element, values });
    }

    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let item = match chars.peek() {
            Some('"') => {
                chars.next();
                let mut item = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => item.push(chars.next().ok_or_else(invalid)?),
                        Some('"') => break,
                        Some(c) => item.push(c),
                        None => return Err(invalid()),
                    }
                }
                Some(item)
            }
            Some('{') => return Err(multi_dimensional()),
            _ => {
                let mut item = String::new();
                while let Some(c) = chars.next_if(|c| *c != ',') {
                    match c {
                        '{' | '}' | '"' => return Err(invalid()),
                        '\\' => item.push(chars.next().ok_or_else(invalid)?),
                        c => item.push(c),
                    }
                }
                let item = item.trim();
                if item.is_empty() {
                    return Err(invalid());
                }
                if item.eq_ignore_ascii_case("NULL") {
                    None
                } else {
                    Some(item.to_owned())
                }
            }
        };

        values.push(match item {
            Some(item) => registry.decode(element, Format::Text, Some(item.as_bytes()))?,
            None => PgValue::Null,
        });

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return Err(invalid()),
        }
    }

    Ok(PgValue::Array { element, values })
}

fn needs_quotes(item: &str) -> bool {
    item.is_empty()
        || item.eq_ignore_ascii_case("NULL")
        || item
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace())
}

pub(crate) fn encode_text(values: &[PgValue]) -> Result<String> {
    let mut out = String::from("{");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match value {
            PgValue::Null => out.push_str("NULL"),
            PgValue::Array { .. } => return Err(multi_dimensional()),
            value => {
                let item = value.to_text()?;
                if needs_quotes(&item) {
                    out.push('"');
                    for c in item.chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                } else {
                    out.push_str(&item);
                }
            }
        }
    }
    out.push('}');
    Ok(out)
}
