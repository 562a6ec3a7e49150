//! Transform Pipeline
//!
//! Pure conversions between raw characteristic bytes and [`Value`]s.
//! A [`ReadTransform`] is bound to the result key of its characteristic by
//! the descriptor; a [`WriteTransform`] turns a caller's value into the
//! bytes handed to the transport.
//!
//! The free functions below build the decoders/encoders most GATT profiles
//! need. Every decoder checks the payload length before indexing.

use crate::domain::value::{ReadResult, Value};
use crate::error::TransformError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type ReadFn = dyn Fn(&[u8]) -> Result<Value, TransformError> + Send + Sync;
type WriteFn = dyn Fn(&Value) -> Result<Vec<u8>, TransformError> + Send + Sync;

/// Decodes a characteristic payload.
#[derive(Clone)]
pub struct ReadTransform(Arc<ReadFn>);

impl ReadTransform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Decode `bytes` into a result published under `key`.
    pub fn apply(&self, key: &str, bytes: &[u8]) -> Result<ReadResult, TransformError> {
        let value = (self.0)(bytes)?;
        Ok(ReadResult {
            key: key.to_string(),
            value,
        })
    }
}

impl Default for ReadTransform {
    fn default() -> Self {
        raw()
    }
}

impl fmt::Debug for ReadTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReadTransform")
    }
}

/// Encodes a caller value for a characteristic write.
#[derive(Clone)]
pub struct WriteTransform(Arc<WriteFn>);

impl WriteTransform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, value: &Value) -> Result<Vec<u8>, TransformError> {
        (self.0)(value)
    }
}

impl Default for WriteTransform {
    fn default() -> Self {
        write_raw()
    }
}

impl fmt::Debug for WriteTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteTransform")
    }
}

/// Fail unless `bytes` holds at least `len` bytes.
pub fn require_len(bytes: &[u8], len: usize) -> Result<(), TransformError> {
    if bytes.len() < len {
        return Err(TransformError::TooShort {
            expected: len,
            actual: bytes.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Publish the payload unchanged.
pub fn raw() -> ReadTransform {
    ReadTransform::new(|bytes| Ok(Value::Bytes(bytes.to_vec())))
}

/// Decode the payload as UTF-8 text, trimming trailing NUL padding.
pub fn utf8() -> ReadTransform {
    ReadTransform::new(|bytes| {
        let end = bytes
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        std::str::from_utf8(&bytes[..end])
            .map(|s| Value::Text(s.to_string()))
            .map_err(|e| TransformError::Malformed(e.to_string()))
    })
}

/// Unsigned byte at `offset`.
pub fn u8_at(offset: usize) -> ReadTransform {
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 1)?;
        Ok(Value::Int(bytes[offset] as i64))
    })
}

/// Little-endian `u16` at `offset`.
pub fn u16_le_at(offset: usize) -> ReadTransform {
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 2)?;
        let v = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        Ok(Value::Int(v as i64))
    })
}

/// Little-endian `i16` at `offset`.
pub fn i16_le_at(offset: usize) -> ReadTransform {
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 2)?;
        let v = i16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        Ok(Value::Int(v as i64))
    })
}

/// Little-endian `u32` at `offset`.
pub fn u32_le_at(offset: usize) -> ReadTransform {
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 4)?;
        let v = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        Ok(Value::Int(v as i64))
    })
}

/// `true` when every bit of `mask` is set in the byte at `offset`.
pub fn bit_at(offset: usize, mask: u8) -> ReadTransform {
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 1)?;
        Ok(Value::Bool(bytes[offset] & mask == mask))
    })
}

/// The low `count` bits of the byte at `offset`, least significant first.
pub fn flags_at(offset: usize, count: u8) -> ReadTransform {
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 1)?;
        if count > 8 {
            return Err(TransformError::OutOfRange(format!(
                "{} flags do not fit in one byte",
                count
            )));
        }
        let byte = bytes[offset];
        Ok(Value::Flags((0..count).map(|i| byte & (1 << i) != 0).collect()))
    })
}

/// Map the byte at `offset` through `table`, falling back to `unknown`.
pub fn lookup_at(offset: usize, table: HashMap<u8, String>, unknown: &str) -> ReadTransform {
    let unknown = unknown.to_string();
    ReadTransform::new(move |bytes| {
        require_len(bytes, offset + 1)?;
        let name = table.get(&bytes[offset]).unwrap_or(&unknown);
        Ok(Value::Text(name.clone()))
    })
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

/// Accept `Value::Bytes` and write it unchanged.
pub fn write_raw() -> WriteTransform {
    WriteTransform::new(|value| match value {
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(TransformError::UnexpectedType {
            expected: "bytes",
            actual: other.kind(),
        }),
    })
}

/// ASCII text of at most `max_len` bytes, e.g. a device password.
pub fn write_ascii(max_len: usize) -> WriteTransform {
    WriteTransform::new(move |value| {
        let text = value.as_text().ok_or(TransformError::UnexpectedType {
            expected: "text",
            actual: value.kind(),
        })?;
        if !text.is_ascii() {
            return Err(TransformError::Malformed("text is not ASCII".to_string()));
        }
        if text.len() > max_len {
            return Err(TransformError::OutOfRange(format!(
                "{} characters exceeds the limit of {}",
                text.len(),
                max_len
            )));
        }
        Ok(text.as_bytes().to_vec())
    })
}

/// A single byte from an `Int` in `0..=255` or a `Bool`.
pub fn write_u8() -> WriteTransform {
    WriteTransform::new(|value| match value {
        Value::Bool(b) => Ok(vec![u8::from(*b)]),
        Value::Int(i) => u8::try_from(*i)
            .map(|b| vec![b])
            .map_err(|_| TransformError::OutOfRange(format!("{} does not fit in a byte", i))),
        other => Err(TransformError::UnexpectedType {
            expected: "int",
            actual: other.kind(),
        }),
    })
}

/// Pack `Value::Flags` into one byte appended to a fixed command `prefix`.
pub fn write_flags(prefix: Vec<u8>) -> WriteTransform {
    WriteTransform::new(move |value| {
        let flags = match value {
            Value::Flags(flags) => flags,
            other => {
                return Err(TransformError::UnexpectedType {
                    expected: "flags",
                    actual: other.kind(),
                })
            }
        };
        if flags.len() > 8 {
            return Err(TransformError::OutOfRange(format!(
                "{} flags do not fit in one byte",
                flags.len()
            )));
        }
        let byte = flags
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, on)| if *on { acc | (1 << i) } else { acc });
        let mut out = prefix.clone();
        out.push(byte);
        Ok(out)
    })
}
