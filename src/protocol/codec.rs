//! Typed value encoding over a byte transport.

use super::{Address, ProtocolError, TagType, Transport, Value};

/// Bytes in a string header: declared maximum, then actual length.
pub const STRING_HEADER_LEN: usize = 2;
/// Largest declared string length the header can describe.
pub const MAX_STRING_LEN: usize = 254;

/// Decode a fixed-width value from the bytes at its address.
///
/// Strings are handled by [`decode_string`], which needs the header.
pub fn decode(ty: TagType, bit: Option<u8>, bytes: &[u8]) -> Result<Value, ProtocolError> {
    let need = ty.width().unwrap_or(STRING_HEADER_LEN);
    if bytes.len() < need {
        return Err(ProtocolError::MalformedResponse(format!(
            "{} needs {} bytes, got {}",
            ty,
            need,
            bytes.len()
        )));
    }

    match ty {
        TagType::Bool => match bit {
            Some(b) => Ok(Value::Bool((bytes[0] >> check_bit(b)?) & 1 == 1)),
            None => Ok(Value::Bool(bytes[0] != 0)),
        },
        TagType::Int => Ok(Value::Int(i16::from_be_bytes([bytes[0], bytes[1]]))),
        TagType::Word => Ok(Value::Word(u16::from_be_bytes([bytes[0], bytes[1]]))),
        TagType::Real => Ok(Value::Real(f32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        TagType::String => decode_string(bytes),
    }
}

/// Decode a header-prefixed string; the actual length is clamped to both the
/// declared maximum and the bytes available.
pub fn decode_string(bytes: &[u8]) -> Result<Value, ProtocolError> {
    if bytes.len() < STRING_HEADER_LEN {
        return Err(ProtocolError::MalformedResponse(
            "string header truncated".to_string(),
        ));
    }
    let max = bytes[0] as usize;
    let actual = (bytes[1] as usize)
        .min(max)
        .min(bytes.len() - STRING_HEADER_LEN);
    let body = &bytes[STRING_HEADER_LEN..STRING_HEADER_LEN + actual];
    Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Encode a value for a whole-byte write.
///
/// `declared_len` only applies to strings; the text is truncated to it.
pub fn encode(ty: TagType, value: &Value, declared_len: usize) -> Result<Vec<u8>, ProtocolError> {
    if value.tag_type() != ty {
        return Err(ProtocolError::TypeMismatch {
            expected: ty,
            found: value.tag_type().as_str(),
        });
    }

    match value {
        Value::Bool(v) => Ok(vec![u8::from(*v)]),
        Value::Int(v) => Ok(v.to_be_bytes().to_vec()),
        Value::Word(v) => Ok(v.to_be_bytes().to_vec()),
        Value::Real(v) => Ok(v.to_be_bytes().to_vec()),
        Value::String(s) => {
            if declared_len == 0 || declared_len > MAX_STRING_LEN {
                return Err(ProtocolError::InvalidValue(format!(
                    "declared string length {} outside 1-{}",
                    declared_len, MAX_STRING_LEN
                )));
            }
            let body = &s.as_bytes()[..s.len().min(declared_len)];
            let mut out = Vec::with_capacity(STRING_HEADER_LEN + body.len());
            out.push(declared_len as u8);
            out.push(body.len() as u8);
            out.extend_from_slice(body);
            Ok(out)
        }
    }
}

/// Set or clear one bit of a byte.
pub fn set_bit(byte: u8, bit: u8, on: bool) -> u8 {
    if on {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    }
}

fn check_bit(bit: u8) -> Result<u8, ProtocolError> {
    if bit < 8 {
        Ok(bit)
    } else {
        Err(ProtocolError::InvalidAddress(format!("bit offset {} outside 0-7", bit)))
    }
}

/// Read a typed value from the controller.
pub async fn read_value(
    transport: &dyn Transport,
    addr: Address,
    ty: TagType,
) -> Result<Value, ProtocolError> {
    match ty.width() {
        Some(width) => {
            let bytes = transport.read(addr.db, addr.byte, width).await?;
            decode(ty, addr.bit, &bytes)
        }
        None => {
            let header = transport.read(addr.db, addr.byte, STRING_HEADER_LEN).await?;
            if header.len() < STRING_HEADER_LEN {
                return Err(ProtocolError::MalformedResponse(
                    "string header truncated".to_string(),
                ));
            }
            let actual = header[1].min(header[0]) as usize;
            if actual == 0 {
                return Ok(Value::String(String::new()));
            }
            let body = transport
                .read(addr.db, addr.byte + STRING_HEADER_LEN as u32, actual)
                .await?;
            let mut bytes = header;
            bytes.extend_from_slice(&body);
            decode_string(&bytes)
        }
    }
}

/// Write a typed value to the controller.
///
/// A Bool with a bit offset is a read-modify-write of its byte; every other
/// value goes out as one write.
pub async fn write_value(
    transport: &dyn Transport,
    addr: Address,
    ty: TagType,
    declared_len: usize,
    value: &Value,
) -> Result<(), ProtocolError> {
    if let (TagType::Bool, Some(bit), Value::Bool(on)) = (ty, addr.bit, value) {
        let bit = check_bit(bit)?;
        let current = transport.read(addr.db, addr.byte, 1).await?;
        let byte = current.first().copied().ok_or_else(|| {
            ProtocolError::MalformedResponse("empty read for bit write".to_string())
        })?;
        return transport
            .write(addr.db, addr.byte, &[set_bit(byte, bit, *on)])
            .await;
    }

    let bytes = encode(ty, value, declared_len)?;
    transport.write(addr.db, addr.byte, &bytes).await
}

/// Read a big-endian 16-bit word, as fault monitors do.
pub async fn read_word(transport: &dyn Transport, db: u16, byte: u32) -> Result<u16, ProtocolError> {
    let bytes = transport.read(db, byte, 2).await?;
    match bytes.as_slice() {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(ProtocolError::MalformedResponse(format!(
            "word read returned {} bytes",
            bytes.len()
        ))),
    }
}
