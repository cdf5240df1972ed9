//! OPC UA Binary base-type encoding helpers.
//!
//! Everything on the wire is little-endian. Strings and byte strings carry an
//! `i32` length prefix where -1 encodes the null value. Reads are guarded by
//! the remaining data in the source so a hostile length prefix cannot force
//! an oversized allocation.

use crate::net::support::{ErrorType, NetworkError, NetworkResult, SizedRead, SizedWrite};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Writes an optional UTF-8 string.
pub fn write_string<W: SizedWrite>(stream: &mut W, value: Option<&str>) -> NetworkResult<()> {
    write_byte_string(stream, value.map(str::as_bytes))
}

/// Reads an optional UTF-8 string.
pub fn read_string<R: SizedRead>(stream: &mut R) -> NetworkResult<Option<String>> {
    match read_byte_string(stream)? {
        Some(bytes) => {
            let value =
                String::from_utf8(bytes).map_err(|_| NetworkError::Fatal(ErrorType::Decoding))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Writes an optional byte string.
pub fn write_byte_string<W: SizedWrite>(stream: &mut W, value: Option<&[u8]>) -> NetworkResult<()> {
    match value {
        Some(bytes) => {
            if bytes.len() > i32::MAX as usize {
                return Err(NetworkError::Fatal(ErrorType::Decoding));
            }
            if stream.free_capacity() < 4 + bytes.len() {
                return Err(NetworkError::Wait);
            }
            stream.write_i32::<LittleEndian>(bytes.len() as i32)?;
            stream.write_all(bytes)?;
        }
        None => {
            if stream.free_capacity() < 4 {
                return Err(NetworkError::Wait);
            }
            stream.write_i32::<LittleEndian>(-1)?;
        }
    }

    Ok(())
}

/// Reads an optional byte string.
pub fn read_byte_string<R: SizedRead>(stream: &mut R) -> NetworkResult<Option<Vec<u8>>> {
    if stream.remaining_data() < 4 {
        return Err(NetworkError::Wait);
    }

    let len = stream.read_i32::<LittleEndian>()?;

    if len < 0 {
        return Ok(None);
    }

    let len = len as usize;
    if len > stream.remaining_data() {
        return Err(NetworkError::Fatal(ErrorType::Decoding));
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

/// Writes an array of byte strings with an `i32` element count (-1 = null).
pub fn write_byte_string_array<W: SizedWrite>(
    stream: &mut W,
    values: Option<&[Vec<u8>]>,
) -> NetworkResult<()> {
    match values {
        Some(values) => {
            if stream.free_capacity() < 4 {
                return Err(NetworkError::Wait);
            }
            stream.write_i32::<LittleEndian>(values.len() as i32)?;
            for value in values {
                write_byte_string(stream, Some(value))?;
            }
        }
        None => {
            if stream.free_capacity() < 4 {
                return Err(NetworkError::Wait);
            }
            stream.write_i32::<LittleEndian>(-1)?;
        }
    }

    Ok(())
}

/// Reads an array of byte strings. Null elements are rejected.
pub fn read_byte_string_array<R: SizedRead>(stream: &mut R) -> NetworkResult<Option<Vec<Vec<u8>>>> {
    if stream.remaining_data() < 4 {
        return Err(NetworkError::Wait);
    }

    let count = stream.read_i32::<LittleEndian>()?;

    if count < 0 {
        return Ok(None);
    }

    let count = count as usize;
    // Each element needs at least its length prefix
    if count * 4 > stream.remaining_data() {
        return Err(NetworkError::Fatal(ErrorType::Decoding));
    }

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        match read_byte_string(stream)? {
            Some(value) => values.push(value),
            None => return Err(NetworkError::Fatal(ErrorType::Decoding)),
        }
    }

    Ok(Some(values))
}
