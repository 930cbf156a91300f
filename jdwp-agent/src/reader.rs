// Helper functions for reading and writing JDWP data types

use bytes::{Buf, BufMut};
use crate::protocol::{JdwpError, JdwpResult};
use crate::types::Location;

/// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> JdwpResult<String> {
    if buf.remaining() < 4 {
        return Err(JdwpError::Protocol("Not enough data for string length".to_string()));
    }

    let len = buf.get_u32() as usize;

    if buf.remaining() < len {
        return Err(JdwpError::Protocol(format!(
            "Not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| JdwpError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> JdwpResult<u32> {
    if buf.remaining() < 4 {
        return Err(JdwpError::Protocol("Not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> JdwpResult<i32> {
    if buf.remaining() < 4 {
        return Err(JdwpError::Protocol("Not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> JdwpResult<u8> {
    if buf.remaining() < 1 {
        return Err(JdwpError::Protocol("Not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

/// Read a bool (one byte, non-zero is true)
pub fn read_bool(buf: &mut &[u8]) -> JdwpResult<bool> {
    Ok(read_u8(buf)? != 0)
}

/// Read a u16
pub fn read_u16(buf: &mut &[u8]) -> JdwpResult<u16> {
    if buf.remaining() < 2 {
        return Err(JdwpError::Protocol("Not enough data for u16".to_string()));
    }
    Ok(buf.get_u16())
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> JdwpResult<u64> {
    if buf.remaining() < 8 {
        return Err(JdwpError::Protocol("Not enough data for u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Read a location (type tag, class, method, code index)
pub fn read_location(buf: &mut &[u8]) -> JdwpResult<Location> {
    let type_tag = read_u8(buf)?;
    let class_id = read_u64(buf)?;
    let method_id = read_u64(buf)?;
    let index = read_u64(buf)?;

    Ok(Location {
        type_tag,
        class_id,
        method_id,
        index,
    })
}

/// Write a JDWP string
pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Write a location
pub fn put_location(buf: &mut Vec<u8>, location: &Location) {
    buf.put_u8(location.type_tag);
    buf.put_u64(location.class_id);
    buf.put_u64(location.method_id);
    buf.put_u64(location.index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip_and_underflow() {
        let mut buf = Vec::new();
        put_string(&mut buf, "com.foo.*");

        let mut data = buf.as_slice();
        assert_eq!(read_string(&mut data).unwrap(), "com.foo.*");
        assert!(data.is_empty());

        let mut short: &[u8] = &[0, 0, 0, 9, b'x'];
        assert!(read_string(&mut short).is_err());
    }

    #[test]
    fn test_location_layout() {
        let location = Location {
            type_tag: 1,
            class_id: 0x10,
            method_id: 0x20,
            index: 7,
        };
        let mut buf = Vec::new();
        put_location(&mut buf, &location);
        assert_eq!(buf.len(), 25);

        let mut data = buf.as_slice();
        assert_eq!(read_location(&mut data).unwrap(), location);
    }
}
