//! Wire primitives
//!
//! Little-endian integer and length-prefixed string helpers shared by
//! the server and peer codecs. Every read validates the remaining
//! length first; decoding never panics on truncated input.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::error::SlskError;

/// Read a little-endian u32
pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(SlskError::protocol_error_with_source(
            "Message truncated",
            format!("need 4 bytes, have {}", buf.remaining()),
        )
        .into());
    }
    Ok(buf.get_u32_le())
}

/// Read a little-endian u64
pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(SlskError::protocol_error_with_source(
            "Message truncated",
            format!("need 8 bytes, have {}", buf.remaining()),
        )
        .into());
    }
    Ok(buf.get_u64_le())
}

/// Read a single byte
pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(SlskError::protocol_error("Message truncated: need 1 byte").into());
    }
    Ok(buf.get_u8())
}

/// Read a byte-encoded boolean
pub fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

/// Read a length-prefixed string (u32 length + bytes, lossy UTF-8)
pub fn get_str(buf: &mut Bytes) -> Result<String> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(SlskError::protocol_error_with_source(
            "String truncated",
            format!("declared {} bytes, have {}", len, buf.remaining()),
        )
        .into());
    }
    let raw = buf.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Read an IPv4 address encoded as a u32
pub fn get_ip(buf: &mut Bytes) -> Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(get_u32(buf)?))
}

/// Write a little-endian u32
pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32_le(value);
}

/// Write a little-endian u64
pub fn put_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64_le(value);
}

/// Write a single byte
pub fn put_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

/// Write a byte-encoded boolean
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Write a length-prefixed string
pub fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Write an IPv4 address as a u32
pub fn put_ip(buf: &mut BytesMut, ip: Ipv4Addr) {
    buf.put_u32_le(u32::from(ip));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_round_trip() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "hello world");
        let mut bytes = buf.freeze();
        assert_eq!(get_str(&mut bytes).unwrap(), "hello world");
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn test_get_str_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(10);
        buf.put_slice(b"short");
        let mut bytes = buf.freeze();
        assert!(get_str(&mut bytes).is_err());
    }

    #[test]
    fn test_get_u32_truncated() {
        let mut bytes = Bytes::from_static(&[1, 2]);
        assert!(get_u32(&mut bytes).is_err());
    }

    #[test]
    fn test_u64_round_trip() {
        let mut buf = BytesMut::new();
        put_u64(&mut buf, u64::MAX - 7);
        let mut bytes = buf.freeze();
        assert_eq!(get_u64(&mut bytes).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn test_ip_round_trip() {
        let ip: Ipv4Addr = "192.168.1.42".parse().unwrap();
        let mut buf = BytesMut::new();
        put_ip(&mut buf, ip);
        let mut bytes = buf.freeze();
        assert_eq!(get_ip(&mut bytes).unwrap(), ip);
    }

    #[test]
    fn test_bool_round_trip() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_bool(&mut buf, false);
        let mut bytes = buf.freeze();
        assert!(get_bool(&mut bytes).unwrap());
        assert!(!get_bool(&mut bytes).unwrap());
    }
}
