use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

macro_rules! checked_getter {
    ($name: ident, $ty:ty, $getter: ident) => {
        pub fn $name(buf: &mut impl Buf) -> anyhow::Result<$ty> {
            if buf.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(buf.$getter())
        }
    }
}

checked_getter!(get_u8_checked, u8, get_u8);
checked_getter!(get_u64_checked, u64, get_u64);

pub fn put_usize_varint(buf: &mut BytesMut, value: usize) {
    buf.put_u64_varint(value as u64);
}

pub fn try_get_usize_varint(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let raw = buf.try_get_u64_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))?;
    Ok(usize::try_from(raw)?)
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_usize_varint(buf, s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_usize_varint(buf)?;
    if buf.remaining() < len {
        return Err(anyhow!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining()));
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);

    let s = String::from_utf8(result)?;
    Ok(s)
}

/// optional strings are written as a presence marker byte followed by the string if present
pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match get_u8_checked(buf)? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        n => Err(anyhow!("invalid presence marker for optional string: {}", n)),
    }
}
