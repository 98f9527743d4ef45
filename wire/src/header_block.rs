#[cfg(test)]
mod header_block_test;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Static name table. IDs are fixed on the wire: id 1 is the first entry,
/// id 11 the last. Id 0 introduces a literal name.
pub const STATIC_NAMES: [&str; 11] = [
    "content-type",
    "content-length",
    "cache-control",
    "etag",
    "last-modified",
    "date",
    "server",
    "content-encoding",
    "accept-ranges",
    "set-cookie",
    "location",
];

const LITERAL_NAME: u8 = 0;
const VARINT16_MAX: usize = 0x7FFF;

fn static_id(name: &str) -> Option<u8> {
    STATIC_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name))
        .map(|i| (i + 1) as u8)
}

fn put_varint16(writer: &mut BytesMut, value: usize) -> Result<()> {
    if value > VARINT16_MAX {
        return Err(Error::ErrHeaderValueTooLong);
    }
    if value < 0x80 {
        writer.put_u8(value as u8);
    } else {
        writer.put_u8(0x80 | (value >> 8) as u8);
        writer.put_u8(value as u8);
    }
    Ok(())
}

fn get_varint16(raw: &[u8], pos: &mut usize) -> Result<usize> {
    let b0 = *raw.get(*pos).ok_or(Error::ErrHeaderBlockTruncated)?;
    *pos += 1;
    if b0 & 0x80 == 0 {
        return Ok(usize::from(b0));
    }
    let b1 = *raw.get(*pos).ok_or(Error::ErrHeaderBlockTruncated)?;
    *pos += 1;
    Ok((usize::from(b0 & 0x7F) << 8) | usize::from(b1))
}

fn get_slice<'a>(raw: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).ok_or(Error::ErrHeaderBlockTruncated)?;
    if end > raw.len() {
        return Err(Error::ErrHeaderBlockTruncated);
    }
    let slice = &raw[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Encodes a header list. Entries with a name in the static table take the
/// `[id][len][value]` form, all others the `[0][name_len][name][len][value]`
/// literal form. Duplicate names keep their insertion order; names are folded
/// to lowercase on the wire.
pub fn encode_header_block(headers: &[(String, String)]) -> Result<Bytes> {
    let mut writer = BytesMut::new();
    for (name, value) in headers {
        match static_id(name) {
            Some(id) => writer.put_u8(id),
            None => {
                if name.len() > usize::from(u8::MAX) {
                    return Err(Error::ErrHeaderNameTooLong);
                }
                writer.put_u8(LITERAL_NAME);
                writer.put_u8(name.len() as u8);
                writer.put_slice(name.to_ascii_lowercase().as_bytes());
            }
        }
        put_varint16(&mut writer, value.len())?;
        writer.put_slice(value.as_bytes());
    }
    Ok(writer.freeze())
}

/// Exact inverse of [`encode_header_block`].
pub fn decode_header_block(raw: &[u8]) -> Result<Vec<(String, String)>> {
    let mut headers = vec![];
    let mut pos = 0;
    while pos < raw.len() {
        let id = raw[pos];
        pos += 1;
        let name = if id == LITERAL_NAME {
            let name_len = usize::from(*raw.get(pos).ok_or(Error::ErrHeaderBlockTruncated)?);
            pos += 1;
            let name = get_slice(raw, &mut pos, name_len)?;
            String::from_utf8(name.to_vec()).map_err(|_| Error::ErrInvalidUtf8)?
        } else {
            let index = usize::from(id) - 1;
            if index >= STATIC_NAMES.len() {
                return Err(Error::ErrUnknownHeaderId { id });
            }
            STATIC_NAMES[index].to_owned()
        };

        let value_len = get_varint16(raw, &mut pos)?;
        let value = get_slice(raw, &mut pos, value_len)?;
        let value = String::from_utf8(value.to_vec()).map_err(|_| Error::ErrInvalidUtf8)?;
        headers.push((name, value));
    }
    Ok(headers)
}
