//! IPFIX basicList encoding (RFC 6313) for uniform arrays.
//!
//! A basicList is carried in a variable-length field: a long-form length
//! prefix (`0xFF` + 2-byte length), then a one-byte semantic, the field
//! id with the enterprise bit, the element length, the enterprise number
//! and the packed elements. All integers are big-endian.

use std::time::Duration;

/// Bytes before the first element: 3-byte length prefix + 1 semantic +
/// 2 field id + 2 element length + 4 enterprise number.
pub const HEADER_SIZE: usize = 12;

/// List semantic "ordered" (RFC 6313 section 4.4).
const SEMANTIC_ORDERED: u8 = 4;

fn fill_header(
    buf: &mut [u8],
    enterprise: u32,
    field_id: u16,
    elem_len: u16,
    content_len: usize,
) {
    buf[0] = 0xFF;
    buf[1..3].copy_from_slice(&(content_len as u16).to_be_bytes());
    buf[3] = SEMANTIC_ORDERED;
    buf[4..6].copy_from_slice(&(field_id | 0x8000).to_be_bytes());
    buf[6..8].copy_from_slice(&elem_len.to_be_bytes());
    buf[8..12].copy_from_slice(&enterprise.to_be_bytes());
}

fn fill_with<F>(
    buf: &mut [u8],
    enterprise: u32,
    field_id: u16,
    elem_len: usize,
    count: usize,
    write: F,
) -> Option<usize>
where
    F: FnOnce(&mut [u8]),
{
    let total = HEADER_SIZE + count * elem_len;
    if buf.len() < total || total - 3 > usize::from(u16::MAX) {
        return None;
    }
    fill_header(buf, enterprise, field_id, elem_len as u16, total - 3);
    write(&mut buf[HEADER_SIZE..total]);
    Some(total)
}

/// Encode a list of 16-bit values. Returns bytes written, `None` when
/// `buf` is too small.
pub fn fill_u16(buf: &mut [u8], enterprise: u32, field_id: u16, values: &[u16]) -> Option<usize> {
    fill_with(buf, enterprise, field_id, 2, values.len(), |out| {
        for (chunk, value) in out.chunks_exact_mut(2).zip(values) {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
    })
}

/// Encode a list of 8-bit values.
pub fn fill_u8(buf: &mut [u8], enterprise: u32, field_id: u16, values: &[u8]) -> Option<usize> {
    fill_with(buf, enterprise, field_id, 1, values.len(), |out| {
        out.copy_from_slice(values);
    })
}

/// Encode a list of signed 8-bit values.
pub fn fill_i8(buf: &mut [u8], enterprise: u32, field_id: u16, values: &[i8]) -> Option<usize> {
    fill_with(buf, enterprise, field_id, 1, values.len(), |out| {
        for (byte, value) in out.iter_mut().zip(values) {
            *byte = *value as u8;
        }
    })
}

/// Encode a list of timestamps as pairs of 32-bit seconds/microseconds.
pub fn fill_time(
    buf: &mut [u8],
    enterprise: u32,
    field_id: u16,
    values: &[Duration],
) -> Option<usize> {
    fill_with(buf, enterprise, field_id, 8, values.len(), |out| {
        for (chunk, ts) in out.chunks_exact_mut(8).zip(values) {
            chunk[0..4].copy_from_slice(&(ts.as_secs() as u32).to_be_bytes());
            chunk[4..8].copy_from_slice(&ts.subsec_micros().to_be_bytes());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_list_layout() {
        let mut buf = [0u8; 64];
        let written = fill_u16(&mut buf, 8057, 1013, &[0x0102, 0x0304]).unwrap();
        assert_eq!(written, HEADER_SIZE + 4);
        assert_eq!(buf[0], 0xFF);
        // Content length excludes the 3-byte prefix.
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 9 + 4);
        assert_eq!(buf[3], 4);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 1013 | 0x8000);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 2);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 8057);
        assert_eq!(&buf[12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn insufficient_space_is_signalled() {
        let mut buf = [0u8; 13];
        assert!(fill_u16(&mut buf, 8057, 1013, &[1]).is_none());
        let mut buf = [0u8; 14];
        assert!(fill_u16(&mut buf, 8057, 1013, &[1]).is_some());
    }

    #[test]
    fn empty_list_is_just_the_header() {
        let mut buf = [0u8; 16];
        assert_eq!(fill_u8(&mut buf, 8057, 1015, &[]), Some(HEADER_SIZE));
    }

    #[test]
    fn time_elements_are_eight_bytes() {
        let mut buf = [0u8; 32];
        let ts = Duration::new(5, 500_000_000);
        let written = fill_time(&mut buf, 8057, 1014, &[ts]).unwrap();
        assert_eq!(written, HEADER_SIZE + 8);
        assert_eq!(u32::from_be_bytes(buf[12..16].try_into().unwrap()), 5);
        assert_eq!(u32::from_be_bytes(buf[16..20].try_into().unwrap()), 500_000);
    }
}
