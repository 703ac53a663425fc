//! Tag-length-value primitives shared by the schema codec and the framer.

#[derive(Debug, Clone)]
pub struct Tlv<'a> {
    pub tag_class: u8,
    pub constructed: bool,
    pub tag_num: u32,
    pub length: usize,
    pub value: &'a [u8],
    pub raw: &'a [u8],
}

const HEX: &[u8; 16] = b"0123456789abcdef";

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0F) as usize] as char);
    }
    out
}

pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[inline(always)]
pub fn find_eoc(data: &[u8], mut off: usize) -> Option<usize> {
    let mut depth: i32 = 1;
    while off + 1 < data.len() {
        if data[off] == 0x00 && data[off + 1] == 0x00 {
            depth -= 1;
            off += 2;
            if depth == 0 {
                return Some(off);
            }
            continue;
        }

        let start = off;
        let tag_byte = *data.get(off)?;
        off += 1;

        let constructed = ((tag_byte >> 5) & 0x01) != 0;
        if (tag_byte & 0x1F) == 0x1F {
            while off < data.len() {
                let b = data[off];
                off += 1;
                if (b & 0x80) == 0 {
                    break;
                }
            }
        }

        let len_byte = *data.get(off)?;
        off += 1;

        if len_byte == 0x80 {
            if !constructed {
                return None;
            }
            depth += 1;
            continue;
        }

        let len = if (len_byte & 0x80) != 0 {
            let n = (len_byte & 0x7F) as usize;
            if n == 0 || n > std::mem::size_of::<usize>() || off + n > data.len() {
                return None;
            }
            let mut l = 0usize;
            for _ in 0..n {
                l = (l << 8) | data[off] as usize;
                off += 1;
            }
            l
        } else {
            len_byte as usize
        };

        if len > data.len() - off {
            return None;
        }
        off += len;

        if off <= start {
            return None;
        }
    }
    None
}

/// Parses one TLV at `offset`. Returns the TLV and the offset just past it;
/// `None` when the bytes do not hold a complete TLV.
#[inline(always)]
pub fn parse_tlv(data: &[u8], mut offset: usize) -> Option<(Tlv<'_>, usize)> {
    let data_len = data.len();
    if offset >= data_len {
        return None;
    }

    let start = offset;
    let tag_byte = data[offset];
    offset += 1;

    let tag_class = (tag_byte >> 6) & 0x03;
    let constructed = ((tag_byte >> 5) & 0x01) != 0;
    let mut tag_num = (tag_byte & 0x1F) as u32;

    if tag_num == 0x1F {
        tag_num = 0;
        loop {
            let b = *data.get(offset)?;
            offset += 1;
            tag_num = tag_num.checked_mul(128)? | (b & 0x7F) as u32;
            if (b & 0x80) == 0 {
                break;
            }
        }
    }

    let length_byte = *data.get(offset)?;
    offset += 1;

    if length_byte == 0x80 {
        if !constructed {
            return None;
        }
        let content_start = offset;
        let eoc_end = find_eoc(data, offset)?;
        let content_end = eoc_end.checked_sub(2)?;
        let length = content_end.checked_sub(content_start)?;
        return Some((
            Tlv {
                tag_class,
                constructed,
                tag_num,
                length,
                value: &data[content_start..content_end],
                raw: &data[start..eoc_end],
            },
            eoc_end,
        ));
    }

    let length = if (length_byte & 0x80) != 0 {
        let num_octets = (length_byte & 0x7F) as usize;
        if num_octets == 0
            || num_octets > std::mem::size_of::<usize>()
            || offset + num_octets > data_len
        {
            return None;
        }
        let mut l: usize = 0;
        for &b in &data[offset..offset + num_octets] {
            l = (l << 8) | b as usize;
        }
        offset += num_octets;
        l
    } else {
        length_byte as usize
    };

    if length > data_len - offset {
        return None;
    }

    let value = &data[offset..offset + length];
    offset += length;

    Some((
        Tlv {
            tag_class,
            constructed,
            tag_num,
            length,
            value,
            raw: &data[start..offset],
        },
        offset,
    ))
}

pub fn write_tag(out: &mut Vec<u8>, class: u8, constructed: bool, number: u32) {
    let lead = (class << 6) | if constructed { 0x20 } else { 0x00 };
    if number < 0x1F {
        out.push(lead | number as u8);
        return;
    }
    out.push(lead | 0x1F);
    let mut groups = Vec::with_capacity(5);
    let mut n = number;
    loop {
        groups.push((n & 0x7F) as u8);
        n >>= 7;
        if n == 0 {
            break;
        }
    }
    for (i, g) in groups.iter().enumerate().rev() {
        out.push(if i == 0 { *g } else { *g | 0x80 });
    }
}

/// Definite, minimal length octets.
pub fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

pub fn write_tlv(out: &mut Vec<u8>, class: u8, constructed: bool, number: u32, content: &[u8]) {
    write_tag(out, class, constructed, number);
    write_length(out, content.len());
    out.extend_from_slice(content);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_definite_short_and_long_forms() {
        let data = [0x80, 0x02, b'h', b'i'];
        let (tlv, end) = parse_tlv(&data, 0).unwrap();
        assert_eq!((tlv.tag_class, tlv.constructed, tlv.tag_num), (2, false, 0));
        assert_eq!(tlv.value, b"hi");
        assert_eq!(end, 4);

        let mut long = vec![0x04, 0x81, 0x90];
        long.extend(std::iter::repeat(0xAB).take(0x90));
        let (tlv, end) = parse_tlv(&long, 0).unwrap();
        assert_eq!(tlv.length, 0x90);
        assert_eq!(end, long.len());
    }

    #[test]
    fn parses_indefinite_length_with_nested_eoc() {
        let data = [0xA1, 0x80, 0x30, 0x80, 0x80, 0x01, 0x07, 0x00, 0x00, 0x00, 0x00, 0xFF];
        let (tlv, end) = parse_tlv(&data, 0).unwrap();
        assert!(tlv.constructed);
        assert_eq!(tlv.tag_num, 1);
        assert_eq!(end, 11);
        assert_eq!(tlv.value, &data[2..9]);
    }

    #[test]
    fn multi_byte_tag_number() {
        let data = [0xBF, 0x81, 0x48, 0x00];
        let (tlv, _) = parse_tlv(&data, 0).unwrap();
        assert_eq!(tlv.tag_class, 2);
        assert_eq!(tlv.tag_num, 200);

        let mut out = Vec::new();
        write_tag(&mut out, 2, true, 200);
        assert_eq!(out, vec![0xBF, 0x81, 0x48]);
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(parse_tlv(&[0x30, 0x05, 0x01], 0).is_none());
        assert!(parse_tlv(&[0x30], 0).is_none());
        assert!(parse_tlv(&[0x04, 0x80, 0x00, 0x00], 0).is_none());
    }

    #[test]
    fn length_encoding_is_minimal() {
        let mut out = Vec::new();
        write_length(&mut out, 0x7F);
        write_length(&mut out, 0x80);
        write_length(&mut out, 0x1234);
        assert_eq!(out, vec![0x7F, 0x81, 0x80, 0x82, 0x12, 0x34]);
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(hex_encode(&[0x00, 0xF1, 0x2a]), "00f12a");
        assert_eq!(hex_decode("00F12a"), Some(vec![0x00, 0xF1, 0x2A]));
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode("zz"), None);
    }
}
