//! yEnc encoding for article bodies
//!
//! Pure byte-in/byte-out codec: a file window goes in, a framed yEnc body
//! (`=ybegin` / `=ypart` / encoded lines / `=yend`) comes out. Transport
//! concerns (dot-stuffing, CRLF conversion) belong to the connection pool.

/// Encoded line width in output bytes. An escape pair is never split, so a
/// line may exceed this by one byte.
const LINE_LENGTH: usize = 128;

/// Critical bytes that must be escaped wherever they occur
const NUL: u8 = 0x00;
const LF: u8 = 0x0A;
const CR: u8 = 0x0D;
const EQUALS: u8 = 0x3D;

/// Metadata describing the window being encoded
#[derive(Clone, Copy, Debug)]
pub struct YencMeta<'a> {
    /// Filename carried in the =ybegin header
    pub name: &'a str,
    /// Total size of the source file
    pub file_size: u64,
    /// 1-based part number
    pub part_number: u32,
    /// Total parts for this file
    pub total_parts: u32,
    /// Byte offset of this window within the file
    pub offset: u64,
}

/// Encode one file window as a complete yEnc body.
///
/// The window spans `[offset, offset + data.len())` of the source file; the
/// `=ypart` begin/end markers are 1-based inclusive per the yEnc draft. The
/// `=yend` trailer carries the crc32 of the raw (unencoded) window.
pub fn encode(data: &[u8], meta: &YencMeta<'_>) -> Vec<u8> {
    // Worst case every byte escapes to two, plus line breaks and framing
    let mut out = Vec::with_capacity(data.len() * 2 + data.len() / LINE_LENGTH * 2 + 256);

    out.extend_from_slice(
        format!(
            "=ybegin part={} total={} line={} size={} name={}\r\n",
            meta.part_number, meta.total_parts, LINE_LENGTH, meta.file_size, meta.name
        )
        .as_bytes(),
    );
    out.extend_from_slice(
        format!(
            "=ypart begin={} end={}\r\n",
            meta.offset + 1,
            meta.offset + data.len() as u64
        )
        .as_bytes(),
    );

    let mut line_len = 0usize;
    for &byte in data {
        let encoded = byte.wrapping_add(42);
        let needs_escape = matches!(encoded, NUL | LF | CR | EQUALS)
            || (line_len == 0 && encoded == b'.');

        if needs_escape {
            out.push(b'=');
            out.push(encoded.wrapping_add(64));
            line_len += 2;
        } else {
            out.push(encoded);
            line_len += 1;
        }

        if line_len >= LINE_LENGTH {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
        }
    }
    if line_len > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    out.extend_from_slice(
        format!(
            "=yend size={} part={} pcrc32={:08x}\r\n",
            data.len(),
            meta.part_number,
            hasher.finalize()
        )
        .as_bytes(),
    );

    out
}
