//! Chunked LZ77 codec, bit-compatible with the peer's LZNT1 decompressor.
//!
//! A stream is a sequence of self-describing chunks:
//!
//! ```text
//! [u16 header][body]   header bit 15 = compressed, bits 0-11 = body_len - 1
//! ```
//!
//! A compressed body is a run of groups: one flag byte, then up to eight
//! tokens, LSB first. A clear bit is a literal byte, a set bit a 2-byte
//! back-reference. How the 16 token bits split between offset and length
//! depends on how much output the chunk has produced so far
//! ([`BackRefSchedule`]); encoder and decoder must agree exactly or the
//! stream desynchronizes.
//!
//! There is no dictionary across chunks.

// ── Constants ─────────────────────────────────────────────────────────────────

/// Uncompressed bytes per chunk.
pub const CHUNK_SIZE: usize = 0x1000;

/// Chunk header bit marking an encoded body.
pub const CHUNK_COMPRESSED: u16 = 0x8000;

const CHUNK_LENGTH_MASK: u16 = 0x0FFF;

/// Header words as the peer's own compressor emits them (signature bits
/// 12-14 set to 0b011).
const HEADER_COMPRESSED: u32 = 0xB000;
const HEADER_RAW: u32 = 0x3000;

/// Bogus header appended after a forced chunk. Parsed by the peer as the
/// start of a chunk that does not exist.
pub const DESYNC_TRAILER: u16 = 0x1337;

/// Shortest back-reference worth a token.
pub const MIN_MATCH: usize = 3;

/// Tiled sources are repeated to at least this many bytes.
const TILE_SPAN: usize = 0xFFF;

/// Output length below which the token split never narrows.
const SCHEDULE_FLOOR: usize = 0x10;

/// Narrowest split: a full 4 KiB chunk needs 12 offset bits.
const MIN_OFFSET_SHIFT: u32 = 4;

// ── Schedule ──────────────────────────────────────────────────────────────────

/// Offset/length split of a back-reference token.
///
/// Starts at 12 length bits / 4 offset bits and gives one bit from length
/// to offset every time the output length crosses a power of two above 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackRefSchedule {
    pub length_mask: u16,
    pub offset_shift: u32,
}

impl BackRefSchedule {
    pub fn for_output_len(produced: usize) -> Self {
        let mut length_mask: u16 = 0x0FFF;
        let mut offset_shift: u32 = 12;
        let mut pos = produced.saturating_sub(1);
        while pos >= SCHEDULE_FLOOR && offset_shift > MIN_OFFSET_SHIFT {
            length_mask >>= 1;
            offset_shift -= 1;
            pos >>= 1;
        }
        Self {
            length_mask,
            offset_shift,
        }
    }

    /// Longest match a single token can describe.
    pub fn max_length(self) -> usize {
        self.length_mask as usize + MIN_MATCH
    }

    /// `(offset, length)` of a token.
    pub fn decode(self, token: u16) -> (usize, usize) {
        let length = (token & self.length_mask) as usize + MIN_MATCH;
        let offset = (token >> self.offset_shift) as usize + 1;
        (offset, length)
    }

    pub fn encode(self, offset: usize, length: usize) -> u16 {
        debug_assert!(offset >= 1 && length >= MIN_MATCH && length <= self.max_length());
        (((offset - 1) << self.offset_shift) | (length - MIN_MATCH)) as u16
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// How a chunk is framed once encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodePolicy {
    /// Emit whichever of raw or encoded is smaller, like a well-behaved
    /// compressor.
    #[default]
    Smallest,

    /// Always emit the encoded body, even when it is larger than the raw
    /// chunk, and finish the stream with [`DESYNC_TRAILER`]. A body longer
    /// than 4 KiB overflows the 12-bit length field into the header's
    /// signature bits.
    ForceEncoded,
}

// ── Decompression ─────────────────────────────────────────────────────────────

/// Decode a chunk stream.
///
/// With `strict` set, a header whose declared length runs past the end of
/// `input` is an error. Without it the chunk is decoded from whatever bytes
/// remain.
pub fn decompress(input: &[u8], strict: bool) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut cursor = 0;

    while cursor < input.len() {
        let Some(header) = read_u16(input, cursor) else {
            if strict {
                return Err(CompressionError::TruncatedChunkHeader { at: cursor });
            }
            break;
        };
        cursor += 2;

        let declared = (header & CHUNK_LENGTH_MASK) as usize + 1;
        let available = input.len() - cursor;
        if strict && declared > available {
            return Err(CompressionError::InvalidChunkLength {
                declared,
                available,
            });
        }

        let end = cursor + declared.min(available);
        let body = &input[cursor..end];
        if header & CHUNK_COMPRESSED != 0 {
            out.extend_from_slice(&decompress_chunk(body)?);
        } else {
            out.extend_from_slice(body);
        }
        cursor = end;
    }

    Ok(out)
}

fn decompress_chunk(body: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(CHUNK_SIZE);
    let mut pos = 0;

    'groups: while pos < body.len() {
        let flags = body[pos];
        pos += 1;

        for bit in 0..8 {
            if pos >= body.len() {
                break 'groups;
            }

            if (flags >> bit) & 1 == 0 {
                out.push(body[pos]);
                pos += 1;
                continue;
            }

            // A token cut in half ends the chunk.
            let Some(token) = read_u16(body, pos) else {
                break 'groups;
            };
            pos += 2;

            let (offset, length) = BackRefSchedule::for_output_len(out.len()).decode(token);
            copy_back_reference(&mut out, offset, length)?;
        }
    }

    Ok(out)
}

fn copy_back_reference(
    out: &mut Vec<u8>,
    offset: usize,
    length: usize,
) -> Result<(), CompressionError> {
    if offset > out.len() {
        return Err(CompressionError::BackReferenceOutOfRange {
            offset,
            produced: out.len(),
        });
    }

    let start = out.len() - offset;
    if length >= offset {
        let tiled = tile(&out[start..], length);
        out.extend_from_slice(&tiled[..length]);
    } else {
        out.extend_from_within(start..start + length);
    }
    Ok(())
}

/// Repeat `source` until it covers both `TILE_SPAN` and `want` bytes.
/// A reference whose source overlaps its own output reads as this
/// repetition.
fn tile(source: &[u8], want: usize) -> Vec<u8> {
    let reps = TILE_SPAN.max(want) / source.len() + 1;
    source.repeat(reps)
}

// ── Compression ───────────────────────────────────────────────────────────────

/// Encode `input` in [`CHUNK_SIZE`] chunks.
pub fn compress(input: &[u8], policy: EncodePolicy) -> Vec<u8> {
    compress_chunked(input, CHUNK_SIZE, policy)
}

/// Encode `input` in chunks of `chunk_size` bytes (at most [`CHUNK_SIZE`]).
///
/// # Panics
///
/// If `chunk_size` is zero or larger than [`CHUNK_SIZE`]; the 12-bit
/// length field cannot describe a bigger raw chunk.
pub fn compress_chunked(input: &[u8], chunk_size: usize, policy: EncodePolicy) -> Vec<u8> {
    assert!(
        chunk_size > 0 && chunk_size <= CHUNK_SIZE,
        "chunk size {chunk_size} out of range"
    );

    let mut out = Vec::with_capacity(input.len() + input.len() / 8 + 4);
    for chunk in input.chunks(chunk_size) {
        let encoded = encode_chunk(chunk);
        if policy == EncodePolicy::ForceEncoded || encoded.len() < chunk.len() {
            push_header(&mut out, HEADER_COMPRESSED, encoded.len());
            out.extend_from_slice(&encoded);
        } else {
            push_header(&mut out, HEADER_RAW, chunk.len());
            out.extend_from_slice(chunk);
        }
    }

    if policy == EncodePolicy::ForceEncoded {
        out.extend_from_slice(&DESYNC_TRAILER.to_le_bytes());
    }
    out
}

fn push_header(out: &mut Vec<u8>, flags: u32, body_len: usize) {
    let header = (flags | (body_len as u32 - 1)) as u16;
    out.extend_from_slice(&header.to_le_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Match {
    offset: usize,
    length: usize,
}

fn encode_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() + chunk.len() / 8 + 1);
    let mut pos = 0;

    while pos < chunk.len() {
        let flag_at = out.len();
        out.push(0);
        let mut flags = 0u8;

        for bit in 0..8 {
            let schedule = BackRefSchedule::for_output_len(pos);
            let max_len = (chunk.len() - pos).min(schedule.max_length());

            let here = find_match(&chunk[..pos], &chunk[pos..], max_len);
            let next = find_match(&chunk[..pos + 1], &chunk[pos + 1..], max_len);
            // Take a literal now if waiting one byte buys a longer match.
            let here = here.filter(|m| next.map_or(true, |n| m.length >= n.length));

            match here {
                Some(m) => {
                    let token = schedule.encode(m.offset, m.length);
                    out.extend_from_slice(&token.to_le_bytes());
                    flags |= 1 << bit;
                    pos += m.length;
                }
                None => {
                    out.push(chunk[pos]);
                    pos += 1;
                }
            }

            if pos == chunk.len() {
                break;
            }
        }

        out[flag_at] = flags;
    }

    out
}

/// Longest prefix of `lookahead` that can be copied from `window`.
///
/// Prefixes are tried from one byte upward; each is located at its
/// right-most position in the window. A hit that ends exactly at the
/// window's tail may run on into the lookahead itself, so that case is
/// extended against the tiled tail.
fn find_match(window: &[u8], lookahead: &[u8], max_len: usize) -> Option<Match> {
    let max_len = max_len.min(lookahead.len());
    let mut best: Option<Match> = None;

    for len in 1..max_len {
        let Some(at) = rfind(window, &lookahead[..len]) else {
            break;
        };
        let offset = window.len() - at;

        let length = if offset == len {
            let tiled = tile(&window[at..], max_len);
            common_prefix(&tiled, &lookahead[..max_len])
        } else {
            len
        };

        if best.map_or(true, |b| length > b.length) {
            best = Some(Match { offset, length });
        }
    }

    best.filter(|m| m.length >= MIN_MATCH)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Malformed-stream errors. Only decompression can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    #[error("invalid chunk length: header declares {declared} bytes, {available} remain")]
    InvalidChunkLength { declared: usize, available: usize },

    #[error("truncated chunk header at byte {at}")]
    TruncatedChunkHeader { at: usize },

    #[error("back-reference offset {offset} exceeds {produced} bytes of output")]
    BackReferenceOutOfRange { offset: usize, produced: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..=4097)
    }

    /// Few distinct symbols, so matches are long and often overlap their
    /// own output.
    fn arb_low_alphabet() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(prop::sample::select(vec![0x00u8, b'A', b'B']), 0..=4097)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn random_bytes_round_trip(input in arb_bytes()) {
            let packed = compress(&input, EncodePolicy::Smallest);
            prop_assert_eq!(decompress(&packed, true).unwrap(), input);
        }

        #[test]
        fn low_alphabet_round_trip(input in arb_low_alphabet()) {
            let packed = compress(&input, EncodePolicy::Smallest);
            prop_assert_eq!(decompress(&packed, true).unwrap(), input);
        }

        #[test]
        fn concatenated_streams_decode_to_concatenation(
            a in arb_low_alphabet(),
            b in arb_bytes(),
        ) {
            let mut joined = compress(&a, EncodePolicy::Smallest);
            joined.extend_from_slice(&compress(&b, EncodePolicy::Smallest));

            let mut expected = a.clone();
            expected.extend_from_slice(&b);
            prop_assert_eq!(decompress(&joined, true).unwrap(), expected);
        }
    }
}
