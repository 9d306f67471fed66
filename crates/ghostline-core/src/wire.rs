//! Frame codec: the handful of SMB2 messages this tool ever sends.
//!
//! Everything here is write-only: messages are built from fixed field
//! values and serialized byte-exact. All multi-byte protocol fields are
//! little-endian (zerocopy byteorder types, so the structs have alignment 1
//! and no padding); only the transport envelope length is big-endian.
//!
//! There is no unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type Le64 = U64<LittleEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol id carried by every plain SMB2 header.
pub const SMB2_PROTOCOL_ID: [u8; 4] = *b"\xfeSMB";

/// Protocol id of a compression transform header.
pub const COMPRESSED_PROTOCOL_ID: [u8; 4] = *b"\xfcSMB";

/// SMB2 NEGOTIATE command code.
pub const SMB2_NEGOTIATE: u16 = 0x0000;

/// Dialects offered in the negotiate request: 2.0.2, 2.1, 3.0, 3.0.2, 3.1.1.
pub const DIALECTS: [u16; 5] = [0x0202, 0x0210, 0x0300, 0x0302, 0x0311];

/// Client capabilities: large MTU | encryption.
pub const CLIENT_CAPABILITIES: u32 = 0x44;

/// Fixed client GUID.
pub const CLIENT_GUID: [u8; 16] = [
    0x13, 0x37, 0xC0, 0xDE, 0x13, 0x37, 0xC0, 0xDE, 0x13, 0x37, 0xC0, 0xDE, 0x13, 0x37, 0xC0, 0xDE,
];

pub const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;
pub const COMPRESSION_CAPABILITIES: u16 = 0x0003;

/// SHA-512, the only preauth hash the peer accepts.
pub const HASH_ALGORITHM_SHA512: u16 = 0x0001;

/// LZNT1.
pub const COMPRESSION_ALGORITHM_LZNT1: u16 = 0x0001;

/// Every negotiate context starts with type (2) + data length (2) + reserved (4).
pub const NEGOTIATE_CONTEXT_HEADER_LEN: usize = 8;

/// Envelope: 1-byte message type + 3-byte big-endian length.
pub const ENVELOPE_HEADER_LEN: usize = 4;

/// Largest payload a 24-bit envelope length can describe.
pub const MAX_ENVELOPE_PAYLOAD: usize = 0x00FF_FFFF;

/// NetBIOS session message.
pub const SESSION_MESSAGE: u8 = 0x00;

// ── SMB2 Header ───────────────────────────────────────────────────────────────

/// Sync SMB2 header. One per outgoing message, never mutated after build.
///
/// Wire size: 64 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Smb2Header {
    pub protocol_id: [u8; 4],
    pub header_length: Le16,
    pub credit_charge: Le16,
    pub channel_sequence: Le16,
    pub reserved: Le16,
    pub command: Le16,
    pub credits_requested: Le16,
    pub flags: Le32,
    pub chain_offset: Le32,
    pub message_id: Le64,
    pub process_id: Le32,
    pub tree_id: Le32,
    pub session_id: Le64,
    pub signature: [u8; 16],
}

assert_eq_size!(Smb2Header, [u8; 64]);

impl Smb2Header {
    pub fn new(command: u16, message_id: u64) -> Self {
        Self {
            protocol_id: SMB2_PROTOCOL_ID,
            header_length: Le16::new(64),
            credit_charge: Le16::ZERO,
            channel_sequence: Le16::ZERO,
            reserved: Le16::ZERO,
            command: Le16::new(command),
            credits_requested: Le16::ZERO,
            flags: Le32::ZERO,
            chain_offset: Le32::ZERO,
            message_id: Le64::new(message_id),
            process_id: Le32::ZERO,
            tree_id: Le32::ZERO,
            session_id: Le64::ZERO,
            signature: [0u8; 16],
        }
    }
}

// ── Negotiate ─────────────────────────────────────────────────────────────────

/// NEGOTIATE request up to and including the dialect list and the padding
/// that aligns the first negotiate context.
///
/// Wire size: 112 bytes (64 header + 48 body).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NegotiateRequest {
    pub header: Smb2Header,
    pub structure_size: Le16,
    pub dialect_count: Le16,
    pub security_mode: Le16,
    pub reserved: Le16,
    pub capabilities: Le32,
    pub client_guid: [u8; 16],
    /// Offset of the first negotiate context from the start of the header.
    pub negotiate_context_offset: Le32,
    pub negotiate_context_count: Le16,
    pub reserved2: Le16,
    pub dialects: [Le16; 5],
    pub padding: Le16,
}

assert_eq_size!(NegotiateRequest, [u8; 112]);

impl NegotiateRequest {
    pub fn new(context_count: u16) -> Self {
        Self {
            header: Smb2Header::new(SMB2_NEGOTIATE, 0),
            structure_size: Le16::new(0x24),
            dialect_count: Le16::new(DIALECTS.len() as u16),
            security_mode: Le16::ZERO,
            reserved: Le16::ZERO,
            capabilities: Le32::new(CLIENT_CAPABILITIES),
            client_guid: CLIENT_GUID,
            negotiate_context_offset: Le32::new(std::mem::size_of::<Self>() as u32),
            negotiate_context_count: Le16::new(context_count),
            reserved2: Le16::ZERO,
            dialects: DIALECTS.map(Le16::new),
            padding: Le16::ZERO,
        }
    }
}

/// Preauthentication integrity negotiate context with a single hash
/// algorithm and an all-zero salt.
///
/// Wire size: 46 bytes (8 context header + 38 data). Padded to 8 by the
/// message builder.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PreauthIntegrityContext {
    pub context_type: Le16,
    pub data_length: Le16,
    pub reserved: Le32,
    pub hash_algorithm_count: Le16,
    pub salt_length: Le16,
    pub hash_algorithm: Le16,
    pub salt: [u8; 32],
}

assert_eq_size!(PreauthIntegrityContext, [u8; 46]);

impl Default for PreauthIntegrityContext {
    fn default() -> Self {
        Self {
            context_type: Le16::new(PREAUTH_INTEGRITY_CAPABILITIES),
            data_length: Le16::new((std::mem::size_of::<Self>() - NEGOTIATE_CONTEXT_HEADER_LEN) as u16),
            reserved: Le32::ZERO,
            hash_algorithm_count: Le16::new(1),
            salt_length: Le16::new(32),
            hash_algorithm: Le16::new(HASH_ALGORITHM_SHA512),
            salt: [0u8; 32],
        }
    }
}

/// Compression capabilities negotiate context advertising LZNT1 only.
///
/// Wire size: 18 bytes (8 context header + 10 data).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct CompressionCapabilitiesContext {
    pub context_type: Le16,
    pub data_length: Le16,
    pub reserved: Le32,
    pub compression_algorithm_count: Le16,
    pub padding: Le16,
    pub flags: Le32,
    pub compression_algorithm: Le16,
}

assert_eq_size!(CompressionCapabilitiesContext, [u8; 18]);

impl Default for CompressionCapabilitiesContext {
    fn default() -> Self {
        Self {
            context_type: Le16::new(COMPRESSION_CAPABILITIES),
            data_length: Le16::new((std::mem::size_of::<Self>() - NEGOTIATE_CONTEXT_HEADER_LEN) as u16),
            reserved: Le32::ZERO,
            compression_algorithm_count: Le16::new(1),
            padding: Le16::ZERO,
            flags: Le32::new(1),
            compression_algorithm: Le16::new(COMPRESSION_ALGORITHM_LZNT1),
        }
    }
}

/// The complete negotiate request: fixed part, then both negotiate
/// contexts, each starting on an 8-byte boundary.
pub fn negotiate_request() -> Bytes {
    let preauth = PreauthIntegrityContext::default();
    let compression = CompressionCapabilitiesContext::default();

    let mut buf = BytesMut::with_capacity(192);
    buf.put_slice(NegotiateRequest::new(2).as_bytes());
    buf.put_slice(preauth.as_bytes());
    pad_to(&mut buf, 8);
    buf.put_slice(compression.as_bytes());
    buf.freeze()
}

fn pad_to(buf: &mut BytesMut, align: usize) {
    let rem = buf.len() % align;
    if rem != 0 {
        buf.put_bytes(0, align - rem);
    }
}

// ── Compression Transform ─────────────────────────────────────────────────────

/// Compression transform header.
///
/// `offset` is the length of the uncompressed segment that sits between
/// this header and the compressed region. The peer trusts
/// `original_size` when sizing its decompression buffer.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct CompressedTransformHeader {
    pub protocol_id: [u8; 4],
    pub original_size: Le32,
    pub algorithm: Le16,
    pub flags: Le16,
    pub offset: Le32,
}

assert_eq_size!(CompressedTransformHeader, [u8; 16]);

/// Header, uncompressed prefix, compressed region.
pub fn compressed_transform(compressed: &[u8], original_size: u32, prefix: &[u8]) -> Bytes {
    let header = CompressedTransformHeader {
        protocol_id: COMPRESSED_PROTOCOL_ID,
        original_size: Le32::new(original_size),
        algorithm: Le16::new(COMPRESSION_ALGORITHM_LZNT1),
        flags: Le16::ZERO,
        offset: Le32::new(prefix.len() as u32),
    };

    let mut buf = BytesMut::with_capacity(16 + prefix.len() + compressed.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(prefix);
    buf.put_slice(compressed);
    buf.freeze()
}

// ── Transport Envelope ────────────────────────────────────────────────────────

/// Wrap a protocol message in the session-message envelope the peer uses
/// to frame the TCP byte stream.
pub fn envelope(payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_ENVELOPE_PAYLOAD);
    let len = payload.len() as u32;

    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    buf.put_u8(SESSION_MESSAGE);
    buf.put_slice(&len.to_be_bytes()[1..]);
    buf.put_slice(payload);
    buf.freeze()
}

/// True when `response` carries a normal SMB2 header right after the
/// envelope, i.e. the peer answered the message instead of leaking memory.
pub fn is_protocol_echo(response: &[u8]) -> bool {
    response.get(ENVELOPE_HEADER_LEN..ENVELOPE_HEADER_LEN + 4) == Some(&SMB2_PROTOCOL_ID[..])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
