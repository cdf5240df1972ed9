//! Chunked binary framing: the 8-byte message header, security headers,
//! sequence header, the connection handshake messages and multi-chunk
//! message reassembly.

use crate::codec;
use crate::net::support::{
    Deserialize, ErrorType, NetworkError, NetworkResult, Serialize, SizedRead, SizedWrite,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Message type (3 bytes) + chunk type (1 byte) + size (4 bytes).
pub const MESSAGE_HEADER_SIZE: usize = 8;
/// Secure channel id following the message header on OPN/MSG/CLO chunks.
pub const CHANNEL_ID_SIZE: usize = 4;
pub const SECURE_HEADER_SIZE: usize = MESSAGE_HEADER_SIZE + CHANNEL_ID_SIZE;
pub const SYM_SECURITY_HEADER_SIZE: usize = 4;
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Highest sequence number before the mandatory wrap to 1.
pub const SEQUENCE_WRAP_LIMIT: u32 = 4_294_966_271;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    OpenChannel,
    Message,
    CloseChannel,
}

impl MessageType {
    #[inline]
    pub fn wire_bytes(self) -> [u8; 3] {
        match self {
            MessageType::Hello => *b"HEL",
            MessageType::Acknowledge => *b"ACK",
            MessageType::Error => *b"ERR",
            MessageType::OpenChannel => *b"OPN",
            MessageType::Message => *b"MSG",
            MessageType::CloseChannel => *b"CLO",
        }
    }

    #[inline]
    pub fn from_wire(bytes: [u8; 3]) -> Option<MessageType> {
        match &bytes {
            b"HEL" => Some(MessageType::Hello),
            b"ACK" => Some(MessageType::Acknowledge),
            b"ERR" => Some(MessageType::Error),
            b"OPN" => Some(MessageType::OpenChannel),
            b"MSG" => Some(MessageType::Message),
            b"CLO" => Some(MessageType::CloseChannel),
            _ => None,
        }
    }

    /// True for the chunk kinds that carry a secure channel id and security
    /// headers.
    #[inline]
    pub fn is_secured(self) -> bool {
        matches!(
            self,
            MessageType::OpenChannel | MessageType::Message | MessageType::CloseChannel
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChunkType {
    /// Final chunk of a message.
    Final,
    /// Intermediate chunk, more follow.
    Intermediate,
    /// Abort: discard the partially assembled message.
    Abort,
}

impl ChunkType {
    #[inline]
    pub fn wire_byte(self) -> u8 {
        match self {
            ChunkType::Final => b'F',
            ChunkType::Intermediate => b'C',
            ChunkType::Abort => b'A',
        }
    }

    #[inline]
    pub fn from_wire(byte: u8) -> Option<ChunkType> {
        match byte {
            b'F' => Some(ChunkType::Final),
            b'C' => Some(ChunkType::Intermediate),
            b'A' => Some(ChunkType::Abort),
            _ => None,
        }
    }
}

/// The leading 8 bytes of every chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChunkHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    /// Total byte length of the chunk, header included.
    pub size: u32,
}

impl ChunkHeader {
    /// Peeks a header off the front of `data` without consuming it.
    pub fn peek(data: &[u8]) -> NetworkResult<ChunkHeader> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(NetworkError::Wait);
        }

        let message_type = MessageType::from_wire([data[0], data[1], data[2]])
            .ok_or(NetworkError::Fatal(ErrorType::MessageTypeInvalid))?;
        let chunk_type = ChunkType::from_wire(data[3])
            .ok_or(NetworkError::Fatal(ErrorType::ChunkTypeInvalid))?;
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        if (size as usize) < MESSAGE_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        Ok(ChunkHeader {
            message_type,
            chunk_type,
            size,
        })
    }

    /// Writes the header into the first 8 bytes of `chunk`.
    pub fn write_to(&self, chunk: &mut [u8]) {
        chunk[..3].copy_from_slice(&self.message_type.wire_bytes());
        chunk[3] = self.chunk_type.wire_byte();
        chunk[4..8].copy_from_slice(&self.size.to_le_bytes());
    }
}

/// Connection handshake: client greeting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: Option<String>,
}

impl Serialize for HelloMessage {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < 20 {
            return Err(NetworkError::Wait);
        }

        stream.write_u32::<LittleEndian>(self.protocol_version)?;
        stream.write_u32::<LittleEndian>(self.receive_buffer_size)?;
        stream.write_u32::<LittleEndian>(self.send_buffer_size)?;
        stream.write_u32::<LittleEndian>(self.max_message_size)?;
        stream.write_u32::<LittleEndian>(self.max_chunk_count)?;
        codec::write_string(stream, self.endpoint_url.as_deref())
    }
}

impl Deserialize for HelloMessage {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<HelloMessage> {
        if stream.remaining_data() < 24 {
            return Err(NetworkError::Wait);
        }

        Ok(HelloMessage {
            protocol_version: stream.read_u32::<LittleEndian>()?,
            receive_buffer_size: stream.read_u32::<LittleEndian>()?,
            send_buffer_size: stream.read_u32::<LittleEndian>()?,
            max_message_size: stream.read_u32::<LittleEndian>()?,
            max_chunk_count: stream.read_u32::<LittleEndian>()?,
            endpoint_url: codec::read_string(stream)?,
        })
    }
}

/// Connection handshake: server reply carrying its own limits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AcknowledgeMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl Serialize for AcknowledgeMessage {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < 20 {
            return Err(NetworkError::Wait);
        }

        stream.write_u32::<LittleEndian>(self.protocol_version)?;
        stream.write_u32::<LittleEndian>(self.receive_buffer_size)?;
        stream.write_u32::<LittleEndian>(self.send_buffer_size)?;
        stream.write_u32::<LittleEndian>(self.max_message_size)?;
        stream.write_u32::<LittleEndian>(self.max_chunk_count)?;
        Ok(())
    }
}

impl Deserialize for AcknowledgeMessage {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<AcknowledgeMessage> {
        if stream.remaining_data() < 20 {
            return Err(NetworkError::Wait);
        }

        Ok(AcknowledgeMessage {
            protocol_version: stream.read_u32::<LittleEndian>()?,
            receive_buffer_size: stream.read_u32::<LittleEndian>()?,
            send_buffer_size: stream.read_u32::<LittleEndian>()?,
            max_message_size: stream.read_u32::<LittleEndian>()?,
            max_chunk_count: stream.read_u32::<LittleEndian>()?,
        })
    }
}

/// ERR chunk payload: a status code and a reason string.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorMessage {
    pub error: u32,
    pub reason: Option<String>,
}

impl Serialize for ErrorMessage {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < 8 {
            return Err(NetworkError::Wait);
        }

        stream.write_u32::<LittleEndian>(self.error)?;
        codec::write_string(stream, self.reason.as_deref())
    }
}

impl Deserialize for ErrorMessage {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<ErrorMessage> {
        if stream.remaining_data() < 8 {
            return Err(NetworkError::Wait);
        }

        Ok(ErrorMessage {
            error: stream.read_u32::<LittleEndian>()?,
            reason: codec::read_string(stream)?,
        })
    }
}

/// Asymmetric security header carried by OPN chunks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AsymmetricSecurityHeader {
    pub policy_uri: String,
    pub sender_certificate: Option<Vec<u8>>,
    pub receiver_thumbprint: Option<Vec<u8>>,
}

impl AsymmetricSecurityHeader {
    #[inline]
    pub fn encoded_size(&self) -> usize {
        4 + self.policy_uri.len()
            + 4
            + self.sender_certificate.as_ref().map_or(0, Vec::len)
            + 4
            + self.receiver_thumbprint.as_ref().map_or(0, Vec::len)
    }
}

impl Serialize for AsymmetricSecurityHeader {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        codec::write_string(stream, Some(&self.policy_uri))?;
        codec::write_byte_string(stream, self.sender_certificate.as_deref())?;
        codec::write_byte_string(stream, self.receiver_thumbprint.as_deref())
    }
}

impl Deserialize for AsymmetricSecurityHeader {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<AsymmetricSecurityHeader> {
        let policy_uri = match codec::read_string(stream)? {
            Some(uri) => uri,
            None => return Err(NetworkError::Fatal(ErrorType::PolicyRejected)),
        };

        Ok(AsymmetricSecurityHeader {
            policy_uri,
            sender_certificate: codec::read_byte_string(stream)?,
            receiver_thumbprint: codec::read_byte_string(stream)?,
        })
    }
}

/// Symmetric security header carried by MSG/CLO chunks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

/// Per-chunk sequence number and the request id correlating chunks of one
/// logical message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn read(data: &[u8]) -> NetworkResult<SequenceHeader> {
        if data.len() < SEQUENCE_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        Ok(SequenceHeader {
            sequence_number: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            request_id: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[..4].copy_from_slice(&self.sequence_number.to_le_bytes());
        data[4..8].copy_from_slice(&self.request_id.to_le_bytes());
    }
}

/// The next outbound sequence number, observing the mandatory wrap.
#[inline]
pub fn next_sequence(current: u32) -> u32 {
    if current >= SEQUENCE_WRAP_LIMIT {
        1
    } else {
        current + 1
    }
}

/// Checks an inbound sequence number against the last accepted one. The only
/// legal discontinuity is the wrap from beyond the limit back to 1.
#[inline]
pub fn sequence_follows(last: u32, received: u32) -> bool {
    received == next_sequence(last)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecurityTokenRequestType {
    Issue = 0,
    Renew = 1,
}

/// OPN request payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenSecureChannelRequestBody {
    pub client_protocol_version: u32,
    pub request_type: SecurityTokenRequestType,
    pub security_mode: u32,
    pub policy_uri: Option<String>,
    pub client_nonce: Option<Vec<u8>>,
    pub requested_lifetime_ms: u32,
}

impl Serialize for OpenSecureChannelRequestBody {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < 16 {
            return Err(NetworkError::Wait);
        }

        stream.write_u32::<LittleEndian>(self.client_protocol_version)?;
        stream.write_u32::<LittleEndian>(self.request_type as u32)?;
        stream.write_u32::<LittleEndian>(self.security_mode)?;
        codec::write_string(stream, self.policy_uri.as_deref())?;
        codec::write_byte_string(stream, self.client_nonce.as_deref())?;
        stream.write_u32::<LittleEndian>(self.requested_lifetime_ms)?;
        Ok(())
    }
}

impl Deserialize for OpenSecureChannelRequestBody {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<OpenSecureChannelRequestBody> {
        if stream.remaining_data() < 16 {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        let client_protocol_version = stream.read_u32::<LittleEndian>()?;
        let request_type = match stream.read_u32::<LittleEndian>()? {
            0 => SecurityTokenRequestType::Issue,
            1 => SecurityTokenRequestType::Renew,
            _ => return Err(NetworkError::Fatal(ErrorType::Decoding)),
        };

        Ok(OpenSecureChannelRequestBody {
            client_protocol_version,
            request_type,
            security_mode: stream.read_u32::<LittleEndian>()?,
            policy_uri: codec::read_string(stream)?,
            client_nonce: codec::read_byte_string(stream)?,
            requested_lifetime_ms: stream.read_u32::<LittleEndian>()?,
        })
    }
}

/// OPN response payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenSecureChannelResponseBody {
    pub server_protocol_version: u32,
    pub channel_id: u32,
    pub token_id: u32,
    pub revised_lifetime_ms: u32,
    pub server_nonce: Option<Vec<u8>>,
}

impl Serialize for OpenSecureChannelResponseBody {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < 16 {
            return Err(NetworkError::Wait);
        }

        stream.write_u32::<LittleEndian>(self.server_protocol_version)?;
        stream.write_u32::<LittleEndian>(self.channel_id)?;
        stream.write_u32::<LittleEndian>(self.token_id)?;
        stream.write_u32::<LittleEndian>(self.revised_lifetime_ms)?;
        codec::write_byte_string(stream, self.server_nonce.as_deref())
    }
}

impl Deserialize for OpenSecureChannelResponseBody {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<OpenSecureChannelResponseBody> {
        if stream.remaining_data() < 16 {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        Ok(OpenSecureChannelResponseBody {
            server_protocol_version: stream.read_u32::<LittleEndian>()?,
            channel_id: stream.read_u32::<LittleEndian>()?,
            token_id: stream.read_u32::<LittleEndian>()?,
            revised_lifetime_ms: stream.read_u32::<LittleEndian>()?,
            server_nonce: codec::read_byte_string(stream)?,
        })
    }
}

/// Reassembles the chunks of one logical message. All chunks must carry the
/// same request id; an abort chunk silently discards the partial state.
pub struct ChunkAssembler {
    request_id: Option<u32>,
    payload: Vec<u8>,
    chunk_count: u32,
    max_message_size: usize,
    max_chunk_count: u32,
}

impl ChunkAssembler {
    #[inline]
    pub fn new(max_message_size: usize, max_chunk_count: u32) -> ChunkAssembler {
        ChunkAssembler {
            request_id: None,
            payload: Vec::new(),
            chunk_count: 0,
            max_message_size,
            max_chunk_count,
        }
    }

    /// True while a message is partially assembled.
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.request_id.is_some()
    }

    /// Discards any partial state.
    #[inline]
    pub fn reset(&mut self) {
        self.request_id = None;
        self.payload.clear();
        self.chunk_count = 0;
    }

    /// Feeds one decrypted chunk body. Returns the completed message payload
    /// with its request id once the final chunk arrives.
    pub fn feed(
        &mut self,
        request_id: u32,
        chunk_type: ChunkType,
        body: &[u8],
    ) -> NetworkResult<Option<(u32, Vec<u8>)>> {
        if let Some(current) = self.request_id {
            if current != request_id {
                return Err(NetworkError::Fatal(ErrorType::RequestIdMismatch));
            }
        }

        if chunk_type == ChunkType::Abort {
            self.reset();
            return Ok(None);
        }

        self.chunk_count += 1;
        if self.max_chunk_count != 0 && self.chunk_count > self.max_chunk_count {
            self.reset();
            return Err(NetworkError::Fatal(ErrorType::ChunkCountExceeded));
        }

        if self.max_message_size != 0 && self.payload.len() + body.len() > self.max_message_size {
            self.reset();
            return Err(NetworkError::Fatal(ErrorType::MessageTooLarge));
        }

        self.request_id = Some(request_id);
        self.payload.extend_from_slice(body);

        match chunk_type {
            ChunkType::Final => {
                let payload = std::mem::take(&mut self.payload);
                self.reset();
                Ok(Some((request_id, payload)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_chunk_header_roundtrip() {
        let header = ChunkHeader {
            message_type: MessageType::Message,
            chunk_type: ChunkType::Intermediate,
            size: 512,
        };

        let mut data = [0u8; MESSAGE_HEADER_SIZE];
        header.write_to(&mut data);

        assert_eq!(&data[..4], b"MSGC");
        assert_eq!(ChunkHeader::peek(&data).unwrap(), header);
    }

    #[test]
    fn test_chunk_header_err_bad_type() {
        let mut data = [0u8; MESSAGE_HEADER_SIZE];
        data[..4].copy_from_slice(b"XXXF");
        data[4..].copy_from_slice(&64u32.to_le_bytes());

        assert_eq!(
            ChunkHeader::peek(&data).unwrap_err(),
            NetworkError::Fatal(ErrorType::MessageTypeInvalid)
        );
    }

    #[test]
    fn test_chunk_header_wait_on_short_input() {
        assert_eq!(ChunkHeader::peek(b"MSG").unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 1 << 20,
            max_chunk_count: 64,
            endpoint_url: Some("opc.tcp://girder:4840/".to_string()),
        };

        let mut cursor = Cursor::new(Vec::new());
        hello.serialize(&mut cursor).unwrap();
        let data = cursor.into_inner();

        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(HelloMessage::deserialize(&mut cursor).unwrap(), hello);
    }

    #[test]
    fn test_error_message_roundtrip() {
        let error = ErrorMessage {
            error: 0x8013_0000,
            reason: Some("security checks failed".to_string()),
        };

        let mut cursor = Cursor::new(Vec::new());
        error.serialize(&mut cursor).unwrap();
        let data = cursor.into_inner();

        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(ErrorMessage::deserialize(&mut cursor).unwrap(), error);
    }

    #[test]
    fn test_asym_header_roundtrip() {
        let header = AsymmetricSecurityHeader {
            policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256".to_string(),
            sender_certificate: Some(vec![1, 2, 3]),
            receiver_thumbprint: Some(vec![9u8; 20]),
        };

        let mut cursor = Cursor::new(Vec::new());
        header.serialize(&mut cursor).unwrap();
        let data = cursor.into_inner();

        assert_eq!(data.len(), header.encoded_size());

        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(AsymmetricSecurityHeader::deserialize(&mut cursor).unwrap(), header);
    }

    #[test]
    fn test_open_request_roundtrip() {
        let body = OpenSecureChannelRequestBody {
            client_protocol_version: 0,
            request_type: SecurityTokenRequestType::Issue,
            security_mode: 3,
            policy_uri: Some("http://opcfoundation.org/UA/SecurityPolicy#Basic256".to_string()),
            client_nonce: Some(vec![7u8; 32]),
            requested_lifetime_ms: 3_600_000,
        };

        let mut cursor = Cursor::new(Vec::new());
        body.serialize(&mut cursor).unwrap();
        let data = cursor.into_inner();

        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(
            OpenSecureChannelRequestBody::deserialize(&mut cursor).unwrap(),
            body
        );
    }

    #[test]
    fn test_sequence_wrap() {
        assert_eq!(next_sequence(1), 2);
        assert_eq!(next_sequence(SEQUENCE_WRAP_LIMIT), 1);
        assert_eq!(next_sequence(u32::MAX), 1);

        assert!(sequence_follows(5, 6));
        assert!(!sequence_follows(5, 7));
        assert!(!sequence_follows(5, 5));
        // Wrap from UINT32_MAX - 1024 to 1 is the only legal discontinuity
        assert!(sequence_follows(SEQUENCE_WRAP_LIMIT, 1));
        assert!(!sequence_follows(SEQUENCE_WRAP_LIMIT - 1, 1));
    }

    #[test]
    fn test_assembler_single_chunk() {
        let mut assembler = ChunkAssembler::new(1024, 8);

        let result = assembler.feed(42, ChunkType::Final, &[1, 2, 3]).unwrap();
        assert_eq!(result, Some((42, vec![1, 2, 3])));
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_assembler_multi_chunk() {
        let mut assembler = ChunkAssembler::new(1024, 8);

        assert_eq!(assembler.feed(42, ChunkType::Intermediate, &[1, 2]).unwrap(), None);
        assert!(assembler.in_progress());
        assert_eq!(assembler.feed(42, ChunkType::Intermediate, &[3]).unwrap(), None);

        let result = assembler.feed(42, ChunkType::Final, &[4, 5]).unwrap();
        assert_eq!(result, Some((42, vec![1, 2, 3, 4, 5])));
    }

    #[test]
    fn test_assembler_abort_discards() {
        let mut assembler = ChunkAssembler::new(1024, 8);

        assembler.feed(42, ChunkType::Intermediate, &[1, 2]).unwrap();
        assert_eq!(assembler.feed(42, ChunkType::Abort, &[]).unwrap(), None);
        assert!(!assembler.in_progress());

        // A fresh message may begin afterwards
        let result = assembler.feed(43, ChunkType::Final, &[9]).unwrap();
        assert_eq!(result, Some((43, vec![9])));
    }

    #[test]
    fn test_assembler_err_request_id_mismatch() {
        let mut assembler = ChunkAssembler::new(1024, 8);

        assembler.feed(42, ChunkType::Intermediate, &[1]).unwrap();
        assert_eq!(
            assembler.feed(43, ChunkType::Final, &[2]).unwrap_err(),
            NetworkError::Fatal(ErrorType::RequestIdMismatch)
        );
    }

    #[test]
    fn test_assembler_err_message_too_large() {
        let mut assembler = ChunkAssembler::new(4, 8);

        assert_eq!(
            assembler.feed(42, ChunkType::Final, &[0u8; 5]).unwrap_err(),
            NetworkError::Fatal(ErrorType::MessageTooLarge)
        );
    }

    #[test]
    fn test_assembler_err_chunk_count() {
        let mut assembler = ChunkAssembler::new(1024, 2);

        assembler.feed(42, ChunkType::Intermediate, &[1]).unwrap();
        assembler.feed(42, ChunkType::Intermediate, &[2]).unwrap();
        assert_eq!(
            assembler.feed(42, ChunkType::Intermediate, &[3]).unwrap_err(),
            NetworkError::Fatal(ErrorType::ChunkCountExceeded)
        );
    }
}
