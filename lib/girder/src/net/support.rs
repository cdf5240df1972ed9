use crate::status::StatusCode;
use std::io;
use std::net;

pub const PROTOCOL_VERSION: u32 = 0;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// Not enough data or buffer capacity; try again later.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    MessageTypeInvalid,
    ChunkTypeInvalid,
    MessageTooLarge,
    ChunkCountExceeded,
    SequenceInvalid,
    RequestIdMismatch,
    TokenInvalid,
    ChannelIdInvalid,
    PolicyRejected,
    ModeRejected,
    StateInvalid,
    EmptyPayload,
    Decoding,
    Crypto,
    Expired,
    /// Certificate verification verdict from the trust store.
    Security(StatusCode),
    Io(io::ErrorKind),
    AddrParse,
}

impl ErrorType {
    /// Status code placed in the ERR chunk when the channel closes.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorType::MessageTypeInvalid | ErrorType::ChunkTypeInvalid => {
                StatusCode::BadTcpMessageTypeInvalid
            }
            ErrorType::MessageTooLarge | ErrorType::ChunkCountExceeded => {
                StatusCode::BadTcpMessageTooLarge
            }
            ErrorType::SequenceInvalid
            | ErrorType::RequestIdMismatch
            | ErrorType::TokenInvalid
            | ErrorType::Crypto => StatusCode::BadSecurityChecksFailed,
            ErrorType::ChannelIdInvalid => StatusCode::BadSecureChannelIdInvalid,
            ErrorType::PolicyRejected => StatusCode::BadSecurityPolicyRejected,
            ErrorType::ModeRejected => StatusCode::BadSecurityModeRejected,
            ErrorType::StateInvalid => StatusCode::BadInvalidState,
            ErrorType::Expired => StatusCode::BadSecureChannelClosed,
            ErrorType::Security(code) => *code,
            ErrorType::EmptyPayload | ErrorType::Decoding => StatusCode::BadTcpInternalError,
            ErrorType::Io(_) | ErrorType::AddrParse => StatusCode::BadTcpInternalError,
        }
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<&mut Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::MAX - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::MAX - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized wire objects. Implementors must validate the
/// remaining free capacity upfront and only write if everything fits.
///
/// Should return `NetworkError::Wait` in case there is not enough capacity.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()>;
}

/// Trait for manually deserialized wire objects.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self>;
}
