//! OPC UA status codes used as the service-layer error currency.

/// Numeric status codes as they appear on the wire. `Good` variants occupy
/// the low severity band, `Bad` variants have the top bit set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Good = 0x0000_0000,
    GoodCompletesAsynchronously = 0x002E_0000,
    BadUnexpectedError = 0x8001_0000,
    BadInternalError = 0x8002_0000,
    BadOutOfMemory = 0x8003_0000,
    BadTimeout = 0x800A_0000,
    BadServiceUnsupported = 0x800B_0000,
    BadDecodingError = 0x8007_0000,
    BadNothingToDo = 0x800F_0000,
    BadTooManyOperations = 0x8010_0000,
    BadCertificateInvalid = 0x8012_0000,
    BadSecurityChecksFailed = 0x8013_0000,
    BadCertificateTimeInvalid = 0x8014_0000,
    BadCertificateUriInvalid = 0x8017_0000,
    BadCertificateUseNotAllowed = 0x8018_0000,
    BadCertificateUntrusted = 0x801A_0000,
    BadCertificateRevocationUnknown = 0x801B_0000,
    BadCertificateIssuerRevocationUnknown = 0x801C_0000,
    BadCertificateRevoked = 0x801D_0000,
    BadUserAccessDenied = 0x801F_0000,
    BadIdentityTokenInvalid = 0x8020_0000,
    BadIdentityTokenRejected = 0x8021_0000,
    BadSecureChannelIdInvalid = 0x8022_0000,
    BadInvalidTimestamp = 0x8023_0000,
    BadNonceInvalid = 0x8024_0000,
    BadSessionIdInvalid = 0x8025_0000,
    BadSessionClosed = 0x8026_0000,
    BadSessionNotActivated = 0x8027_0000,
    BadInvalidArgument = 0x80AB_0000,
    BadInvalidState = 0x80AF_0000,
    BadNotReadable = 0x803A_0000,
    BadNotWritable = 0x803B_0000,
    BadNotFound = 0x803E_0000,
    BadNotSupported = 0x803D_0000,
    BadRequestTypeInvalid = 0x8053_0000,
    BadSecurityModeRejected = 0x8054_0000,
    BadSecurityPolicyRejected = 0x8055_0000,
    BadTooManySessions = 0x8056_0000,
    BadRequestCancelledByClient = 0x802C_0000,
    BadRequestTooLarge = 0x80B8_0000,
    BadSequenceNumberInvalid = 0x80BE_0000,
    BadSecureChannelClosed = 0x8086_0000,
    BadSecureChannelTokenUnknown = 0x8087_0000,
    BadTcpServerTooBusy = 0x807D_0000,
    BadTcpMessageTypeInvalid = 0x807E_0000,
    BadTcpSecureChannelUnknown = 0x807F_0000,
    BadTcpMessageTooLarge = 0x8080_0000,
    BadTcpInternalError = 0x8082_0000,
    BadTcpEndpointUrlInvalid = 0x8083_0000,
    BadTransactionPending = 0x80E8_0000,
}

impl StatusCode {
    #[inline]
    pub fn is_good(self) -> bool {
        (self as u32) & 0x8000_0000 == 0
    }

    #[inline]
    pub fn is_bad(self) -> bool {
        !self.is_good()
    }

    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a wire value into a known status code. Unknown values map to
    /// `BadUnexpectedError` so the severity bit survives the trip.
    pub fn from_u32(value: u32) -> StatusCode {
        match value {
            0x0000_0000 => StatusCode::Good,
            0x002E_0000 => StatusCode::GoodCompletesAsynchronously,
            0x8002_0000 => StatusCode::BadInternalError,
            0x8003_0000 => StatusCode::BadOutOfMemory,
            0x8007_0000 => StatusCode::BadDecodingError,
            0x800A_0000 => StatusCode::BadTimeout,
            0x800B_0000 => StatusCode::BadServiceUnsupported,
            0x800F_0000 => StatusCode::BadNothingToDo,
            0x8010_0000 => StatusCode::BadTooManyOperations,
            0x8012_0000 => StatusCode::BadCertificateInvalid,
            0x8013_0000 => StatusCode::BadSecurityChecksFailed,
            0x8014_0000 => StatusCode::BadCertificateTimeInvalid,
            0x8017_0000 => StatusCode::BadCertificateUriInvalid,
            0x8018_0000 => StatusCode::BadCertificateUseNotAllowed,
            0x801A_0000 => StatusCode::BadCertificateUntrusted,
            0x801B_0000 => StatusCode::BadCertificateRevocationUnknown,
            0x801C_0000 => StatusCode::BadCertificateIssuerRevocationUnknown,
            0x801D_0000 => StatusCode::BadCertificateRevoked,
            0x801F_0000 => StatusCode::BadUserAccessDenied,
            0x8020_0000 => StatusCode::BadIdentityTokenInvalid,
            0x8021_0000 => StatusCode::BadIdentityTokenRejected,
            0x8022_0000 => StatusCode::BadSecureChannelIdInvalid,
            0x8023_0000 => StatusCode::BadInvalidTimestamp,
            0x8024_0000 => StatusCode::BadNonceInvalid,
            0x8025_0000 => StatusCode::BadSessionIdInvalid,
            0x8026_0000 => StatusCode::BadSessionClosed,
            0x8027_0000 => StatusCode::BadSessionNotActivated,
            0x80AB_0000 => StatusCode::BadInvalidArgument,
            0x80AF_0000 => StatusCode::BadInvalidState,
            0x803A_0000 => StatusCode::BadNotReadable,
            0x803B_0000 => StatusCode::BadNotWritable,
            0x803E_0000 => StatusCode::BadNotFound,
            0x803D_0000 => StatusCode::BadNotSupported,
            0x8053_0000 => StatusCode::BadRequestTypeInvalid,
            0x8054_0000 => StatusCode::BadSecurityModeRejected,
            0x8055_0000 => StatusCode::BadSecurityPolicyRejected,
            0x8056_0000 => StatusCode::BadTooManySessions,
            0x802C_0000 => StatusCode::BadRequestCancelledByClient,
            0x80B8_0000 => StatusCode::BadRequestTooLarge,
            0x80BE_0000 => StatusCode::BadSequenceNumberInvalid,
            0x8086_0000 => StatusCode::BadSecureChannelClosed,
            0x8087_0000 => StatusCode::BadSecureChannelTokenUnknown,
            0x807D_0000 => StatusCode::BadTcpServerTooBusy,
            0x807E_0000 => StatusCode::BadTcpMessageTypeInvalid,
            0x807F_0000 => StatusCode::BadTcpSecureChannelUnknown,
            0x8080_0000 => StatusCode::BadTcpMessageTooLarge,
            0x8082_0000 => StatusCode::BadTcpInternalError,
            0x8083_0000 => StatusCode::BadTcpEndpointUrlInvalid,
            0x80E8_0000 => StatusCode::BadTransactionPending,
            _ => StatusCode::BadUnexpectedError,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}(0x{:08X})", self, self.code())
    }
}
