use std::fmt;
use tracing::error;

/// Every operation in this crate reports through this enum. Each variant maps onto the
/// Kerberos IV numeric status space via [KrbError::code], so callers that need the
/// historical integer codes (`RD_AP_TIME`, `INTK_BADPW`, ...) can still get them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrbError {
    // =========================================================================================
    // IMPORTANT: Don't add variables to variants in this enum - it's a potential security risk
    // as you can leak internal state in an error as these can end up in userfacing contexts!!!
    //
    // The one exception is KdcRejected, which only carries what the KDC itself chose to send
    // us in its error reply.
    //
    // If you want to debug the error, then use the error! macro at the error raise site to
    // report relevant information.
    // =========================================================================================
    ProtocolVersionMismatch,
    MessageTypeMismatch,
    BufferOverflow,
    MalformedMessage,
    ValueOutOfRange,
    DecryptionOrIntegrityFailure,
    IdentityMismatch,
    NotForThisService,
    AddressMismatch,
    ClockSkewExceeded,
    TicketExpired,
    TicketNotYetValid,
    TicketTooLarge,
    BadTicketFormat,
    MutualAuthenticationFailed,

    CacheLocked,
    CacheMissing,
    CacheAccessDenied,
    CacheNotInitialised,
    BadCacheFormat,

    NoKdcFound,
    KdcUnreachable,
    TimedOut,
    RetriesExhausted,
    KdcRejected(u32, String),

    NoTicketGrantingTicket,
    InvalidPrincipalName,
    KeyNotFound,
    KeytabFileError,
    ConfigError,

    IoError,
    BinRWError,

    /// No really, do you have a time machine? How did you go back to before 1970?
    DoYouHaveATimeMachine,
}

impl KrbError {
    /// The Kerberos IV status code for this error.
    pub fn code(&self) -> u32 {
        match self {
            KrbError::ProtocolVersionMismatch => 39, // RD_AP_VERSION
            KrbError::MessageTypeMismatch => 40,     // RD_AP_MSG_TYPE
            KrbError::MalformedMessage => 41,        // RD_AP_MODIFIED
            KrbError::DecryptionOrIntegrityFailure => 31, // RD_AP_UNDEC
            KrbError::TicketExpired => 32,           // RD_AP_EXP
            KrbError::TicketNotYetValid => 33,       // RD_AP_NYV
            KrbError::NotForThisService => 35,       // RD_AP_NOT_US
            KrbError::IdentityMismatch => 36,        // RD_AP_INCON
            KrbError::ClockSkewExceeded => 37,       // RD_AP_TIME
            KrbError::AddressMismatch => 38,         // RD_AP_BADD
            KrbError::MutualAuthenticationFailed => 43, // RD_AP_UNAUTHOR
            KrbError::RetriesExhausted => 56, // SKDC_RETRY
            KrbError::NoKdcFound | KrbError::KdcUnreachable | KrbError::TimedOut => 57, // SKDC_CANT
            KrbError::BadTicketFormat => 63, // INTK_PROT
            KrbError::NoTicketGrantingTicket => 71, // AD_NOTGT
            KrbError::CacheMissing => 76,           // NO_TKT_FIL
            KrbError::CacheAccessDenied => 77,      // TKT_FIL_ACC
            KrbError::CacheLocked => 78,            // TKT_FIL_LCK
            KrbError::BadCacheFormat => 79,         // TKT_FIL_FMT
            KrbError::CacheNotInitialised => 80,    // TKT_FIL_INI
            KrbError::InvalidPrincipalName => 81,   // KNAME_FMT
            KrbError::KdcRejected(code, _) => *code,
            KrbError::BufferOverflow
            | KrbError::ValueOutOfRange
            | KrbError::TicketTooLarge
            | KrbError::KeyNotFound
            | KrbError::KeytabFileError
            | KrbError::ConfigError
            | KrbError::IoError
            | KrbError::BinRWError
            | KrbError::DoYouHaveATimeMachine => 255, // KFAILURE
        }
    }
}

impl fmt::Display for KrbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KrbError::KdcRejected(code, text) => {
                write!(f, "KDC rejected the request ({code}): {text}")
            }
            KrbError::ProtocolVersionMismatch => write!(f, "Protocol version mismatch"),
            KrbError::MessageTypeMismatch => write!(f, "Invalid message type"),
            KrbError::BufferOverflow => write!(f, "Message buffer capacity exceeded"),
            KrbError::MalformedMessage => write!(f, "Message did not match its declared length"),
            KrbError::ValueOutOfRange => write!(f, "Value does not fit its wire field"),
            KrbError::DecryptionOrIntegrityFailure => {
                write!(f, "Can't decode message - incorrect password or key?")
            }
            KrbError::IdentityMismatch => write!(f, "Inconsistent identity in reply or request"),
            KrbError::NotForThisService => write!(f, "Ticket is not for this service"),
            KrbError::AddressMismatch => write!(f, "Incorrect network address"),
            KrbError::ClockSkewExceeded => write!(f, "Time is out of bounds"),
            KrbError::TicketExpired => write!(f, "Ticket expired"),
            KrbError::TicketNotYetValid => write!(f, "Ticket not yet valid"),
            KrbError::TicketTooLarge => write!(f, "Ticket is too large"),
            KrbError::BadTicketFormat => write!(f, "Bad ticket format"),
            KrbError::MutualAuthenticationFailed => write!(f, "Mutual authentication failed"),
            KrbError::CacheLocked => write!(f, "Couldn't lock ticket file"),
            KrbError::CacheMissing => write!(f, "No ticket file found"),
            KrbError::CacheAccessDenied => write!(f, "Couldn't access ticket file"),
            KrbError::CacheNotInitialised => write!(f, "Ticket file not initialised"),
            KrbError::BadCacheFormat => write!(f, "Bad ticket file format"),
            KrbError::NoKdcFound => write!(f, "Can't find a KDC for the realm"),
            KrbError::KdcUnreachable => write!(f, "Can't send request to KDC"),
            KrbError::TimedOut => write!(f, "KDC did not answer in time"),
            KrbError::RetriesExhausted => write!(f, "Retry count exceeded"),
            KrbError::NoTicketGrantingTicket => write!(f, "No ticket granting ticket"),
            KrbError::InvalidPrincipalName => write!(f, "Bad Kerberos name format"),
            KrbError::KeyNotFound => write!(f, "Service key not found"),
            KrbError::KeytabFileError => write!(f, "Bad srvtab file"),
            KrbError::ConfigError => write!(f, "Invalid configuration"),
            KrbError::IoError => write!(f, "I/O error"),
            KrbError::BinRWError => write!(f, "Binary encoding error"),
            KrbError::DoYouHaveATimeMachine => write!(f, "System clock is before 1970"),
        }
    }
}

impl std::error::Error for KrbError {}

impl From<std::io::Error> for KrbError {
    fn from(value: std::io::Error) -> Self {
        error!(io_err = ?value, "I/O error");
        KrbError::IoError
    }
}

impl From<binrw::Error> for KrbError {
    fn from(value: binrw::Error) -> Self {
        error!(binrw_err = ?value, "binary encoding error");
        KrbError::BinRWError
    }
}
