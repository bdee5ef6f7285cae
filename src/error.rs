//! Stable error taxonomy and the process-wide latched "last error" cell:
//! the first error since the last read wins, and is cleared on read. Kept
//! as a single process-wide cell deliberately rather than localized
//! per-connection.

use std::sync::Mutex;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable, numerically-identified error taxonomy.
///
/// Timeouts are deliberately excluded from the latch (see [`seterr`]):
/// they are a normal control-flow outcome of polling reads, not a latent
/// fault the caller needs to go digging for.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    // `Io`/`Serial` carry a formatted description rather than the
    // original `std::io::Error`/`serialport::Error` because neither of
    // those implements `Clone`, and the latched last-error cell
    // (`seterr`) needs to clone whatever it stores.
    #[error("unspecified error")]
    General,
    #[error("invalid file/port descriptor")]
    BadFd,
    #[error("out of memory")]
    NoMem,
    #[error("init type not supported by this interface")]
    InitNotSupported,
    #[error("protocol not supported by this interface")]
    ProtoNotSupported,
    #[error("ioctl not supported")]
    IoctlNotSupported,
    #[error("adapter communication failed")]
    BadIfAdapter,
    #[error("read/write timeout")]
    Timeout,
    #[error("bus error (half-duplex echo mismatch)")]
    BusError,
    #[error("bad length for this interface")]
    BadLen,
    #[error("cannot decode message")]
    BadData,
    #[error("bad checksum in received message")]
    BadCsum,
    #[error("incomplete data, need to receive more")]
    IncompleteData,
    #[error("wrong key bytes received from ECU")]
    WrongKeyBytes,
    #[error("bit rate mismatch with ECU")]
    BadBaudRate,
    #[error("ECU returned a negative response")]
    EcuSaidNo,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serial port error: {0}")]
    Serial(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Serial(e.to_string())
    }
}

impl Error {
    /// Stable numeric identity, mirroring the original `DIAG_ERR_*` values.
    /// Not all variants have a historical analogue; those get a fresh slot.
    pub fn code(&self) -> i32 {
        match self {
            Error::General => -1,
            Error::BadFd => -2,
            Error::NoMem => -3,
            Error::InitNotSupported => -4,
            Error::ProtoNotSupported => -5,
            Error::IoctlNotSupported => -6,
            Error::BadIfAdapter => -7,
            Error::Timeout => -8,
            Error::BusError => -16,
            Error::BadLen => -17,
            Error::BadData => -18,
            Error::BadCsum => -19,
            Error::IncompleteData => -20,
            Error::WrongKeyBytes => -21,
            Error::BadBaudRate => -22,
            Error::EcuSaidNo => -32,
            Error::Io(_) => -64,
            Error::Serial(_) => -65,
        }
    }
}

static LAST_ERROR: Mutex<Option<Error>> = Mutex::new(None);

/// Latch `err` as the process-wide last error, unless one is already
/// latched, and log it at the caller's location. Returns `err` back for
/// ergonomic `return seterr(...)` call sites, mirroring `diag_iseterr`.
///
/// Timeouts are never latched (see module docs).
#[track_caller]
pub fn seterr(err: Error) -> Error {
    if !matches!(err, Error::Timeout) {
        let loc = std::panic::Location::caller();
        tracing::error!(%loc, %err, "latching error");
        let mut slot = LAST_ERROR.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
    }
    err
}

/// `seterr` ergonomic flavor for call sites that want `None` rather than
/// propagating a value, mirroring `diag_pseterr`.
#[track_caller]
pub fn pseterr<T>(err: Error) -> Option<T> {
    seterr(err);
    None
}

/// Return-and-clear the latched error.
pub fn geterr() -> Option<Error> {
    LAST_ERROR.lock().unwrap().take()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_until_read() {
        let _ = geterr();
        seterr(Error::BadLen);
        seterr(Error::BadCsum);
        let got = geterr();
        assert!(matches!(got, Some(Error::BadLen)));
        assert!(geterr().is_none());
    }

    #[test]
    fn timeout_is_never_latched() {
        let _ = geterr();
        seterr(Error::Timeout);
        assert!(geterr().is_none());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::General.code(), -1);
        assert_eq!(Error::EcuSaidNo.code(), -32);
    }
}
