use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::SessionState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("usb transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),
    #[error("no USB device found with VID {vid:#06x} and PID {pid:#06x}")]
    DeviceNotFound { vid: u16, pid: u16 },
    #[error("the USB device is already connected")]
    AlreadyConnected,
    #[error("command {command:?} resulted in an unexpected response: expected {expected:?}, got {actual:?}")]
    Protocol {
        command: String,
        expected: String,
        actual: String,
    },
    #[error("the USB device is not connected")]
    NotConnected,
    #[error("command cannot be executed in the current state ({0})")]
    InvalidState(SessionState),
    #[error("parameter error: {0}")]
    Parameter(String),
    #[error("file error for {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Zero padding at the end of `actual` is dropped.
    pub(crate) fn protocol(command: &[u8], expected: &str, actual: &[u8]) -> Self {
        let end = actual.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let actual = &actual[..end];
        DriverError::Protocol {
            command: String::from_utf8_lossy(command).into_owned(),
            expected: expected.to_string(),
            actual: String::from_utf8_lossy(actual).into_owned(),
        }
    }

    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DriverError::File {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parameter(msg: impl Into<String>) -> Self {
        DriverError::Parameter(msg.into())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(value: serde_json::Error) -> Self {
        DriverError::Config(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_drops_packet_padding() {
        let err = DriverError::protocol(b"CELL ON", "OK", b"ERR\0\0\0\0");
        match &err {
            DriverError::Protocol { actual, .. } => assert_eq!(actual, "ERR"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.to_string().contains("\\0"));

        let err = DriverError::protocol(b"ADCREAD", "6-byte frame", &[0; 4]);
        assert!(matches!(err, DriverError::Protocol { ref actual, .. } if actual.is_empty()));
    }
}
