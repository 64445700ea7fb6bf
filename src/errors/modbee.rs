use thiserror::Error;

use super::{
    ConfigValidationError, FrameError, FrameErrorKind, FrameFormatKind, FrameSizeKind,
    InitializationError, ProtocolErrorKind, TransportError,
};

#[derive(Error, Debug)]
pub enum ModbeeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {kind} - {details}")]
    Protocol {
        kind: ProtocolErrorKind,
        details: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Initialization error: {0}")]
    Init(#[from] InitializationError),
}

impl ModbeeError {
    pub fn protocol(kind: ProtocolErrorKind, details: impl Into<String>) -> Self {
        ModbeeError::Protocol {
            kind,
            details: details.into(),
        }
    }

    pub fn config(details: impl Into<String>) -> Self {
        ModbeeError::Config(ConfigValidationError::config(details))
    }

    pub fn frame(
        kind: FrameErrorKind,
        details: impl Into<String>,
        frame_data: Option<Vec<u8>>,
    ) -> Self {
        let details = details.into();
        match kind {
            FrameErrorKind::TooShort | FrameErrorKind::TooLong => {
                ModbeeError::Frame(FrameError::Size {
                    kind: match kind {
                        FrameErrorKind::TooShort => FrameSizeKind::TooShort,
                        _ => FrameSizeKind::TooLong,
                    },
                    details,
                    frame_data,
                })
            }
            FrameErrorKind::InvalidFormat
            | FrameErrorKind::InvalidHeader
            | FrameErrorKind::InvalidSection => ModbeeError::Frame(FrameError::Format {
                kind: match kind {
                    FrameErrorKind::InvalidHeader => FrameFormatKind::InvalidHeader,
                    FrameErrorKind::InvalidSection => FrameFormatKind::InvalidSection,
                    _ => FrameFormatKind::InvalidFormat,
                },
                details,
                frame_data,
            }),
            FrameErrorKind::InvalidCrc => match frame_data {
                Some(frame_data) => ModbeeError::Frame(FrameError::Crc {
                    calculated: 0,
                    received: 0,
                    frame_hex: hex::encode(&frame_data),
                }),
                None => ModbeeError::Frame(FrameError::Format {
                    kind: FrameFormatKind::InvalidFormat,
                    details,
                    frame_data: None,
                }),
            },
        }
    }
}

impl From<config::ConfigError> for ModbeeError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(ConfigValidationError::config(err.to_string()))
    }
}
