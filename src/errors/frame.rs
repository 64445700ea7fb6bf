use thiserror::Error;

use super::{FrameFormatKind, FrameSizeKind};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame size error: {kind} - {details}")]
    Size {
        kind: FrameSizeKind,
        details: String,
        frame_data: Option<Vec<u8>>,
    },

    #[error("Frame format error: {kind} - {details}")]
    Format {
        kind: FrameFormatKind,
        details: String,
        frame_data: Option<Vec<u8>>,
    },

    #[error("CRC error: calculated={calculated:04X}, received={received:04X}, frame={frame_hex}")]
    Crc {
        calculated: u16,
        received: u16,
        frame_hex: String,
    },
}

impl FrameError {
    pub fn size(kind: FrameSizeKind, details: impl Into<String>) -> Self {
        FrameError::Size {
            kind,
            details: details.into(),
            frame_data: None,
        }
    }

    pub fn format(kind: FrameFormatKind, details: impl Into<String>) -> Self {
        FrameError::Format {
            kind,
            details: details.into(),
            frame_data: None,
        }
    }

    pub fn crc(calculated: u16, received: u16, frame: &[u8]) -> Self {
        FrameError::Crc {
            calculated,
            received,
            frame_hex: hex::encode(frame),
        }
    }
}
