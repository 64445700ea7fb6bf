#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorKind {
    TooShort,
    TooLong,
    InvalidFormat,
    InvalidHeader,
    InvalidSection,
    InvalidCrc,
}

impl std::fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "Frame too short"),
            Self::TooLong => write!(f, "Frame too long"),
            Self::InvalidFormat => write!(f, "Invalid frame format"),
            Self::InvalidHeader => write!(f, "Invalid frame header"),
            Self::InvalidSection => write!(f, "Invalid Modbus section"),
            Self::InvalidCrc => write!(f, "Invalid frame CRC"),
        }
    }
}
