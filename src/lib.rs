pub mod clock;
pub mod config;
pub mod data_map;
pub mod errors;
pub mod events;
pub mod frame;
pub mod io;
pub mod logging;
pub mod modbus;
pub mod ops;
pub mod protocol;
pub mod transport;
pub mod vars;

pub use clock::{Clock, SimClock, SystemClock};
pub use config::{
    LimitsConfig, LoggingConfig, ModbeeConfig, NodeConfig, SerialConfig, TimingConfig,
};
pub use config::{DataBits, Parity, StopBits};
pub use data_map::DataMap;
pub use errors::{
    ConfigValidationError, FrameError, FrameErrorKind, FrameFormatKind, FrameSizeKind,
    InitializationError, IoOperation, ModbeeError, ProtocolErrorKind, SerialErrorKind,
    TransportError,
};
pub use events::{ErrorKind, EventCategory, EventStats};
pub use logging::setup_logging;
pub use modbus::{FunctionCode, ModbusPdu};
pub use ops::{OpOutcome, OperationStats};
pub use protocol::{ModbeeNode, NodeState};
pub use transport::{BusHub, MemoryBus, SerialTransport, Transport};
pub use vars::{BitHandle, RegHandle};
