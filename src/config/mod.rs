mod limits;
mod logging;
mod modbee;
mod node;
mod serial;
mod timing;
pub(crate) mod types;

pub use limits::Config as LimitsConfig;
pub use logging::Config as LoggingConfig;
pub use modbee::Config as ModbeeConfig;
pub use node::Config as NodeConfig;
pub use serial::Config as SerialConfig;
pub use timing::Config as TimingConfig;
pub use types::{DataBits, Parity, StopBits};
