pub mod pdu;
pub mod processor;

pub use pdu::{FunctionCode, ModbusPdu};
