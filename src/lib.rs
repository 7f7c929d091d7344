pub mod bitfield;
pub mod commands;
pub mod connection;
pub mod control;
pub mod device;
pub mod modbus;
pub mod mqtt;
pub mod output;
pub mod poll;
pub mod publish;
pub mod records;
pub mod registers;
pub mod telemetry;

#[cfg(test)]
mod testing;
