use crate::connection;
use tokio_util::bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const READ_HOLDING_REGISTERS: u8 = 3;
pub const READ_INPUT_REGISTERS: u8 = 4;
pub const WRITE_SINGLE_REGISTER: u8 = 6;

/// Protocol limit on the number of registers returned by a single read.
pub const MAX_READ_COUNT: u16 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::GetHoldings { .. } => READ_HOLDING_REGISTERS,
            Operation::SetHolding { .. } => WRITE_SINGLE_REGISTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Exception(Exception),
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
}

/// Exception codes defined by the Modbus application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum ExceptionCode {
    #[strum(to_string = "illegal function")]
    IllegalFunction = 1,
    #[strum(to_string = "illegal data address")]
    IllegalDataAddress = 2,
    #[strum(to_string = "illegal data value")]
    IllegalDataValue = 3,
    #[strum(to_string = "server device failure")]
    ServerDeviceFailure = 4,
    #[strum(to_string = "acknowledge")]
    Acknowledge = 5,
    #[strum(to_string = "server device busy")]
    ServerDeviceBusy = 6,
    #[strum(to_string = "memory parity error")]
    MemoryParityError = 8,
    #[strum(to_string = "gateway path unavailable")]
    GatewayPathUnavailable = 0x0A,
    #[strum(to_string = "gateway target device failed to respond")]
    GatewayTargetFailedToRespond = 0x0B,
}

/// An exception response reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    /// Function code of the request that failed, without the exception flag.
    pub function_code: u8,
    pub exception_code: u8,
}

impl Exception {
    pub fn code(&self) -> Option<ExceptionCode> {
        ExceptionCode::from_repr(self.exception_code)
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{code} (exception code {})", self.exception_code),
            None => write!(f, "exception code {}", self.exception_code),
        }
    }
}

/// How a failed register access is classified when reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusErrorKind {
    /// The device rejected a register read.
    Read,
    /// The device rejected a register write.
    Write,
    /// The device rejected some other function.
    Function(u8),
    /// No response could be obtained.
    Transport,
}

/// A register access failed, either because the device responded with an exception or because
/// the request could not be completed at all.
#[derive(Debug)]
pub struct ModbusError {
    pub what: &'static str,
    pub address: u16,
    pub source: connection::Error,
}

impl ModbusError {
    pub fn new(what: &'static str, address: u16, source: connection::Error) -> Self {
        Self { what, address, source }
    }

    pub fn exception(&self) -> Option<Exception> {
        match self.source {
            connection::Error::Exception(e) => Some(e),
            _ => None,
        }
    }

    pub fn kind(&self) -> ModbusErrorKind {
        match self.exception() {
            None => ModbusErrorKind::Transport,
            Some(Exception { function_code: READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS, .. }) => {
                ModbusErrorKind::Read
            }
            Some(Exception { function_code: WRITE_SINGLE_REGISTER, .. }) => ModbusErrorKind::Write,
            Some(Exception { function_code, .. }) => ModbusErrorKind::Function(function_code),
        }
    }
}

impl std::fmt::Display for ModbusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { what, address, .. } = self;
        match (self.kind(), self.exception()) {
            (ModbusErrorKind::Read, Some(e)) => {
                write!(f, "{what}: cannot address 0x{address:04x}: {e}")
            }
            (ModbusErrorKind::Write, Some(e)) => {
                write!(f, "{what}: cannot write register address 0x{address:04x}: {e}")
            }
            (ModbusErrorKind::Function(fc), Some(e)) => {
                write!(f, "{what}: cannot call function {fc}: {e}, address 0x{address:04x}")
            }
            _ => write!(f, "{what}: request for address 0x{address:04x} failed"),
        }
    }
}

impl std::error::Error for ModbusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            connection::Error::Exception(_) => None,
            ref e => Some(e),
        }
    }
}

pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut tokio_util::bytes::BytesMut) -> Result<(), Self::Error> {
        let (address, operand) = match req.operation {
            Operation::GetHoldings { address, count } => (address, count),
            Operation::SetHolding { address, value } => (address, value),
        };
        dst.reserve(12);
        dst.put_u16(req.transaction_id);
        // protocol identifier, then the length of everything following the length field.
        dst.put_u16(0);
        dst.put_u16(6);
        dst.put_u8(req.device_id);
        dst.put_u8(req.operation.function_code());
        dst.put_u16(address);
        dst.put_u16(operand);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut tokio_util::bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, remainder)) = src.split_first_chunk::<6>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            let length = u16::from_be_bytes([header[4], header[5]]);
            if proto != 0 || length < 2 {
                // Not a frame boundary, resynchronize.
                src.advance(1);
                continue;
            }
            let Some((data, _)) = remainder.split_at_checked(length.into()) else {
                return Ok(None);
            };
            let frame_len = 6 + usize::from(length);
            let kind = match data {
                [_, fc, code, ..] if *fc & 0x80 != 0 => ResponseKind::Exception(Exception {
                    function_code: fc & 0x7F,
                    exception_code: *code,
                }),
                [_, READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS, byte_count, values @ ..]
                    if usize::from(*byte_count) == values.len() && values.len() % 2 == 0 =>
                {
                    let values = values
                        .chunks_exact(2)
                        .map(|w| u16::from_be_bytes([w[0], w[1]]))
                        .collect();
                    ResponseKind::GetHoldings { values }
                }
                [_, WRITE_SINGLE_REGISTER, a, b, c, d] => ResponseKind::SetHolding {
                    address: u16::from_be_bytes([*a, *b]),
                    value: u16::from_be_bytes([*c, *d]),
                },
                _ => {
                    trace!(message = "skipping a frame we cannot interpret", transaction_id);
                    src.advance(frame_len);
                    continue;
                }
            };
            let device_id = data[0];
            src.advance(frame_len);
            return Ok(Some(Response { device_id, transaction_id, kind }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn decode_all(bytes: &[u8]) -> Vec<Response> {
        let mut buffer = BytesMut::from(bytes);
        let mut codec = ModbusTCPCodec {};
        let mut out = Vec::new();
        while let Some(response) = codec.decode(&mut buffer).unwrap() {
            out.push(response);
        }
        out
    }

    #[test]
    fn encodes_read_request() {
        let mut buffer = BytesMut::new();
        let request = Request {
            device_id: 3,
            transaction_id: 0x0102,
            operation: Operation::GetHoldings { address: 0x63, count: 16 },
        };
        ModbusTCPCodec {}.encode(request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], [1, 2, 0, 0, 0, 6, 3, 3, 0, 0x63, 0, 16]);
    }

    #[test]
    fn encodes_write_request() {
        let mut buffer = BytesMut::new();
        let request = Request {
            device_id: 1,
            transaction_id: 7,
            operation: Operation::SetHolding { address: 0x12B, value: 0xFF01 },
        };
        ModbusTCPCodec {}.encode(request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], [0, 7, 0, 0, 0, 6, 1, 6, 0x01, 0x2B, 0xFF, 0x01]);
    }

    #[test]
    fn decodes_read_response() {
        let responses = decode_all(&[0, 9, 0, 0, 0, 9, 1, 3, 6, 0, 5, 0x12, 0x34, 0, 3]);
        assert_eq!(
            responses,
            [Response {
                device_id: 1,
                transaction_id: 9,
                kind: ResponseKind::GetHoldings { values: vec![5, 0x1234, 3] },
            }]
        );
    }

    #[test]
    fn decodes_exception_and_write_echo() {
        let responses = decode_all(&[
            0, 1, 0, 0, 0, 3, 1, 0x86, 2, // exception on write
            0, 2, 0, 0, 0, 6, 1, 6, 0x01, 0x2D, 0xFF, 0x01,
        ]);
        assert_eq!(
            responses[0].kind,
            ResponseKind::Exception(Exception { function_code: 6, exception_code: 2 })
        );
        assert_eq!(
            responses[1].kind,
            ResponseKind::SetHolding { address: 0x12D, value: 0xFF01 }
        );
    }

    #[test]
    fn waits_for_complete_frames() {
        let mut codec = ModbusTCPCodec {};
        let mut buffer = BytesMut::from(&[0u8, 9, 0, 0, 0, 5, 1, 3][..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&[2, 0, 42]);
        let response = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.kind, ResponseKind::GetHoldings { values: vec![42] });
        assert!(buffer.is_empty());
    }

    #[test]
    fn skips_garbage_and_unknown_functions() {
        let responses = decode_all(&[
            0xFF, // garbage
            0, 1, 0, 0, 0, 3, 1, 0x11, 0, // report server id, not supported
            0, 2, 0, 0, 0, 5, 1, 3, 2, 0, 1,
        ]);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].transaction_id, 2);
    }

    #[test]
    fn error_messages_depend_on_the_function() {
        let exception = |function_code| {
            connection::Error::Exception(Exception { function_code, exception_code: 2 })
        };
        let read = ModbusError::new("Cannot read status", 0x12B, exception(4));
        let write = ModbusError::new("Cannot power on compressor", 0x12B, exception(6));
        let other = ModbusError::new("Cannot do things", 0x12B, exception(0x10));
        assert_eq!(read.kind(), ModbusErrorKind::Read);
        assert_eq!(write.kind(), ModbusErrorKind::Write);
        assert_eq!(other.kind(), ModbusErrorKind::Function(0x10));
        assert_eq!(
            read.to_string(),
            "Cannot read status: cannot address 0x012b: illegal data address (exception code 2)"
        );
        assert_eq!(
            write.to_string(),
            "Cannot power on compressor: cannot write register address 0x012b: illegal data \
             address (exception code 2)"
        );
        assert_eq!(
            other.to_string(),
            "Cannot do things: cannot call function 16: illegal data address (exception code 2), \
             address 0x012b"
        );
        let transport = ModbusError::new("Cannot read status", 0x30, connection::Error::Closed);
        assert_eq!(transport.kind(), ModbusErrorKind::Transport);
        assert!(std::error::Error::source(&transport).is_some());
    }
}
