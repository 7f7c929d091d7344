use aircompressor_tools::connection::{Config, Connection, Error, Transport};
use aircompressor_tools::publish;
use aircompressor_tools::telemetry::TelemetryReader;
use futures::future::{self, Either, Pending, Ready};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::prelude::{ExceptionCode, Request, Response};
use tokio_modbus::server::Service;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};

/// Requests for this address are never answered.
const SILENT_ADDRESS: u16 = 0x0100;
/// Requests for this address get an illegal data address exception.
const MISSING_ADDRESS: u16 = 0x0FFF;

type Answer = Result<Response, ExceptionCode>;

/// Holding registers that contain their own address until written.
#[derive(Clone, Default)]
struct Registers(Arc<Mutex<HashMap<u16, u16>>>);

impl Service for Registers {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Either<Ready<Answer>, Pending<Answer>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        let mut registers = self.0.lock().unwrap();
        let answer = match request {
            Request::ReadHoldingRegisters(SILENT_ADDRESS, _)
            | Request::WriteSingleRegister(SILENT_ADDRESS, _) => {
                return Either::Right(future::pending());
            }
            Request::ReadHoldingRegisters(MISSING_ADDRESS, _)
            | Request::WriteSingleRegister(MISSING_ADDRESS, _) => {
                Err(ExceptionCode::IllegalDataAddress)
            }
            Request::ReadHoldingRegisters(address, count) => {
                let values = (address..address + count)
                    .map(|a| registers.get(&a).copied().unwrap_or(a))
                    .collect();
                Ok(Response::ReadHoldingRegisters(values))
            }
            Request::WriteSingleRegister(address, value) => {
                registers.insert(address, value);
                Ok(Response::WriteSingleRegister(address, value))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        };
        Either::Left(future::ready(answer))
    }
}

async fn server() -> Config {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let registers = Registers::default();
    tokio::spawn(async move {
        let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
            let registers = registers.clone();
            async move {
                accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(registers.clone())))
            }
        };
        Server::new(listener).serve(&on_connected, |_: std::io::Error| {}).await
    });
    Config {
        host: "127.0.0.1".into(),
        port,
        unit: 3,
        read_timeout: Duration::from_millis(200),
        reconnect_delay: Duration::ZERO,
        ..Config::default()
    }
}

#[tokio::test]
async fn reads_and_writes() {
    let connection = Connection::connect(server().await).await.unwrap();
    assert_eq!(connection.read_registers(0x39, 3).await.unwrap(), [0x39, 0x3A, 0x3B]);
    connection.write_register(0x12B, 0xFF01).await.unwrap();
    assert_eq!(connection.read_registers(0x12A, 2).await.unwrap(), [0x12A, 0xFF01]);
    let error = connection.read_registers(MISSING_ADDRESS, 1).await.unwrap_err();
    assert!(matches!(error, Error::Exception(e) if e.function_code == 3 && e.exception_code == 2));
    let error = connection.write_register(MISSING_ADDRESS, 1).await.unwrap_err();
    assert!(matches!(error, Error::Exception(e) if e.function_code == 6));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn reconnects_after_a_timeout() {
    let connection = Connection::connect(server().await).await.unwrap();
    let error = connection.read_registers(SILENT_ADDRESS, 1).await.unwrap_err();
    assert!(matches!(error, Error::Timeout(_)));
    assert_eq!(connection.read_registers(0x10, 2).await.unwrap(), [0x10, 0x11]);
    connection.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_get_their_own_responses() {
    let connection = Arc::new(Connection::connect(server().await).await.unwrap());
    let mut callers = tokio::task::JoinSet::new();
    for n in 0..64u16 {
        let connection = Arc::clone(&connection);
        callers.spawn(async move {
            let address = 0x200 + 4 * n;
            if n % 2 == 0 {
                let values = connection.read_registers(address, 3).await.unwrap();
                assert_eq!(values, [address, address + 1, address + 2]);
            } else {
                connection.write_register(address, n).await.unwrap();
                assert_eq!(connection.read_registers(address, 1).await.unwrap(), [n]);
            }
        });
    }
    while let Some(caller) = callers.join_next().await {
        caller.unwrap();
    }
    Arc::into_inner(connection).unwrap().close().await.unwrap();
}

#[tokio::test]
async fn decodes_status_from_the_wire() {
    let connection = Connection::connect(server().await).await.unwrap();
    let (sender, mut receiver) = publish::channel();
    let reader = TelemetryReader::new(connection, sender);
    let status = reader.read_status().await.unwrap();
    // 0x30 sets bits 4 and 5, 0x32 sets bits 1, 4 and 5.
    assert_eq!(
        status.active().collect::<Vec<_>>(),
        [
            "offLoad",
            "onLoad",
            "startAfterDryerPreRun",
            "startAfterPowerLoss",
            "startWithTimerControl",
        ]
    );
    assert_eq!(receiver.try_recv().unwrap().name(), "status");
}

#[tokio::test]
async fn refused_connection_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let config = Config { host: "127.0.0.1".into(), port, ..Config::default() };
    let error = Connection::connect(config).await.err().unwrap();
    assert!(matches!(error, Error::Connect(..)));
}
