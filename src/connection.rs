use crate::modbus::{self, Exception, ModbusTCPCodec, Operation, Request, Response, ResponseKind};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_PORT: u16 = 502;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` did not complete in {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("not connected, next connection attempt in {0:?}")]
    Disconnected(Duration),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("the device closed the connection")]
    Closed,
    #[error("device responded with {0}")]
    Exception(Exception),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("the connection worker has stopped")]
    WorkerStopped(#[source] tokio::task::JoinError),
}

impl Error {
    /// Whether the TCP stream must be dropped and re-established after this error.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::Receive(_) | Error::Send(_) | Error::Timeout(_) | Error::Closed)
    }
}

/// Register access primitives of a Modbus device.
///
/// All the calls made through one implementation are expected to be serialized onto the
/// underlying link: a request is never interleaved with another.
pub trait Transport: Send + Sync {
    fn read_registers(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send;

    fn write_register(&self, address: u16, value: u16)
    -> impl Future<Output = Result<(), Error>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn read_registers(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, Error>> + Send {
        (**self).read_registers(address, count)
    }

    fn write_register(
        &self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).write_register(address, value)
    }
}

/// Establishes a [`Transport`] to a device.
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    fn connect(
        &self,
        host: &str,
        unit: u8,
    ) -> impl Future<Output = Result<Self::Transport, Error>> + Send;
}

impl<C: Connector> Connector for Arc<C> {
    type Transport = C::Transport;

    fn connect(
        &self,
        host: &str,
        unit: u8,
    ) -> impl Future<Output = Result<Self::Transport, Error>> + Send {
        (**self).connect(host, unit)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// The Modbus unit identifier of the compressor.
    pub unit: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Minimum time between two connection attempts after the connection has been lost.
    pub reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            unit: 1,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Host name of the compressor with the given index on the observatory network.
pub fn default_host(index: u8) -> String {
    format!("m1m3cam-aircomp{index:02}.cp.lsst.org")
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Index of the compressor.
    ///
    /// Determines the default host name and Modbus unit.
    #[arg(long, default_value = "1")]
    index: u8,

    /// Host name of the compressor's Modbus TCP interface.
    ///
    /// Defaults to `m1m3cam-aircompNN.cp.lsst.org`, where NN is the compressor index.
    #[arg(long)]
    host: Option<String>,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// The Modbus unit identifier. Defaults to the compressor index.
    #[arg(long, short = 'u')]
    unit: Option<u8>,

    /// Give up on establishing a TCP connection after this amount of time.
    #[arg(long, default_value = "3s")]
    connect_timeout: humantime::Duration,

    /// If the Modbus response isn't received in this amount of time, consider the request failed
    /// and the connection lost.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// Wait at least this long between attempts to re-establish a lost connection.
    #[arg(long, default_value = "5s")]
    reconnect_delay: humantime::Duration,
}

impl Args {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn to_config(&self) -> Config {
        Config {
            host: self.host.clone().unwrap_or_else(|| default_host(self.index)),
            port: self.port,
            unit: self.unit.unwrap_or(self.index),
            connect_timeout: *self.connect_timeout,
            read_timeout: *self.read_timeout,
            reconnect_delay: *self.reconnect_delay,
        }
    }
}

#[derive(Default)]
struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Result<Response, Error>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    fn complete(&self, transaction_id: u16, outcome: Result<Response, Error>) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, outcome);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    fn take(&self, transaction_id: u16) -> Option<Result<Response, Error>> {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&transaction_id)
    }

    async fn wait_for(&self, transaction_id: u16) -> Result<Response, Error> {
        loop {
            let mut notified = std::pin::pin!(self.change_notify.notified());
            // Register interest before checking so a completion in between is not missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.take(transaction_id) {
                return outcome;
            }
            notified.await;
        }
    }
}

/// A Modbus TCP connection to one device.
///
/// Requests from all clones of an `Arc<Connection>` go through one queue and are executed one at
/// a time by a single worker task that owns the socket.
pub struct Connection {
    request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    worker: tokio::task::JoinHandle<Result<(), Error>>,
    response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    unit: u8,
}

impl Connection {
    /// Connect to the device. Fails if the initial connection cannot be established.
    pub async fn connect(config: Config) -> Result<Connection, Error> {
        let response_tracker = Arc::new(ResponseTracker::default());
        let mut worker = TcpWorker {
            next_connect: Instant::now(),
            config: config.clone(),
            responses: Arc::clone(&response_tracker),
        };
        let io = worker.connect().await?;
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        Ok(Self {
            request_queue,
            worker: tokio::task::spawn(worker.main_loop(jobs, io)),
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            unit: config.unit,
        })
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn send(&self, operation: Operation) -> Result<Response, Error> {
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { device_id: self.unit, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        self.response_tracker.wait_for(transaction_id).await
    }

    /// Stop accepting requests and close the socket once the queued requests are done.
    pub async fn close(self) -> Result<(), Error> {
        let Self { request_queue, worker, .. } = self;
        drop(request_queue);
        worker.await.map_err(Error::WorkerStopped)?
    }
}

impl Transport for Connection {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        let response = self.send(Operation::GetHoldings { address, count }).await?;
        match response.kind {
            ResponseKind::GetHoldings { values } => Ok(values),
            ResponseKind::Exception(e) => Err(Error::Exception(e)),
            ResponseKind::SetHolding { .. } => {
                Err(Error::UnexpectedResponse("write acknowledgement to a read request"))
            }
        }
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), Error> {
        let response = self.send(Operation::SetHolding { address, value }).await?;
        match response.kind {
            ResponseKind::SetHolding { address: a, value: v } if a == address && v == value => Ok(()),
            ResponseKind::SetHolding { .. } => {
                Err(Error::UnexpectedResponse("write acknowledgement does not echo the request"))
            }
            ResponseKind::Exception(e) => Err(Error::Exception(e)),
            ResponseKind::GetHoldings { .. } => {
                Err(Error::UnexpectedResponse("register values in response to a write"))
            }
        }
    }
}

/// Connects over Modbus TCP using the port and timeouts of the wrapped [`Config`].
#[derive(Clone, Debug)]
pub struct TcpConnector(pub Config);

impl Connector for TcpConnector {
    type Transport = Connection;

    async fn connect(&self, host: &str, unit: u8) -> Result<Connection, Error> {
        Connection::connect(Config { host: host.to_string(), unit, ..self.0.clone() }).await
    }
}

struct TcpWorker {
    config: Config,
    responses: Arc<ResponseTracker>,
    next_connect: Instant,
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

impl TcpWorker {
    async fn main_loop(
        mut self,
        mut jobs: UnboundedReceiver<modbus::Request>,
        io: TcpIo,
    ) -> Result<(), Error> {
        let mut io = Some(io);
        while let Some(request) = jobs.recv().await {
            if io.is_none() {
                match self.reconnect().await {
                    Ok(framed) => io = Some(framed),
                    Err(e) => {
                        debug!(
                            message = "request failed without a connection",
                            transaction = request.transaction_id,
                            error = (&e as &dyn std::error::Error)
                        );
                        self.responses.complete(request.transaction_id, Err(e));
                        continue;
                    }
                }
            }
            let outcome = match &mut io {
                Some(framed) => self.exchange(framed, request).await,
                None => Err(Error::Disconnected(Duration::ZERO)),
            };
            if let Err(e) = &outcome {
                if e.is_connection_lost() && io.take().is_some() {
                    warn!(
                        message = "lost the connection, will reconnect",
                        error = (e as &dyn std::error::Error)
                    );
                }
            }
            self.responses.complete(request.transaction_id, outcome);
        }
        if let Some(mut framed) = io {
            framed.close().await.map_err(Error::Shutdown)?;
        }
        info!(message = "connection closed", address = %self.config.address());
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<TcpIo, Error> {
        let now = Instant::now();
        if now < self.next_connect {
            return Err(Error::Disconnected(self.next_connect - now));
        }
        self.connect().await
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        self.next_connect = Instant::now() + self.config.reconnect_delay;
        let address = self.config.address();
        info!(message = "connecting...", %address);
        let attempt = async {
            let addresses = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
                .await
                .map_err(|e| Error::LookupHost(e, address.clone()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            TcpStream::connect(&*addresses).await.map_err(|e| Error::Connect(e, address.clone()))
        };
        let socket = tokio::time::timeout(self.config.connect_timeout, attempt)
            .await
            .map_err(|_| Error::ConnectTimeout(address.clone(), self.config.connect_timeout))??;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected", %address);
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }

    async fn exchange(&self, io: &mut TcpIo, request: Request) -> Result<Response, Error> {
        io.send(request).await.map_err(Error::Send)?;
        let deadline = Instant::now() + self.config.read_timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, io.next())
                .await
                .map_err(|_| Error::Timeout(self.config.read_timeout))?;
            let response = match next {
                None => return Err(Error::Closed),
                Some(response) => response.map_err(Error::Receive)?,
            };
            if response.transaction_id == request.transaction_id {
                trace!(message = "decoded a response", transaction = response.transaction_id);
                return Ok(response);
            }
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id
            );
        }
    }
}
