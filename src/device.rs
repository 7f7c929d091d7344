//! Entry points used by whatever owns the compressor's lifecycle.

use crate::connection::{self, Connector};
use crate::control::Controller;
use crate::modbus::ModbusError;
use crate::poll::{PollConfig, Poller, Session};
use crate::publish::{Lifecycle, Publisher};
use crate::records::{ConnectionStatus, Record};
use crate::telemetry::TelemetryReader;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot establish connection to {host}")]
    Connect {
        host: String,
        #[source]
        source: connection::Error,
    },
    #[error("the compressor is not connected")]
    NotConnected,
    #[error(transparent)]
    Command(#[from] ModbusError),
    #[error("the poll loop did not stop cleanly")]
    Join(#[source] tokio::task::JoinError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Idle,
    Connecting,
    Polling,
}

struct Active<T> {
    transport: Arc<T>,
    session: Session,
}

/// One compressor: its connection, its poll loop and the commands it accepts.
pub struct AirCompressor<C: Connector, P, L> {
    connector: C,
    publisher: P,
    lifecycle: L,
    config: PollConfig,
    state: SessionState,
    active: Option<Active<C::Transport>>,
}

impl<C, P, L> AirCompressor<C, P, L>
where
    C: Connector,
    P: Publisher + Clone + 'static,
    L: Lifecycle + Clone + 'static,
{
    pub fn new(connector: C, publisher: P, lifecycle: L, config: PollConfig) -> Self {
        Self { connector, publisher, lifecycle, config, state: SessionState::Idle, active: None }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connect and start polling. Does nothing if a session is already running.
    pub async fn start(&mut self, host: &str, unit: u8) -> Result<(), Error> {
        if self.active.is_some() {
            info!(message = "already polling", host, unit);
            return Ok(());
        }
        self.state = SessionState::Connecting;
        info!(message = "starting session", host, unit);
        let transport = match self.connector.connect(host, unit).await {
            Ok(transport) => Arc::new(transport),
            Err(source) => {
                self.state = SessionState::Idle;
                error!(
                    message = "cannot establish connection",
                    host,
                    error = (&source as &dyn std::error::Error)
                );
                return Err(Error::Connect { host: host.to_string(), source });
            }
        };
        self.publisher.publish(Record::ConnectionStatus(ConnectionStatus { connected: true }));
        let reader = TelemetryReader::new(Arc::clone(&transport), self.publisher.clone());
        let poller = Poller::new(reader, self.lifecycle.clone(), self.config);
        let session = Session::spawn(poller);
        self.active = Some(Active { transport, session });
        self.state = SessionState::Polling;
        Ok(())
    }

    /// Stop polling and drop the connection.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let Some(Active { transport, session }) = self.active.take() else {
            debug!(message = "no session to stop");
            return Ok(());
        };
        self.state = SessionState::Idle;
        let stopped = session.stop().await;
        drop(transport);
        self.publisher.publish(Record::ConnectionStatus(ConnectionStatus { connected: false }));
        let state = stopped.map_err(Error::Join)?;
        info!(message = "session stopped", ?state);
        Ok(())
    }

    fn controller(&self) -> Option<Controller<Arc<C::Transport>, L>> {
        let active = self.active.as_ref()?;
        Some(Controller::new(Arc::clone(&active.transport), self.lifecycle.clone()))
    }

    pub async fn power_on(&self) -> Result<(), Error> {
        let controller = self.controller().ok_or(Error::NotConnected)?;
        let start_by_remote = self.active.as_ref().and_then(|a| a.session.start_by_remote());
        if start_by_remote == Some(false) {
            warn!(message = "remote start is disabled on the compressor, it may not start");
        }
        Ok(controller.power_on().await?)
    }

    /// Stop the compressor. The session keeps running until [`Self::stop`] is called.
    pub async fn power_off(&self) -> Result<(), Error> {
        let controller = self.controller().ok_or(Error::NotConnected)?;
        Ok(controller.power_off().await?)
    }

    /// Reset latched faults. Succeeds without doing anything when there is no session.
    pub async fn reset_faults(&self) -> Result<(), Error> {
        let Some(controller) = self.controller() else {
            debug!(message = "not connected, nothing to reset");
            return Ok(());
        };
        Ok(controller.reset_faults().await?)
    }
}
