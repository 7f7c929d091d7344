//! The long running poll loop of one device session.

use crate::connection::Transport;
use crate::modbus::ModbusError;
use crate::publish::{Lifecycle, Publisher};
use crate::records::{ConnectionStatus, Record};
use crate::registers::START_BY_REMOTE;
use crate::telemetry::{self, TelemetryReader};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Pause between the end of one cycle and the start of the next.
    pub period: Duration,
    /// Number of cycles between two timer reads.
    pub timer_period: i32,
    /// How long the compressor may stay unreachable before it is reported as a fault.
    /// Outages are only ever recoverable errors when unset.
    pub grace_period: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { period: Duration::from_secs(1), timer_period: 60, grace_period: None }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "poll::Args")]
pub struct Args {
    /// Time to wait after a poll cycle before starting the next one.
    #[arg(long, default_value = "1s")]
    poll_period: humantime::Duration,

    /// Read the operating hour counters every this many poll cycles.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(i32).range(0..))]
    timer_period: i32,

    /// Report a fault once the compressor has been unreachable for this long.
    #[arg(long)]
    grace_period: Option<humantime::Duration>,
}

impl Args {
    pub fn to_config(&self) -> PollConfig {
        PollConfig {
            period: *self.poll_period,
            timer_period: self.timer_period,
            grace_period: self.grace_period.map(Into::into),
        }
    }
}

/// Bookkeeping carried from one cycle to the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollCycleState {
    /// Set until the identity has been read since the last (re)connect or failure.
    pub first_run: bool,
    /// Cycles left until the next timer read.
    pub timer_countdown: i32,
}

impl PollCycleState {
    pub fn new() -> Self {
        Self { first_run: true, timer_countdown: 0 }
    }
}

impl Default for PollCycleState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
struct Outage {
    since: Instant,
    escalated: bool,
}

pub struct Poller<T, P, L> {
    reader: TelemetryReader<T, P>,
    lifecycle: L,
    config: PollConfig,
    state: PollCycleState,
    outage: Option<Outage>,
    start_by_remote: watch::Sender<Option<bool>>,
}

impl<T: Transport, P: Publisher, L: Lifecycle> Poller<T, P, L> {
    pub fn new(reader: TelemetryReader<T, P>, lifecycle: L, config: PollConfig) -> Self {
        Self {
            reader,
            lifecycle,
            config,
            state: PollCycleState::new(),
            outage: None,
            start_by_remote: watch::Sender::new(None),
        }
    }

    pub fn with_state(mut self, state: PollCycleState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> PollCycleState {
        self.state
    }

    /// When the current run of failed cycles began, if the last cycle failed.
    pub fn unreachable_since(&self) -> Option<Instant> {
        self.outage.map(|o| o.since)
    }

    /// The `startByRemote` bit of the most recent status read.
    pub fn start_by_remote(&self) -> watch::Receiver<Option<bool>> {
        self.start_by_remote.subscribe()
    }

    async fn cycle(&mut self) -> Result<(), telemetry::Error> {
        let status = self.reader.read_status().await?;
        self.start_by_remote.send_replace(status.get(START_BY_REMOTE));
        self.reader.read_errors_and_warnings().await?;
        self.reader.read_analog_data().await?;
        if self.state.first_run {
            self.reader.read_identity().await?;
            self.state.first_run = false;
        }
        if self.state.timer_countdown <= 0 {
            self.reader.read_timers().await?;
            self.state.timer_countdown = self.config.timer_period;
        } else {
            self.state.timer_countdown -= 1;
        }
        Ok(())
    }

    /// Run one cycle. Failures abort the remainder of the cycle and are reported, never returned.
    pub async fn poll_once(&mut self) {
        match self.cycle().await {
            Ok(()) => {
                trace!(message = "poll cycle done", state = ?self.state);
                if let Some(outage) = self.outage.take() {
                    let downtime = outage.since.elapsed();
                    info!(message = "compressor connection is back", ?downtime);
                    self.publish_connected(true);
                }
            }
            Err(telemetry::Error::Modbus(e)) => {
                error!(message = "poll cycle failed", error = (&e as &dyn std::error::Error));
                self.state.first_run = true;
                self.modbus_failure(&e);
            }
            Err(e) => {
                error!(
                    message = "unexpected failure in poll cycle",
                    error = (&e as &dyn std::error::Error)
                );
                self.state.first_run = true;
            }
        }
    }

    fn publish_connected(&self, connected: bool) {
        let status = ConnectionStatus { connected };
        self.reader.publisher().publish(Record::ConnectionStatus(status));
    }

    fn modbus_failure(&mut self, e: &ModbusError) {
        if self.outage.is_none() {
            warn!(
                message = "lost compressor connection, will keep trying to reconnect",
                grace_period = ?self.config.grace_period
            );
            self.publish_connected(false);
        }
        let outage =
            self.outage.get_or_insert_with(|| Outage { since: Instant::now(), escalated: false });
        let downtime = outage.since.elapsed();
        match self.config.grace_period {
            Some(grace) if downtime >= grace && !outage.escalated => {
                outage.escalated = true;
                let downtime = humantime::format_duration(Duration::from_secs(downtime.as_secs()));
                self.lifecycle.report_fault(&format!("{e} (unreachable for {downtime})"));
            }
            _ => self.lifecycle.report_recoverable_error(&e.to_string()),
        }
    }

    /// Poll until `cancel` is triggered. A cycle in progress is allowed to finish.
    pub async fn run(mut self, cancel: CancellationToken) -> PollCycleState {
        info!(message = "polling", period = ?self.config.period);
        while !cancel.is_cancelled() {
            self.poll_once().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.period) => {}
            }
        }
        info!(message = "poll loop stopped");
        self.state
    }
}

/// A poll loop running in its own task. Dropping the session aborts the task.
pub struct Session {
    cancel: CancellationToken,
    task: AbortOnDropHandle<PollCycleState>,
    start_by_remote: watch::Receiver<Option<bool>>,
}

impl Session {
    pub fn spawn<T, P, L>(poller: Poller<T, P, L>) -> Self
    where
        T: Transport + 'static,
        P: Publisher + 'static,
        L: Lifecycle + 'static,
    {
        let cancel = CancellationToken::new();
        let start_by_remote = poller.start_by_remote();
        let task = tokio::task::spawn(poller.run(cancel.clone()));
        Self { cancel, task: AbortOnDropHandle::new(task), start_by_remote }
    }

    pub fn start_by_remote(&self) -> Option<bool> {
        *self.start_by_remote.borrow()
    }

    /// Cancel the loop and wait for the cycle in progress, if any, to complete.
    pub async fn stop(self) -> Result<PollCycleState, tokio::task::JoinError> {
        let Self { cancel, task, .. } = self;
        cancel.cancel();
        task.await
    }
}
