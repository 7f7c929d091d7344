#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("could not start the async runtime")]
    Build(#[source] std::io::Error),
}

fn runtime() -> Result<tokio::runtime::Runtime, RuntimeError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(RuntimeError::Build)
}

pub mod registers {
    use crate::output;
    use crate::registers::RegisterSchema;

    /// Search and output the compressor's modbus registers.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list registers whose name, group or address contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(&["Address", "Group", "Name", "Kind"])?;
        for register in RegisterSchema::all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        format!("0x{:04X}", register.address),
                        register.group.to_string(),
                        register.name.clone(),
                        register.kind.clone(),
                    ]
                },
                || &register,
            )?;
        }
        Ok(output.commit()?)
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::output::{self, EVENT_HEADERS, Output};
    use crate::publish;
    use crate::telemetry::{self, TelemetryReader};

    #[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Group {
        Status,
        ErrorsWarnings,
        Analog,
        Timers,
        Identity,
    }

    /// Read register groups from the compressor once and print the decoded records.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Groups to read. All of them by default.
        #[arg(value_enum)]
        groups: Vec<Group>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Runtime(#[from] super::RuntimeError),
        #[error("could not connect to the compressor")]
        Connect(#[source] connection::Error),
        #[error(transparent)]
        Read(#[from] telemetry::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
        #[error("could not close the connection")]
        Close(#[source] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let groups = if args.groups.is_empty() {
            vec![Group::Status, Group::ErrorsWarnings, Group::Analog, Group::Timers, Group::Identity]
        } else {
            args.groups
        };
        let config = args.connection.to_config();
        let mut output = args.output.to_output()?;
        output.table_headers(&EVENT_HEADERS)?;
        super::runtime()?.block_on(read_groups(config, &groups, &mut output))?;
        Ok(output.commit()?)
    }

    async fn read_groups(
        config: connection::Config,
        groups: &[Group],
        output: &mut Output,
    ) -> Result<(), Error> {
        let connection = Connection::connect(config).await.map_err(Error::Connect)?;
        let (sender, mut receiver) = publish::channel();
        let reader = TelemetryReader::new(connection, sender);
        for group in groups {
            match group {
                Group::Status => {
                    reader.read_status().await?;
                }
                Group::ErrorsWarnings => {
                    reader.read_errors_and_warnings().await?;
                }
                Group::Analog => {
                    reader.read_analog_data().await?;
                }
                Group::Timers => {
                    reader.read_timers().await?;
                }
                Group::Identity => {
                    reader.read_identity().await?;
                }
            }
            while let Ok(event) = receiver.try_recv() {
                output.event(&event)?;
            }
        }
        let (connection, _) = reader.into_parts();
        connection.close().await.map_err(Error::Close)
    }
}

pub mod monitor {
    use crate::connection::{self, TcpConnector};
    use crate::device::{self, AirCompressor};
    use crate::output::{self, EVENT_HEADERS, Output};
    use crate::publish::{self, Event};
    use crate::{mqtt, poll};
    use tracing::{info, warn};

    /// Poll the compressor until interrupted, printing every published record and failure.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        poll: poll::Args,
        #[clap(flatten)]
        output: output::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,
        /// Power the compressor on once connected.
        #[arg(long)]
        power_on: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Runtime(#[from] super::RuntimeError),
        #[error(transparent)]
        Device(#[from] device::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
        #[error("could not wait for the interrupt signal")]
        Signal(#[source] std::io::Error),
    }

    fn emit(
        output: &mut Output,
        mqtt: Option<&mqtt::MqttForwarder>,
        event: &Event,
    ) -> Result<(), Error> {
        output.event(event)?;
        if let Some(Err(e)) = mqtt.map(|mqtt| mqtt.forward(event)) {
            warn!(message = "could not forward to mqtt", error = (&e as &dyn std::error::Error));
        }
        Ok(())
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.clone().to_streaming_output()?;
        output.table_headers(&EVENT_HEADERS)?;
        let result = super::runtime()?.block_on(monitor(&args, &mut output));
        output.commit()?;
        result
    }

    async fn monitor(args: &Args, output: &mut Output) -> Result<(), Error> {
        let config = args.connection.to_config();
        let mqtt = args.mqtt.to_forwarder(args.connection.index());
        let (sender, mut events) = publish::channel();
        let (host, unit) = (config.host.clone(), config.unit);
        let mut device =
            AirCompressor::new(TcpConnector(config), sender.clone(), sender, args.poll.to_config());
        device.start(&host, unit).await?;
        if args.power_on {
            if let Err(e) = device.power_on().await {
                device.stop().await?;
                return Err(e.into());
            }
        }
        let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
        let interrupted = loop {
            tokio::select! {
                signal = &mut ctrl_c => break signal,
                Some(event) = events.recv() => emit(output, mqtt.as_ref(), &event)?,
            }
        };
        info!(message = "interrupted, stopping");
        let stopped = device.stop().await;
        while let Ok(event) = events.try_recv() {
            emit(output, mqtt.as_ref(), &event)?;
        }
        if let Some(mqtt) = mqtt {
            if let Err(e) = mqtt.disconnect().await {
                warn!(message = "mqtt disconnect failed", error = (&e as &dyn std::error::Error));
            }
        }
        interrupted.map_err(Error::Signal)?;
        Ok(stopped?)
    }
}

pub mod control {
    use crate::connection::{self, Connection};
    use crate::control::{Command, Controller};
    use crate::modbus::ModbusError;
    use crate::publish::TracingLifecycle;
    use tracing::info;

    /// Send a single command to the compressor.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(value_enum)]
        command: Command,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Runtime(#[from] super::RuntimeError),
        #[error("could not connect to the compressor")]
        Connect(#[source] connection::Error),
        #[error(transparent)]
        Command(#[from] ModbusError),
        #[error("could not close the connection")]
        Close(#[source] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let config = args.connection.to_config();
        super::runtime()?.block_on(execute(config, args.command))
    }

    async fn execute(config: connection::Config, command: Command) -> Result<(), Error> {
        let connection = Connection::connect(config).await.map_err(Error::Connect)?;
        let controller = Controller::new(connection, TracingLifecycle);
        controller.execute(command).await?;
        info!(message = "done", %command);
        let (connection, _) = controller.into_parts();
        connection.close().await.map_err(Error::Close)
    }
}
