use crate::publish::Event;
use csv_core::WriteResult;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Output format. Defaults to `table`, or to `jsonl` for commands that run until interrupted.
    #[arg(long, short = 'f', value_enum)]
    format: Option<Format>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize data to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode a CSV field")]
    SerializeCsv,
    #[error("table headers must be written before any rows")]
    LateHeaders,
    #[error("a table is only printed once complete, use `--format jsonl` or `--format csv`")]
    UnboundedTable,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let format = self.format.unwrap_or(Format::Table);
        self.open(format)
    }

    /// Output for a command that never finishes on its own. Rows have to reach the writer as
    /// they come, which a table cannot do.
    pub fn to_streaming_output(self) -> Result<Output, Error> {
        let format = self.streaming_format()?;
        self.open(format)
    }

    fn streaming_format(&self) -> Result<Format, Error> {
        match self.format.unwrap_or(Format::Jsonl) {
            Format::Table => Err(Error::UnboundedTable),
            format => Ok(format),
        }
    }

    fn open(self, format: Format) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(io, format, self.output))
    }
}

pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

/// Column headers of [`Output::event`] rows.
pub const EVENT_HEADERS: [&str; 3] = ["Time", "Event", "Data"];

impl Output {
    pub fn new(io: Box<dyn std::io::Write>, format: Format, path: Option<PathBuf>) -> Self {
        let formatter = match format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Self { path, io, formatter }
    }

    pub fn table_headers(&mut self, hdrs: &[&'static str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    return Err(Error::LateHeaders);
                }
                *written_records = true;
                self.write_csv_row(hdrs)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(hdrs.to_vec());
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        // Worst case every byte is a quote that gets doubled, plus the surrounding quotes.
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (idx, value) in values.iter().enumerate() {
            if idx != 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    return Err(Error::SerializeCsv);
                };
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let inp = value.as_ref().as_bytes();
            let (WriteResult::InputEmpty, ib, ob) = writer.field(inp, &mut output) else {
                return Err(Error::SerializeCsv);
            };
            debug_assert_eq!(inp.len(), ib);
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            return Err(Error::SerializeCsv);
        };
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
                self.io.flush().map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    /// Write one published event as a `[time, name, data]` row, or a JSON object with the same
    /// keys.
    pub fn event(&mut self, event: &Event) -> Result<(), Error> {
        let payload = event.payload().map_err(Error::SerializeJson)?;
        let time = event.at.to_string();
        let name = event.name();
        self.result(
            || {
                let data = match event.record() {
                    Some(record) => record
                        .fields()
                        .into_iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(" "),
                    None => payload["message"].as_str().unwrap_or_default().to_string(),
                };
                vec![time.clone(), name.to_string(), data]
            },
            || serde_json::json!({ "time": time, "event": name, "data": payload }),
        )
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match &self.formatter {
            Formatter::Csv { written_records: _ } => {}
            Formatter::Table { comfy } => {
                writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
            }
            Formatter::Jsonl => {}
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
