use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::Level;

use ndt5_client::client::events::Event;
use ndt5_client::client::{Client, FrameObserverFactory};
use ndt5_client::locate::DEFAULT_BASE_URL;
use ndt5_client::protocol::frame::Frame;
use ndt5_client::report::{format_speed, HumanReadable, JsonLines, Quiet, Reporter, Summary};
use ndt5_client::transport::raw::RawTransport;
use ndt5_client::transport::throttle::ThrottledDialer;
use ndt5_client::transport::ws::WsTransport;
use ndt5_client::transport::{Dialer, FrameObserver, TcpDialer, TransportFactory};

const CLIENT_NAME: &str = "ndt5-client-cmd";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Protocol {
    #[value(name = "ndt5")]
    Ndt5,
    #[value(name = "ndt5+wss")]
    Ndt5Wss,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "ndt5-client", about = "Measure network performance against an NDT5 server")]
struct Args {
    /// Measurement server hostname; a nearby server is discovered when omitted
    #[arg(long)]
    hostname: Option<String>,

    /// Protocol to use
    #[arg(long, value_enum, default_value_t = Protocol::Ndt5)]
    protocol: Protocol,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Human)]
    format: Format,

    /// Base URL of the locate service
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    ns_url: String,

    /// Throttle connections to the given rate for testing (bits/sec)
    #[arg(long, default_value_t = 0)]
    throttle: u64,

    /// Time after which the test is aborted
    #[arg(long, default_value = "55s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Log ndt5 frames
    #[arg(long)]
    verbose: bool,

    /// Emit summary and errors only
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .try_init()
        .ok();

    let dialer: Arc<dyn Dialer> = if args.throttle > 0 {
        Arc::new(ThrottledDialer::new(
            Arc::new(TcpDialer::default()),
            args.throttle,
        ))
    } else {
        Arc::new(TcpDialer::default())
    };
    let transport: Arc<dyn TransportFactory> = match args.protocol {
        Protocol::Ndt5 => Arc::new(RawTransport::new(dialer)),
        Protocol::Ndt5Wss => Arc::new(WsTransport::new(dialer)),
    };

    let mut client = Client::new(CLIENT_NAME, CLIENT_VERSION, &args.ns_url)?;
    client.fqdn = args.hostname;
    client.transport = transport;
    if args.verbose {
        client.observer_factory = Box::new(VerboseObserverFactory);
    }

    let mut reporter: Box<dyn Reporter> = match (args.format, args.quiet) {
        (Format::Human, false) => Box::new(HumanReadable::new()),
        (Format::Human, true) => Box::new(Quiet::new(HumanReadable::new())),
        (Format::Json, false) => Box::new(JsonLines::new(io::stdout())),
        (Format::Json, true) => Box::new(Quiet::new(JsonLines::new(io::stdout()))),
    };

    let events = client.start().await.context("client start failed")?;
    match tokio::time::timeout(args.timeout, drain_events(events, reporter.as_mut())).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => std::process::exit(1),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            reporter.on_error("test aborted: timeout expired")?;
            std::process::exit(1);
        }
    }
}

/// Renders the event stream until the session closes it. Returns whether the
///  session finished successfully (a summary was produced and no error event
///  was seen).
async fn drain_events(
    mut events: mpsc::Receiver<Event>,
    reporter: &mut dyn Reporter,
) -> anyhow::Result<bool> {
    let mut failed = false;
    let mut summary = None;
    while let Some(event) = events.recv().await {
        match event {
            Event::Info(m) => reporter.on_info(m.trim())?,
            Event::Debug(m) => reporter.on_debug(m.trim_end())?,
            Event::Warning(e) => reporter.on_warning(&format!("{:#}", e))?,
            Event::Error(e) => {
                failed = true;
                reporter.on_error(&format!("{:#}", e))?;
            }
            Event::CurDownloadSpeed(s) => reporter.on_speed("download", &format_speed(&s))?,
            Event::CurUploadSpeed(s) => reporter.on_speed("upload", &format_speed(&s))?,
            Event::Summary(result) => summary = Some(Summary::from_result(&result)),
        }
    }
    match summary {
        Some(summary) => {
            reporter.on_summary(&summary)?;
            Ok(!failed)
        }
        None => Ok(false),
    }
}

struct VerboseObserverFactory;

impl FrameObserverFactory for VerboseObserverFactory {
    fn new_observer(&self, events: mpsc::Sender<Event>) -> Box<dyn FrameObserver> {
        Box::new(VerboseFrameObserver { events })
    }
}

/// Forwards every control-channel frame as a Debug event with a hex dump of
///  the raw wire bytes, `< ` for reads and `> ` for writes.
struct VerboseFrameObserver {
    events: mpsc::Sender<Event>,
}

impl VerboseFrameObserver {
    async fn log(&self, prefix: &str, frame: &Frame) {
        let _ = self
            .events
            .send(Event::Debug(format!(
                "{}{:?}\n{}",
                prefix,
                frame.mtype,
                hex_dump(prefix, &frame.raw)
            )))
            .await;
    }
}

#[async_trait]
impl FrameObserver for VerboseFrameObserver {
    async fn on_read(&mut self, frame: &Frame) {
        self.log("< ", frame).await;
    }

    async fn on_write(&mut self, frame: &Frame) {
        self.log("> ", frame).await;
    }
}

fn hex_dump(prefix: &str, data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for chunk in data.chunks(16) {
        out.push_str(prefix);
        for b in chunk {
            let _ = write!(out, "{:02x} ", b);
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push('|');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}
