//! flowscope: passive protocol analyzer.
//!
//! Reads packets from a pcap file (`-r`) or a live interface (`-i`), runs
//! them through the flowscope-core pipeline, and writes one JSON record per
//! transaction to stdout or a file.
//!
//! Run: RUST_LOG=info flowscope -r traffic.pcap -o transactions.jsonl

use flowscope_core::{load_config, Config, JsonlSink, LinkType, Runtime, Sink, STATS};

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

const EXIT_CONFIG: i32 = 2;
const EXIT_CAPTURE: i32 = 3;
const EXIT_SINK: i32 = 4;

#[derive(Parser, Debug)]
#[clap(name = "flowscope", about = "Passive application-layer traffic analyzer")]
struct Args {
    /// Configuration file (TOML). Defaults enable all protocols on their
    /// well-known ports.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
    /// Replay a pcap file instead of capturing live.
    #[clap(short = 'r', long, parse(from_os_str), value_name = "FILE")]
    read_file: Option<PathBuf>,
    /// Capture from this interface (default: first usable device).
    #[clap(short, long, value_name = "IFACE", conflicts_with = "read_file")]
    interface: Option<String>,
    /// Write records here instead of stdout.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    outfile: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("configuration error: {}", e);
                process::exit(EXIT_CONFIG);
            }
        },
        None => Config::default(),
    };
    if args.read_file.is_some() {
        // offline replay must be deterministic; no wall-clock ticks
        config.runtime.tick = false;
    }

    let writer: Box<dyn Write + Send> = match &args.outfile {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(e) => {
                log::error!("cannot create {:?}: {}", path, e);
                process::exit(EXIT_CONFIG);
            }
        },
        None => Box::new(io::stdout()),
    };
    let sink: Box<dyn Sink> = Box::new(JsonlSink::new(writer));

    let runtime = match Runtime::new(config, sink) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("configuration error: {:#}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    let result = match &args.read_file {
        Some(path) => replay(&runtime, path),
        None => live(&runtime, args.interface.as_deref()),
    };

    runtime.shutdown();
    STATS.log_summary();

    if let Err(e) = result {
        log::error!("capture failed: {:#}", e);
        process::exit(EXIT_CAPTURE);
    }
    if STATS.events_lost_sink.get() > 0 {
        log::error!(
            "{} events lost to sink delivery failures",
            STATS.events_lost_sink.get()
        );
        process::exit(EXIT_SINK);
    }
}

fn ts_millis(header: &pcap::PacketHeader) -> u64 {
    header.ts.tv_sec as u64 * 1000 + header.ts.tv_usec as u64 / 1000
}

fn replay(runtime: &Runtime, path: &Path) -> Result<()> {
    let mut cap = pcap::Capture::from_file(path)
        .with_context(|| format!("cannot open pcap file {:?}", path))?;
    let link = LinkType::from_dlt(cap.get_datalink().0)
        .map_err(|e| anyhow!("unsupported capture link type: {}", e))?;

    let mut frames = 0u64;
    while let Ok(pkt) = cap.next() {
        runtime.deliver(ts_millis(pkt.header), link, pkt.data);
        frames += 1;
    }
    log::info!("replayed {} frames from {:?}", frames, path);
    Ok(())
}

fn live(runtime: &Runtime, interface: Option<&str>) -> Result<()> {
    let device = match interface {
        Some(name) => name.to_string(),
        None => pcap::Device::lookup().context("no capture device available")?.name,
    };
    log::info!("capturing on {}", device);

    let mut cap = pcap::Capture::from_device(device.as_str())
        .with_context(|| format!("cannot open device {}", device))?
        .promisc(true)
        .snaplen(65535)
        .timeout(1000)
        .open()
        .context("cannot activate capture")?;
    let link = LinkType::from_dlt(cap.get_datalink().0)
        .map_err(|e| anyhow!("unsupported capture link type: {}", e))?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::Relaxed);
    })
    .context("cannot install signal handler")?;

    while !stop.load(Ordering::Relaxed) {
        match cap.next() {
            Ok(pkt) => runtime.deliver(ts_millis(pkt.header), link, pkt.data),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(e).context("capture read failed"),
        }
    }
    log::info!("shutting down");
    Ok(())
}
