//! bus_probe - log the metadata of frames flowing through a bus endpoint
//!
//! Connects to a publisher (normally `tcp://host:port`) and prints one line
//! per frame. Useful to check a running pipeline from another process.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frame_pipeline::bus::{BusContext, SocketOptions, Subscriber};
use frame_pipeline::wire::{ConvertedFrameMetadata, FrameMetadata};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Stream {
    /// Frames as published by a source.
    Raw,
    /// Frames as published by the format adapter.
    Converted,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Log frame metadata from a bus endpoint")]
struct Args {
    /// Publisher endpoint to connect to.
    #[arg(long, env = "PIPELINE_PROBE_ENDPOINT", default_value = "tcp://127.0.0.1:5555")]
    endpoint: String,

    /// Topic prefix to subscribe to ("" receives everything).
    #[arg(long, default_value = "")]
    topic: String,

    /// Which metadata record the frames carry.
    #[arg(long, value_enum, default_value_t = Stream::Raw)]
    stream: Stream,

    /// Exit after this many frames.
    #[arg(long)]
    count: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let ctx = BusContext::new();
    let subscriber = Subscriber::connect(&ctx, &args.endpoint, SocketOptions::default())
        .with_context(|| format!("cannot connect to {}", args.endpoint))?;
    subscriber.subscribe(args.topic.clone());

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("error setting Ctrl-C handler")?;

    log::info!("bus_probe listening on {} ({:?})", args.endpoint, args.stream);
    let mut seen = 0u64;
    while running.load(Ordering::SeqCst) {
        let Some(msg) = subscriber.receive(Duration::from_millis(500))? else {
            continue;
        };
        let topic = String::from_utf8_lossy(&msg.topic).into_owned();
        let (meta, payload) = msg
            .into_frame()
            .ok_or_else(|| anyhow!("message on {:?} is not a frame", topic))?;
        match args.stream {
            Stream::Raw => match FrameMetadata::decode(&meta) {
                Ok(meta) => log::info!(
                    "[{}] {} #{} {}x{} {} pad={} errors={} bytes={}",
                    topic,
                    meta.device_id,
                    meta.sequence_id,
                    meta.width,
                    meta.height,
                    meta.pixel_encoding()
                        .map(|enc| enc.name().to_string())
                        .unwrap_or_else(|| format!("{:#010x}", meta.encoding)),
                    meta.row_padding,
                    meta.error_count,
                    payload.len()
                ),
                Err(e) => log::warn!("[{}] undecodable metadata: {}", topic, e),
            },
            Stream::Converted => match ConvertedFrameMetadata::decode(&meta) {
                Ok(meta) => log::info!(
                    "[{}] {} #{} {}x{} {:?} errors={} bytes={}",
                    topic,
                    meta.device_id,
                    meta.sequence_id,
                    meta.width,
                    meta.height,
                    meta.channel_layout,
                    meta.error_count,
                    payload.len()
                ),
                Err(e) => log::warn!("[{}] undecodable metadata: {}", topic, e),
            },
        }
        seen += 1;
        if args.count.is_some_and(|count| seen >= count) {
            break;
        }
    }
    subscriber.close();
    log::info!("bus_probe done ({} frames)", seen);
    Ok(())
}
