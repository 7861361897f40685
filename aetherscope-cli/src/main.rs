//! Message printer: subscribes to game events from a capture source and
//! prints them as they decode.

mod cli;
mod conf;

use std::sync::Arc;

use aetherscope::{CaptureMode, GameEventMessage, GameEventSubscriber, Sniffer};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::conf::Conf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let conf = Conf::load(&cli)?;
    let mode: CaptureMode = conf.mode.parse()?;

    let sniffer = Arc::new(Sniffer::with_conf(mode, &conf.source, conf.sniffer.clone())?);
    let (subscriber, mut stream) = GameEventSubscriber::new();

    info!(%mode, source = %conf.source, "starting sniffer");

    let capture = {
        let sniffer = Arc::clone(&sniffer);
        tokio::spawn(async move { sniffer.start().await })
    };
    let subscription = {
        let sniffer = Arc::clone(&sniffer);
        tokio::spawn(async move { subscriber.subscribe(&sniffer).await })
    };

    let print = |label: &str, event: &GameEventMessage| {
        if conf.opcodes.is_empty() || conf.opcodes.contains(&event.opcode) {
            println!("[{label}] {event}");
        }
    };

    loop {
        tokio::select! {
            inbound = stream.ingress.recv() => match inbound {
                Some(event) => print("ingress", &event),
                None => break,
            },
            outbound = stream.egress.recv() => match outbound {
                Some(event) => print("egress", &event),
                None => break,
            },
            _ = signal::ctrl_c() => {
                info!("interrupt received, stopping sniffer");
                sniffer.stop();
                break;
            }
        }
    }

    // Closing the stream lets the subscriber drain without blocking on a
    // reader that is no longer listening.
    drop(stream);

    match capture.await? {
        Ok(reason) => info!(?reason, "sniffer finished"),
        Err(e) => warn!(error = %e, "sniffer exited with error"),
    }
    subscription.await??;

    Ok(())
}
