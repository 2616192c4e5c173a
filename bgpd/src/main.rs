// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use bgp_common::log::{init_file_logger, init_logger};
use bgp_peering::config::Config;
use bgp_peering::connection_tcp::{BgpConnectionTcp, TcpConnector};
use bgp_peering::fsm::{SessionFsm, SessionPolicy};
use bgp_peering::handler::LogHandler;
use bgp_peering::peering::{
    ManualStartOutcome, PeerHandle, PeerSession, Peering,
};
use clap::Parser;
use slog::{error, info, warn, Logger};
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long to wait for each peer to close its session on shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, styles = get_styles())]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Start peers with a manual start instead of an automatic start.
    #[arg(long)]
    manual: bool,

    /// Log to this file instead of stdout.
    #[arg(long)]
    log_file: Option<String>,
}

struct Peer {
    name: String,
    handle: PeerHandle<BgpConnectionTcp>,
    runner: JoinHandle<()>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = match &cli.log_file {
        Some(path) => init_file_logger(path)
            .with_context(|| format!("open log file {path}"))?,
        None => init_logger(),
    };

    let cfg = Config::load(&cli.config).with_context(|| {
        format!("load config {}", cli.config.display())
    })?;
    info!(log, "loaded {} peers", cfg.peers.len();
        "asn" => cfg.router.asn,
        "id" => cfg.router.id
    );

    let mut peers = Vec::new();
    for p in &cfg.peers {
        let session = PeerSession::from_config(&cfg.router, p)
            .with_context(|| format!("peer {}", p.name))?;
        let mut peering = Peering::new(
            session,
            SessionFsm::new(SessionPolicy::from(p)),
            TcpConnector::new(log.clone()),
            LogHandler::new(log.clone()),
            Duration::from_millis(p.resolution),
            log.clone(),
        );
        let handle = peering.handle();
        let runner = std::thread::Builder::new()
            .name(format!("peer-{}", p.name))
            .spawn(move || peering.run())
            .with_context(|| format!("spawn peer {}", p.name))?;
        peers.push(Peer {
            name: p.name.clone(),
            handle,
            runner,
        });
    }

    for peer in &peers {
        start(&log, peer, cli.manual);
    }

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        // A second signal while shutting down has nowhere to go
        let _ = stop_tx.send(());
    })
    .context("set termination handler")?;
    stop_rx.recv().context("wait for termination")?;

    info!(log, "shutting down");
    for peer in &peers {
        stop(&log, peer);
    }
    for peer in peers {
        if peer.runner.join().is_err() {
            error!(log, "peer {} thread panicked", peer.name);
        }
    }
    Ok(())
}

fn start(log: &Logger, peer: &Peer, manual: bool) {
    if !manual {
        if let Err(e) = peer.handle.automatic_start(false) {
            error!(log, "peer {}: automatic start: {e}", peer.name);
        }
        return;
    }
    match peer.handle.manual_start(false) {
        Ok(ManualStartOutcome::Started) => {
            info!(log, "peer {} started", peer.name)
        }
        Ok(outcome) => {
            warn!(log, "peer {} not started: {outcome:?}", peer.name)
        }
        Err(e) => error!(log, "peer {}: manual start: {e}", peer.name),
    }
}

fn stop(log: &Logger, peer: &Peer) {
    match peer.handle.manual_stop() {
        Ok(signal) => {
            if !signal.wait(STOP_TIMEOUT) {
                warn!(log, "peer {} did not stop in time", peer.name);
            }
        }
        Err(e) => warn!(log, "peer {}: manual stop: {e}", peer.name),
    }
    if let Err(e) = peer.handle.shutdown() {
        warn!(log, "peer {}: shutdown: {e}", peer.name);
    }
}

/// Oxide themed CLI ;)
pub fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(anstyle::Style::new().bold().underline().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(245, 207, 101)),
        )))
        .literal(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151)),
        )))
        .invalid(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151)),
        )))
        .valid(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(72, 213, 151)),
        )))
        .usage(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(245, 207, 101)),
        )))
        .error(anstyle::Style::new().bold().fg_color(Some(
            anstyle::Color::Rgb(anstyle::RgbColor(232, 104, 134)),
        )))
}
