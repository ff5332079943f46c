//! Client binary: streams the default microphone to a moonmic host.
//!
//! Usage: moonmic-client <host-ip> [--port N] [--liveness-port N] [--raw] [-v]

use std::time::Duration;

use log::{error, info};

use moonmic::client::ClientCallbacks;
use moonmic::{Config, MicClient};

fn usage() -> ! {
    eprintln!("usage: moonmic-client <host-ip> [--port N] [--liveness-port N] [--raw] [-v]");
    std::process::exit(2);
}

fn main() {
    let mut host_ip: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut liveness_port: Option<u16> = None;
    let mut raw = false;
    let mut verbose = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args.next().unwrap_or_else(|| usage());
                port = Some(value.parse().unwrap_or_else(|_| usage()));
            }
            "--liveness-port" => {
                let value = args.next().unwrap_or_else(|| usage());
                liveness_port = Some(value.parse().unwrap_or_else(|_| usage()));
            }
            "--raw" => raw = true,
            "-v" | "--verbose" => verbose = true,
            other if host_ip.is_none() && !other.starts_with('-') => {
                host_ip = Some(other.to_string());
            }
            _ => usage(),
        }
    }
    let host_ip = host_ip.unwrap_or_else(|| usage());

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .init();
    moonmic::set_verbose(verbose);

    let mut config = Config::default();
    config.client.host_ip = host_ip;
    if let Some(p) = port {
        config.client.port = p;
    }
    if let Some(p) = liveness_port {
        config.client.liveness_port = p;
    }
    config.audio.raw_pcm = raw;

    info!("moonmic-client {} starting", moonmic::VERSION);

    let callbacks = ClientCallbacks {
        on_error: Some(Box::new(|message| {
            error!("{}", message);
        })),
        on_status: Some(Box::new(|active| {
            info!("capture {}", if active { "started" } else { "stopped" });
        })),
    };

    let dest = format!("{}:{}", config.client.host_ip, config.client.port);
    let mut client = match MicClient::new(config, callbacks) {
        Ok(c) => c,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = client.start() {
        error!("cannot start capture: {}", e);
        std::process::exit(1);
    }

    let liveness = client.liveness();
    println!("streaming to {} (liveness on :{})", dest, client.liveness_port());

    loop {
        std::thread::sleep(Duration::from_secs(2));
        let stats = client.stats();
        info!(
            "sent {} pkts (gated {}, failed {}), host {}{}",
            stats.packets_sent,
            stats.frames_gated,
            stats.send_failures,
            if liveness.is_connected() { "up" } else { "down" },
            if liveness.is_paused() { " [paused]" } else { "" },
        );
    }
}
