//! Host binary: receives the microphone stream and renders it into the
//! configured output endpoint.
//!
//! Usage: moonmic-host [--config file.json] [--speakers] [--port N] [-v]
//!
//! Interactive commands on stdin: pause, resume, stats, quit.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use moonmic::host::HostCallbacks;
use moonmic::net::UdpEndpoint;
use moonmic::{Config, MicReceiver};

/// Loopback marker port; a second host instance fails to bind it and exits.
const INSTANCE_GUARD_PORT: u16 = 48199;

fn usage() -> ! {
    eprintln!("usage: moonmic-host [--config file.json] [--speakers] [--port N] [-v]");
    std::process::exit(2);
}

fn main() {
    let mut config_path: Option<String> = None;
    let mut speakers = false;
    let mut port_override: Option<u16> = None;
    let mut verbose = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = Some(args.next().unwrap_or_else(|| usage())),
            "--speakers" => speakers = true,
            "--port" => {
                let value = args.next().unwrap_or_else(|| usage());
                port_override = Some(value.parse().unwrap_or_else(|_| usage()));
            }
            "-v" | "--verbose" => verbose = true,
            _ => usage(),
        }
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .init();
    moonmic::set_verbose(verbose);

    // One host per machine: the ring owns the output endpoint exclusively.
    let _instance_guard =
        match UdpEndpoint::bind(([127, 0, 0, 1], INSTANCE_GUARD_PORT).into()) {
            Ok(guard) => guard,
            Err(_) => {
                error!("another moonmic-host instance is already running");
                std::process::exit(1);
            }
        };

    let mut config = match &config_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(json) => match Config::from_json(&json) {
                Ok(c) => c,
                Err(e) => {
                    error!("bad config {}: {}", path, e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                error!("cannot read {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if speakers {
        config.audio.use_speaker_mode = true;
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    info!("moonmic-host {} starting", moonmic::VERSION);

    let callbacks = HostCallbacks {
        on_error: Some(Box::new(|message| {
            error!("{}", message);
        })),
        on_status: Some(Box::new(|connected| {
            info!(
                "client {}",
                if connected { "connected" } else { "disconnected" }
            );
        })),
        // Resolution requests belong to the coexisting screen streamer; the
        // demo only acknowledges them.
        on_resolution_change: Some(Box::new(|w, h, force| {
            info!("resolution request {}x{} (force={})", w, h, force);
            false
        })),
        admission_policy: None,
    };

    let receiver = match MicReceiver::start(&config, callbacks) {
        Ok(r) => r,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "listening on {} -> output at {} Hz ({})",
        receiver.local_addr(),
        receiver.output_sample_rate(),
        if config.audio.use_speaker_mode {
            "speakers"
        } else {
            "virtual endpoint"
        }
    );
    println!("commands: pause | resume | stats | quit");

    let running = Arc::new(AtomicBool::new(true));
    let status = receiver.stats_handle();
    let status_running = running.clone();
    let status_thread = std::thread::spawn(move || {
        while status_running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(2));
            let stats = status.snapshot();
            info!(
                "rx {} pkts ({} B), drop {} / lag {}, ring {:>3.0}%, client {} {}",
                stats.packets_received,
                stats.bytes_received,
                stats.packets_dropped,
                stats.packets_dropped_lag,
                status.buffer_fill() * 100.0,
                if stats.client_name.is_empty() {
                    "-".to_string()
                } else {
                    stats.client_name.clone()
                },
                if stats.is_connected { "(up)" } else { "(down)" },
            );
        }
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match line.trim() {
            "pause" => receiver.pause(),
            "resume" => receiver.resume(),
            "stats" => println!("{:#?}", receiver.stats()),
            "quit" | "exit" => break,
            "" => {}
            other => println!("unknown command {:?}", other),
        }
    }

    running.store(false, Ordering::Relaxed);
    let _ = status_thread.join();
    info!("shutting down after {:?}", moonmic::uptime());
}
