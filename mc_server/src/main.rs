// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. mc_protocol contributors.

use clap::Parser;
use log::error;

use mc_protocol::{Config, Engine, NullSink};

/// Legacy Minecraft protocol server: accepts connections, drives each
/// through the handshake/authenticate/play state machine, and forwards
/// decoded gameplay packets to a no-op sink (a real deployment would
/// supply its own `GameplaySink` and link against this crate as a
/// library instead of running this binary).
#[derive(Parser)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:25565")]
    bind: String,

    /// Maximum number of concurrent sessions.
    #[arg(long, default_value_t = 256)]
    max_connections: u32,

    /// Kernel submission/completion queue depth. 0 requests the engine's
    /// built-in default.
    #[arg(long, default_value_t = 0)]
    queue_depth: u32,

    /// Frame pool arena size, in frames. 0 requests the built-in
    /// default (four per connection).
    #[arg(long, default_value_t = 0)]
    frame_pool_size: u32,

    /// Minimum log level, overridden by `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> std::io::Result<()> {
    let args = Cli::parse();
    let log_level = args.log_level.parse().unwrap_or(log::LevelFilter::Info);

    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let config = Config {
        bind_addr: args.bind,
        max_connections: args.max_connections,
        queue_depth: args.queue_depth,
        frame_pool_size: args.frame_pool_size,
        log_level,
    };

    let mut engine = Engine::new(&config, NullSink).map_err(|e| {
        error!("failed to start engine: {e}");
        e
    })?;

    engine.run()
}
