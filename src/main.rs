//! grow-a-reactor: ping server on the reactor runtime
//!
//! Starts a group of event loops, binds one SO_REUSEPORT listener per loop,
//! and serves the ping protocol on every accepted connection.
//!
//! Configuration via CLI arguments or TOML file.

mod config;

use config::Config;
use grow_a_reactor::protocols::ping;
use grow_a_reactor::{EventLoopGroup, ServerBootstrap};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = config.listen_addr()?;
    let loop_config = config.loop_config()?;
    let loops = config.loop_count();

    info!(
        addr = %addr,
        loops,
        max_line_length = config.max_line_length,
        recv_initial = loop_config.recv_sizing.initial_size(),
        "Starting grow-a-reactor server"
    );

    let group = EventLoopGroup::new(loops, &loop_config)?;
    group.start_all()?;

    let max_line_length = config.max_line_length;
    let bound = ServerBootstrap::new()
        .child_initializer(move |session| ping::init_pipeline(session, max_line_length))
        .bind(&group, addr)?;

    info!(addr = %bound, "Serving ping protocol");

    // Loops run on their own threads; keep the process alive.
    loop {
        std::thread::park();
    }
}
