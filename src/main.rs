use std::str::FromStr;
use std::sync::Arc;

use linecached::config::Config;
use linecached::listener::Server;
use linecached::memcache::MemoryCache;

const DEFAULT_CONFIG_PATH: &str = "linecached.toml";

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // No config file at the default path is fine; anything else
            // (unreadable, malformed) at an explicitly-given path is not.
            if std::path::Path::new(&config_path).exists() || config_path != DEFAULT_CONFIG_PATH {
                eprintln!("{e}");
                std::process::exit(1);
            }
            Config::default()
        }
    };

    init_logging(&config.log_level);
    linecached::config::set(config.clone());

    log::info!(
        "starting linecached v{} with {} worker threads",
        env!("CARGO_PKG_VERSION"),
        num_cpus::get()
    );

    let cache = Arc::new(MemoryCache::new());
    let addr = config.addr();
    let server = match Server::bind(&config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("could not bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    let shutdown_handle = server.handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown requested, draining connections");
        shutdown_handle.stop().await;
    });

    server.serve(&config, cache).await;
}

fn init_logging(level: &str) {
    let filter = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::new().filter_level(filter).init();
}
