use log::{error, info};
use scribe_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Scribe authority on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connection(s), {} message(s)",
                stats.total_connections, stats.total_messages
            );
        }
    }
}
