use std::sync::Arc;

use log::{error, info, warn};
use tandem_collab::{
    Authenticator, CollabEngine, OpenAuthenticator, ServerConfig, SyncServer, TokenAuthenticator,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting Tandem sync server...");

    let config = ServerConfig::from_env();
    let authenticator: Arc<dyn Authenticator> = match std::env::var("TANDEM_TOKENS") {
        Ok(table) => {
            let tokens = TokenAuthenticator::parse(&table);
            info!("Loaded {} access tokens", tokens.len());
            Arc::new(tokens)
        }
        Err(_) => {
            warn!("TANDEM_TOKENS not set; accepting any token");
            Arc::new(OpenAuthenticator)
        }
    };

    let engine = match CollabEngine::open(config, authenticator) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Failed to open engine: {e}");
            std::process::exit(1);
        }
    };

    let server = SyncServer::new(engine.clone());
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    engine.shutdown().await;
}
