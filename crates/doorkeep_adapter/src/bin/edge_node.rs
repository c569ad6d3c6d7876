#![forbid(unsafe_code)]

use std::net::SocketAddr;

use tokio::sync::watch;
use tracing::{error, info};

use doorkeep_adapter::{build_router, init_tracing, load_dotenv, EdgeNode};
use doorkeep_node::config::NodeConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    init_tracing();

    let config = NodeConfig::from_env()?;
    let addr: SocketAddr = config.http_bind.parse()?;
    let node = EdgeNode::open(&config)?;
    info!(store = %config.store_path.display(), "local store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(node.worker.run(shutdown_rx.clone()));

    let app = build_router(node.state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "doorkeep edge node listening");
    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *server_shutdown.borrow() {
                        break;
                    }
                    if server_shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed to listen for interrupt, shutting down");
            } else {
                info!("interrupt received, shutting down");
            }
            let _ = shutdown_tx.send(true);
            (&mut server).await
        }
        joined = &mut server => {
            error!("http server exited before shutdown was requested");
            let _ = shutdown_tx.send(true);
            joined
        }
    };

    // The worker finishes its in-flight cycle before returning.
    worker.await?;
    server_result??;
    info!("doorkeep edge node stopped");
    Ok(())
}
