use restaurant_intake::config::IntakeConfig;
use restaurant_intake::{init_tracing, run};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match IntakeConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            std::process::exit(2);
        }
    };

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    };

    if let Err(error) = run(config, shutdown).await {
        error!(%error, "order intake stopped with an error");
        std::process::exit(1);
    }
}
