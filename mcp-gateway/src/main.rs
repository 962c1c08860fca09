use mcp_gateway::config::Config;
use mcp_gateway::lifecycle::{exit_code_for, exit_codes, Lifecycle};
use mcp_gateway::observability::init_tracing;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load configuration: {error}");
            return exit_codes::CONFIG_ERROR;
        }
    };

    init_tracing(&config);

    let lifecycle = match Lifecycle::start(config).await {
        Ok(lifecycle) => lifecycle,
        Err(error) => {
            tracing::error!(%error, "Startup aborted");
            return exit_code_for(&error);
        }
    };

    match lifecycle.run().await {
        Ok(()) => exit_codes::CLEAN,
        Err(error) => {
            tracing::error!(%error, "Gateway exited with a runtime error");
            exit_code_for(&error)
        }
    }
}
