use clap::Parser;

use sheet_insights::app;
use sheet_insights::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::parse();
    app::run(config).await?;

    Ok(())
}
