use clap::Parser;

use logtap::cmd::{run_worker, Cli};
use logtap::log::init_tracing_with;

#[tokio::main]
async fn main() -> logtap::Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOGGING_LEVEL").ok());
    init_tracing_with(level.as_deref(), cli.log_json);

    let report = run_worker(&cli.event, cli.deadline_ms).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
