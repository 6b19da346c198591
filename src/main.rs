// src/main.rs

use procfleet::config::loader::load_and_validate;
use procfleet::{cli, logging, run};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("procfleet-minion error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = cli::parse();
    let (file, cfg) = load_and_validate(&args)?;
    logging::init_logging(args.log_level, file.log_level.as_deref())?;
    run(args, file, cfg).await
}
