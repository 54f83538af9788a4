mod api;
mod cli;
mod config;
mod logging;
mod model;
mod orchestrator;
mod safety;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    if let Err(e) = logging::init(args.verbose) {
        eprintln!("warning: logging disabled: {e}");
    }
    let is_json = args.json;

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_json {
                if let Some(doc) = cli::json_error_document(&e) {
                    println!("{doc}");
                }
                std::process::exit(1);
            }
            Err(e)
        }
    }
}
