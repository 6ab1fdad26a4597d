use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::probe;

#[derive(Parser, Debug)]
pub struct CheckCommand {
    /// Config file path
    #[arg(short, long, default_value = "camgate.json")]
    pub config: PathBuf,
}

impl CheckCommand {
    pub async fn run(self) -> Result<()> {
        let config = super::load_or_init(&self.config)?;

        if probe::check_transcoder(&config.transcoder).await {
            println!("Transcoder '{}' is available", config.transcoder);
        } else {
            eprintln!("Transcoder '{}' is not available", config.transcoder);
        }

        let reachable = probe::check_sources(&config).await;
        println!(
            "{}/{} camera(s) reachable",
            reachable.len(),
            config.sources.len()
        );
        Ok(())
    }
}
