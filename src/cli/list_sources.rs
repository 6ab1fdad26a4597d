use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::probe;

#[derive(Parser, Debug)]
pub struct ListSourcesCommand {
    /// Config file path
    #[arg(short, long, default_value = "camgate.json")]
    pub config: PathBuf,
}

impl ListSourcesCommand {
    pub async fn run(self) -> Result<()> {
        let config = super::load_or_init(&self.config)?;

        println!("Configured cameras:");
        for (id, source) in &config.sources {
            let endpoint = probe::source_endpoint(&source.rtsp_url)
                .unwrap_or_else(|| "<invalid url>".to_string());
            if source.description.is_empty() {
                println!("  {} - {} ({})", id, source.name, endpoint);
            } else {
                println!(
                    "  {} - {} ({}): {}",
                    id, source.name, endpoint, source.description
                );
            }
        }
        Ok(())
    }
}
