use std::path::Path;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::config::Config;

mod check;
mod list_sources;
mod serve;

pub use check::CheckCommand;
pub use list_sources::ListSourcesCommand;
pub use serve::ServeCommand;

#[derive(Parser, Debug)]
#[command(name = "camgate")]
#[command(about = "RTSP camera gateway with on-demand transcoding and an SSH reverse tunnel")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway and the tunnel (default)
    Serve(ServeCommand),
    /// List configured cameras and exit
    ListSources(ListSourcesCommand),
    /// Probe cameras and the transcoder, then exit
    Check(CheckCommand),
}

impl Args {
    pub async fn run(self) -> Result<()> {
        let command = self
            .command
            .unwrap_or(Command::Serve(ServeCommand::default()));

        match command {
            Command::Serve(cmd) => cmd.run().await,
            Command::ListSources(cmd) => cmd.run().await,
            Command::Check(cmd) => cmd.run().await,
        }
    }
}

/// Load the config, or write a starter one and bail so the user can fill it
/// in before the first real run.
pub fn load_or_init(path: &Path) -> Result<Config> {
    if path.exists() {
        return Config::load(path);
    }

    Config::example().save(path)?;
    bail!(
        "no config found; wrote a starter config to {} - edit it and run again",
        path.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_init_writes_starter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camgate.json");

        // First call writes the starter and errors out
        assert!(load_or_init(&path).is_err());
        assert!(path.exists());

        // Second call loads it
        let config = load_or_init(&path).unwrap();
        assert!(config.sources.contains_key("cam1"));
    }
}
