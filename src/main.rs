use anyhow::Result;
use clap::Parser;

mod auth;
mod cli;
mod config;
mod gateway;
mod pages;
mod probe;
mod relay;
mod server;
mod tunnel;

#[tokio::main]
async fn main() -> Result<()> {
    cli::Args::parse().run().await
}
