mod bootstrap;
mod cli_args;
mod config;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::{
    build_pipeline, gateway_server_config, init_tracing, render_config_summary,
    seed_menu_payloads,
};
use crate::cli_args::Cli;
use crate::config::load_gateway_config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = load_gateway_config(&cli.config)?;
    config.apply_overrides(cli.bind.clone(), cli.state_dir.clone());
    let accounts = config.validate()?;
    if cli.check_config {
        println!("{}", render_config_summary(&config, &accounts));
        return Ok(());
    }

    let pipeline = build_pipeline(&config, &accounts)?;
    seed_menu_payloads(&config, pipeline.menu_payloads()).await?;
    mpgate_gateway::run_gateway_server(gateway_server_config(&config), pipeline).await
}
