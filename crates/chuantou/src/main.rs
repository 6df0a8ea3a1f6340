use std::{path::PathBuf, sync::Arc};

use chuantou_client::TunnelClient;
use chuantou_core::{AppContext, info};
use chuantou_server::TunnelServer;
use clap::Parser as _;
use tracing::Level;

use crate::{
	cli::{Cli, Commands, ConfigFormat},
	conf::persistent::PersistentConfig,
};

mod cli;
mod conf;
mod log;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("CHUANTOU_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("chuantou {VER}");
		return Ok(());
	}

	let level = if cli.debug { Level::DEBUG } else { Level::INFO };
	log::init_log(level)?;

	if let Some(Commands::Init { format }) = &cli.command {
		let format = match format {
			ConfigFormat::Yaml => "yaml",
			ConfigFormat::Toml => "toml",
		};
		let path = PathBuf::from(format!("config.{format}"));
		PersistentConfig::default().export_to_file(&path, format)?;
		println!("wrote {}", path.display());
		return Ok(());
	}

	let config = PersistentConfig::load(cli.config.clone(), cli.config_dir.clone())?;

	// The optional TLS wrap needs a process-wide crypto provider.
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let ctx = Arc::new(AppContext::default());
	let signal_ctx = ctx.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!(target: "[MAIN]", "shutdown requested");
			signal_ctx.token.cancel();
		}
	});

	let result = match cli.command {
		Some(Commands::Server) => {
			info!(target: "[MAIN]", "chuantou server starting");
			let server = TunnelServer::new(ctx.clone(), config.server.to_opts()?);
			server.listen().await
		}
		Some(Commands::Client) => {
			info!(target: "[MAIN]", "chuantou client starting");
			let client = TunnelClient::new(ctx.clone(), config.client.to_opts());
			client.run().await
		}
		Some(Commands::Init { .. }) => unreachable!("handled above"),
		None => Err(eyre::eyre!("specify a subcommand: server or client")),
	};

	ctx.token.cancel();
	ctx.tasks.close();
	ctx.tasks.wait().await;

	result
}
