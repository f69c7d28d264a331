use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let env_filter =
		EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
	tracing_subscriber::fmt().with_target(true).with_level(true).with_env_filter(env_filter).init();

	let args = replicate_server::Args::parse();
	replicate_server::main(args).await
}
