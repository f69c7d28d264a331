use clap::Parser;
use color_eyre::Result;
use replicate_client::Client;
use replicate_common::dobj::{Backing, Room};
use replicate_common::path::Path;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	#[clap(long)]
	url: Url,
	#[clap(long)]
	username: String,
	#[clap(long, default_value = "lobby")]
	room: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let env_filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();

	tracing_subscriber::fmt()
		.with_target(true)
		.with_level(true)
		.with_env_filter(env_filter)
		.init();

	let args = Args::parse();

	let client = Client::new(args.url);
	client.authenticate(args.username.clone(), "dev-token");

	let room_path = Path::root().child(1, &args.room);
	let room = client.resolve::<Room>(room_path, Backing::Server);
	room.listen(|r| {
		r.chat.on_receive(|msg| info!(sender = %msg.sender, text = %msg.text, "chat"));
	});

	tokio::time::sleep(std::time::Duration::from_secs(2)).await;
	info!(state = ?room.state(), name = %room.with(|r| r.name.current().clone()), "resolved room");

	let post = Room::encode_chat_post(format!("hello from {}", args.username));
	room.post_queue(post);
	info!("sent chat post");

	Ok(())
}
