mod node;

use anyhow::Context;
use node::ChatNode;
use peerlink::app::Args;
use peerlink::utils::log_file::FileLogLayer;
use peerlink::utils::sos::SignalOfStop;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Args::load()?;

    // Must happen before the file log layer is built.
    let data_dir = peerlink::utils::data_dir::init(settings.args.data_dir.as_deref())?;

    let filter = match settings.args.verbose {
        0 => "warn,peerlink=info",
        1 => "info",
        2 => "debug,tokio_tungstenite=info,tungstenite=info",
        _ => "trace",
    };
    let log_path = data_dir.join("logs").join("peerlink.log");
    let file_layer = FileLogLayer::new(&log_path)
        .with_context(|| format!("cannot open log file {}", log_path.display()))?;

    // stdout carries the chat; logs go to stderr and the file.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let node = ChatNode::start(&settings).await?;
    node.run(&settings.args.connect, sos).await
}
