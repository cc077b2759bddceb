use clap::Parser;
use nxs_chat::AppContext;
use nxs_common::DataLayout;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod commands;
mod demo;

use cli::{Cli, Command};

const DEFAULT_FILTER: &str = "nxs_client=info,nxs_chat=info,nxs_backend=info,warn";

fn init_tracing(layout: &DataLayout) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(layout.logs_dir(), "nxs.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Command::SetRoot { path } = &cli.command {
        let layout = DataLayout::new(path);
        let root = layout.init()?;
        let saved = nxs_common::save_persistent_root(&root)?;
        println!("Data directory {} saved in {}", root.display(), saved.display());
        return Ok(());
    }

    let layout = match &cli.root {
        Some(root) => DataLayout::new(root),
        None => DataLayout::from_env(),
    };
    layout.init()?;
    let _guard = init_tracing(&layout);
    info!("[Client] data directory {:?}", layout.root());

    if let Command::Demo = cli.command {
        return demo::run(&layout).await;
    }

    let context = AppContext::hosted(layout)?;
    commands::run(&context, cli.command).await
}
