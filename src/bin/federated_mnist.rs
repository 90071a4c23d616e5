use anyhow::Result;
use clap::Parser;
use federated_mnist::{run, Arguments, MnistData};
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Arguments::parse();
    args.validate()?;

    info!("Workers: {:?}", args.workers);
    info!(
        "batch_size={} epochs={} lr={} momentum={} seed={}",
        args.batch_size, args.epochs, args.lr, args.momentum, args.seed
    );

    let data = MnistData::load(&args.data_dir).await?;

    // Training is CPU bound; keep it off the async executor.
    let summary = tokio::task::spawn_blocking(move || run(&args, &data)).await??;

    if let Some(last) = summary.tests.last() {
        info!("Final accuracy: {:.2}%", last.accuracy() * 100.0);
    }
    Ok(())
}
