//! coldhaul — resumable multipart uploads of very large files to cold storage.

use clap::Parser;
use coldhaul::backend::{B2Backend, Backend, GlacierBackend};
use coldhaul::config::{Cli, Service};
use coldhaul::engine::{self, UploadOptions};
use coldhaul::session::FileDescriptor;
use coldhaul::store::StateStore;
use std::error::Error;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Priority: RUST_LOG > --verbose/--quiet > default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("coldhaul=debug")
        } else if cli.quiet {
            EnvFilter::new("coldhaul=error")
        } else {
            EnvFilter::new("coldhaul=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
        .and_then(|runtime| runtime.block_on(run(cli)));

    if let Err(err) = result {
        eprintln!("coldhaul: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    cli.validate_paths()?;
    let file = FileDescriptor::probe(&cli.file).await?;
    info!(
        file = %file.path.display(),
        size = file.size,
        service = ?cli.service,
        "starting upload"
    );

    let backend: Arc<dyn Backend> = match cli.service {
        Service::Aws => Arc::new(GlacierBackend::new(cli.glacier_options()?)?),
        Service::B2 => Arc::new(B2Backend::connect(cli.b2_options()?).await?),
    };
    let store = StateStore::new(&cli.work);

    engine::run(
        backend,
        store,
        file,
        UploadOptions {
            concurrency: cli.concurrency,
            force: cli.force,
            quiet: cli.quiet,
        },
    )
    .await?;
    Ok(())
}
