use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use xhcid::cli::Cli;
use xhcid::xhci_backend::XhciBackend;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let backend = XhciBackend::new(&args)?;
    info!(
        "xHCI controller ready: {} regions, {} IRQs",
        backend.regions().len(),
        backend.irqs().len()
    );

    // The vfio-user transport loop is owned by the hosting VMM; it drives
    // the backend through the ServerBackend trait.
    Ok(())
}
