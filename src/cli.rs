use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// The extended-capability profile to expose to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CapProfile {
    /// USB2 + USB3 supported-protocol capabilities.
    Default,
    /// Additionally expose the vendor dual-role capability.
    Drd,
}

impl fmt::Display for CapProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Drd => write!(f, "drd"),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Attach an emulated device. Currently only `tablet` is available.
    #[arg(long = "device")]
    pub devices: Vec<String>,

    /// Pass a physical USB device through, identified as
    /// `BUS-PORT=/dev/bus/usb/...`.
    #[arg(long = "passthrough")]
    pub passthrough: Vec<String>,

    /// The extended-capability profile of the controller.
    #[arg(long, value_enum, default_value_t = CapProfile::Default)]
    pub cap: CapProfile,

    /// Host file the dual-role capability forwards mode switches to.
    /// Only meaningful together with `--cap drd`.
    #[arg(long)]
    pub drd_switch: Option<PathBuf>,

    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
