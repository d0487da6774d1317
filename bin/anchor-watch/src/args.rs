//! Parses command-line arguments for the anchor-watch CLI.

use std::{fmt::Display, path::PathBuf};

use clap::{crate_version, Parser, ValueEnum};

#[derive(Debug, Parser)]
#[clap(
    name = "anchor-watch",
    about = "Watches bitcoin for side-chain checkpoints and protected staking outputs",
    version = crate_version!()
)]
pub(crate) struct Cli {
    #[arg(
        value_enum,
        help = "Which components to run: `reporter` (alias: rep), `slasher` (alias: sl), `relayer` (alias: rel) or `all`",
        default_value_t = OperationMode::All
    )]
    pub mode: OperationMode,

    #[clap(
        long,
        short = 'c',
        help = "The file containing the configuration",
        default_value = "config.toml"
    )]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OperationMode {
    /// Report the checkpoints found on bitcoin to the side-chain.
    #[clap(alias = "rep")]
    Reporter,

    /// Watch protected outputs and report unauthorized spends.
    #[clap(alias = "sl")]
    Slasher,

    /// Broadcast the side-chain's pending anchor transactions.
    #[clap(alias = "rel")]
    Relayer,

    /// Run every component.
    All,
}

impl OperationMode {
    pub(crate) const fn runs_reporter(self) -> bool {
        matches!(self, Self::Reporter | Self::All)
    }

    pub(crate) const fn runs_slasher(self) -> bool {
        matches!(self, Self::Slasher | Self::All)
    }

    pub(crate) const fn runs_relayer(self) -> bool {
        matches!(self, Self::Relayer | Self::All)
    }
}

impl Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Reporter => write!(f, "reporter"),
            OperationMode::Slasher => write!(f, "slasher"),
            OperationMode::Relayer => write!(f, "relayer"),
            OperationMode::All => write!(f, "all"),
        }
    }
}
