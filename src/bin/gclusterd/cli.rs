use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gclusterd", author, version, about = "GPU cluster admission and placement daemon")]
pub struct GClusterd {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Validate the configuration, print the cluster inventory as JSON and exit
    #[arg(long)]
    pub check: bool,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}
