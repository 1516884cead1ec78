use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(short, long, help = "Listen address, overrides the config file value")]
    pub listen: Option<String>,
    #[clap(short, long, help = "Path to an explicit config file")]
    pub config: Option<PathBuf>,
    #[clap(long, help = "Verbose file logging under the state directory")]
    pub debug: bool,
}
