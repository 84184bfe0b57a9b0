//! Daemon command-line surface.

use clap::Parser;
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "shareboxd",
    version,
    about = "Multi-user network file-share daemon"
)]
pub struct ServerOpts {
    /// TCP port to listen on
    #[arg(default_value_t = crate::protocol::DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Root directory holding the per-user trees
    #[arg(long, default_value = "./data")]
    pub root: PathBuf,

    /// Metadata database path
    #[arg(long, default_value = "sharebox.db")]
    pub db: PathBuf,
}
