use clap::Parser;
use netfs::DISK_SIZE;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Serves a block-addressed file store over TCP")]
pub struct Cli {
    /// Port to listen on, 0 picks a free one
    #[arg(default_value_t = 0)]
    pub port: u16,

    /// Disk image backing the file store
    #[arg(long, short, default_value = "disk.img")]
    pub disk: PathBuf,

    /// Number of blocks in the disk image
    #[arg(long, short, default_value_t = DISK_SIZE)]
    pub blocks: usize,

    /// Format the disk image even if it already exists
    #[arg(long)]
    pub format: bool,

    /// Serve at most this many connections at once; unlimited when unset
    #[arg(long)]
    pub max_connections: Option<usize>,
}
