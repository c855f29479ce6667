use std::error::Error;
use std::fs::OpenOptions;
use std::io::{self, Write};

use clap::Parser;
use log::info;
use netfs::io::{FileBlockEmulator, FileBlockEmulatorBuilder};
use netfs::FileServer;
use netfs_server::cli::Cli;
use netfs_server::Server;

fn open_file_server(cli: &Cli) -> Result<FileServer<FileBlockEmulator>, Box<dyn Error>> {
    let format = cli.format || !cli.disk.exists();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&cli.disk)?;
    let dev = FileBlockEmulatorBuilder::from(file)
        .with_block_count(cli.blocks)
        .clear_medium(format)
        .build()?;

    if format {
        info!("formatting {} with {} blocks", cli.disk.display(), cli.blocks);
        Ok(FileServer::format(dev)?)
    } else {
        info!("mounting {}", cli.disk.display());
        Ok(FileServer::mount(dev)?)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let fs = open_file_server(&cli)?;
    info!("{} blocks free", fs.free_blocks().available());

    let server = Server::bind(("0.0.0.0", cli.port), fs)?.with_max_connections(cli.max_connections);
    let port = server.local_addr()?.port();
    println!("\n@@@ port {}", port);
    io::stdout().flush()?;

    server.run()?;
    Ok(())
}
