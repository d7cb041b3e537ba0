use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use raftfs::clerk::Clerk;
use raftfs::fs::{OpenFlags, OpenMode, SeekMode};
use raftfs::transport::TcpTransport;

/// A command-line clerk for the replicated filesystem.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Client-facing address of every server in the cluster, tried in
    /// order (and then round-robin) until one reports it's the leader.
    #[arg(long = "server", required = true)]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Mkdir { path: String },
    Open {
        path: String,
        #[arg(long, default_value = "read-write")]
        mode: ModeArg,
        #[arg(long)]
        create: bool,
        #[arg(long)]
        truncate: bool,
        #[arg(long)]
        append: bool,
        #[arg(long)]
        block: bool,
    },
    Close { fd: i64 },
    Seek {
        fd: i64,
        offset: i64,
        #[arg(long, default_value = "start")]
        whence: WhenceArg,
    },
    Read { fd: i64, num_bytes: i64 },
    Write {
        fd: i64,
        #[arg(long)]
        input: PathBuf,
    },
    Delete { path: String },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl From<ModeArg> for OpenMode {
    fn from(m: ModeArg) -> OpenMode {
        match m {
            ModeArg::ReadOnly => OpenMode::ReadOnly,
            ModeArg::WriteOnly => OpenMode::WriteOnly,
            ModeArg::ReadWrite => OpenMode::ReadWrite,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum WhenceArg {
    Start,
    Current,
    End,
}

impl From<WhenceArg> for SeekMode {
    fn from(w: WhenceArg) -> SeekMode {
        match w {
            WhenceArg::Start => SeekMode::FromBeginning,
            WhenceArg::Current => SeekMode::FromCurrent,
            WhenceArg::End => SeekMode::FromEnd,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let clerk = Clerk::new(cli.servers, Arc::new(TcpTransport::new()));

    match cli.command {
        Commands::Mkdir { path } => {
            clerk.mkdir(path).await?;
            println!("ok");
        }
        Commands::Open { path, mode, create, truncate, append, block } => {
            let mut flags = OpenFlags::empty();
            if create {
                flags |= OpenFlags::CREATE;
            }
            if truncate {
                flags |= OpenFlags::TRUNCATE;
            }
            if append {
                flags |= OpenFlags::APPEND;
            }
            if block {
                flags |= OpenFlags::BLOCK;
            }
            let fd = clerk.open(path, mode.into(), flags).await?;
            println!("fd={fd}");
        }
        Commands::Close { fd } => {
            clerk.close(fd).await?;
            println!("ok");
        }
        Commands::Seek { fd, offset, whence } => {
            let new_offset = clerk.seek(fd, offset, whence.into()).await?;
            println!("offset={new_offset}");
        }
        Commands::Read { fd, num_bytes } => {
            let (n, data) = clerk.read(fd, num_bytes).await?;
            use std::io::Write as _;
            std::io::stdout().write_all(&data)?;
            eprintln!("read {n} bytes");
        }
        Commands::Write { fd, input } => {
            let data = if input == PathBuf::from("-") {
                use std::io::Read as _;
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            } else {
                std::fs::read(&input)?
            };
            if data.is_empty() {
                bail!("nothing to write");
            }
            let n = clerk.write(fd, &data).await?;
            println!("wrote {n} bytes");
        }
        Commands::Delete { path } => {
            clerk.delete(path).await?;
            println!("ok");
        }
    }

    Ok(())
}
