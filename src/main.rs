use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lanthrow::sync::{run_recv, run_send, RecvOptions, SendOptions};
use lanthrow::util::format_size;

#[derive(Parser)]
#[command(name = "lanthrow", version, about = "Throw files to a peer on your LAN")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file or a folder
    Send {
        /// File or folder to send (prompted when omitted)
        path: Option<PathBuf>,

        /// Config file [default: <config dir>/lanthrow/send.json]
        #[arg(long, env = "LANTHROW_SEND_CONFIG")]
        config: Option<PathBuf>,

        /// Parallel data connections (0 = one per CPU)
        #[arg(short = 't', long)]
        threads: Option<usize>,

        /// Block size for large files, e.g. 16MB
        #[arg(short = 's', long)]
        split_limit: Option<String>,
    },

    /// Receive into a folder
    Recv {
        /// Folder to save into (prompted when omitted)
        folder: Option<PathBuf>,

        /// Config file [default: <config dir>/lanthrow/recv.json]
        #[arg(long, env = "LANTHROW_RECV_CONFIG")]
        config: Option<PathBuf>,

        /// Connect key shown by the sender (prompted when omitted)
        #[arg(short = 'k', long)]
        key: Option<String>,

        /// Directory for in-flight blocks
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            path,
            config,
            threads,
            split_limit,
        } => {
            let report = run_send(SendOptions {
                path,
                config_path: config,
                threads,
                split_limit,
            })?;
            println!(
                "Sent {} files ({}), {} split into {} blocks",
                report.files,
                format_size(report.bytes),
                report.split_files,
                report.blocks
            );
        }
        Commands::Recv {
            folder,
            config,
            key,
            cache,
        } => {
            let report = run_recv(RecvOptions {
                folder,
                config_path: config,
                key,
                cache,
            })?;
            println!(
                "Received {} files ({}) into {}; {} directories created, {} already existed",
                report.files,
                format_size(report.bytes),
                report.apex.display(),
                report.dirs_created,
                report.dirs_skipped
            );
        }
    }

    Ok(())
}
