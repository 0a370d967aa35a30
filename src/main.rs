use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use spx::{Connection, Error};

#[derive(Parser)]
#[command(name = "spx", about = "GDB Remote Serial Protocol client for the Spectranext RAMFS")]
struct Cli {
    /// Explicit endpoint: a serial device path, or host:port / a bare port
    /// number for TCP. Defaults to SPECTRANEXT_CLI, then USB discovery,
    /// then localhost:1337.
    #[arg(long = "port", global = true)]
    port: Option<String>,

    /// Disable transfer progress bars.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Raise log verbosity to info.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a remote directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a remote file.
    Get { remote: String, local: PathBuf },
    /// Upload a local file.
    Put { local: PathBuf, remote: String },
    /// Remove a remote file.
    Rm { path: String },
    /// Rename a remote path.
    Mv { old: String, new: String },
    /// Create a remote directory.
    Mkdir { path: String },
    /// Remove a remote directory.
    Rmdir { path: String },
    /// Reboot the device.
    Reboot,
    /// Configure the device to boot from the RAM filesystem and reset it.
    Autoboot {
        /// Stream device console output after issuing the command.
        #[arg(short = 'f', long = "follow")]
        follow: bool,
        /// Stop following after this many seconds (only with --follow).
        seconds: Option<u64>,
    },
    /// Run a shell command on the device.
    Exec {
        cmd: String,
        /// Stream device console output until the command completes.
        #[arg(short = 'f', long = "follow")]
        follow: bool,
        /// Stop following after this many seconds (only with --follow).
        seconds: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut conn = Connection::open(cli.port.as_deref(), !cli.no_progress, cli.verbose)?;

    match cli.command {
        Command::Ls { path } => {
            for entry in conn.ls(&path)? {
                println!("{} {:>10} {}", entry.kind, entry.size, entry.name);
            }
        }
        Command::Get { remote, local } => conn.get(&remote, &local)?,
        Command::Put { local, remote } => conn.put(&local, &remote)?,
        Command::Rm { path } => conn.rm(&path)?,
        Command::Mv { old, new } => conn.mv(&old, &new)?,
        Command::Mkdir { path } => conn.mkdir(&path)?,
        Command::Rmdir { path } => conn.rmdir(&path)?,
        Command::Reboot => conn.reboot()?,
        Command::Autoboot { follow, seconds } => {
            conn.autoboot()?;
            if follow {
                let cancel = install_ctrlc_flag();
                conn.follow(seconds, cancel);
            }
        }
        Command::Exec {
            cmd,
            follow,
            seconds,
        } => run_exec(&mut conn, &cmd, follow, seconds)?,
    }
    Ok(())
}

fn run_exec(
    conn: &mut Connection,
    cmd: &str,
    follow: bool,
    seconds: Option<u64>,
) -> Result<(), Error> {
    let cancel = if follow {
        install_ctrlc_flag()
    } else {
        Arc::new(AtomicBool::new(false))
    };
    conn.exec(cmd, follow, seconds, cancel)
}

/// Installs a Ctrl-C handler that flips a shared flag, observed by the
/// polling loop in follow mode; a frame already in flight is not
/// interrupted.
fn install_ctrlc_flag() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let _ = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    });
    cancel
}
