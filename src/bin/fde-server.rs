use clap::{Parser, Subcommand};
use std::process;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fde-server")]
#[command(about = "Push-deployment server", long_about = None)]
#[command(version = VERSION)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server
    Start {
        /// Path to a YAML config file
        #[arg(long)]
        config: Option<String>,

        /// Detach from the controlling terminal (POSIX only)
        #[arg(long)]
        daemon: bool,
    },
}

fn main() {
    let args = Args::parse();

    match args.command {
        Command::Start { config, daemon } => {
            if daemon {
                #[cfg(unix)]
                daemonize();
                #[cfg(not(unix))]
                {
                    eprintln!("--daemon is only supported on POSIX platforms");
                    process::exit(1);
                }
            }

            let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
            if let Err(e) = runtime.block_on(fde::run_service(config.as_deref())) {
                eprintln!("fde-server: {e}");
                process::exit(1);
            }
        }
    }
}

#[cfg(unix)]
fn daemonize() {
    // Re-exec without --daemon, detached from the controlling terminal and
    // in a new process group, then exit the foreground process.
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    let exe = std::env::current_exe().expect("failed to resolve current executable");
    let args: Vec<String> = std::env::args().skip(1).filter(|a| a != "--daemon").collect();

    let spawned = process::Command::new(exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn();

    match spawned {
        Ok(child) => {
            println!("fde-server: started in background (pid {})", child.id());
            process::exit(0);
        }
        Err(e) => {
            eprintln!("fde-server: failed to spawn daemon process: {e}");
            process::exit(1);
        }
    }
}
