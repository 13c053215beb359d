use clap::{Parser, Subcommand};
use colored::Colorize;
use fde::client::deploy::{DeployClient, DeployEvent};
use fde::client::upload::UploadClient;
use fde::client::Connection;
use fde::config::Config;
use indicatif::{ProgressBar, ProgressStyle};
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fde")]
#[command(about = "Push-deployment client", long_about = None)]
#[command(version = VERSION)]
struct Args {
    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Package the local build artifact and deploy it
    Deploy {
        /// Environment name as defined in the config file
        env: String,

        /// Skip streaming output; wait for the deploy command to finish and
        /// print its full stdout/stderr at the end
        #[arg(long)]
        no_stream: bool,
    },
    /// Check server liveness
    Ping {
        /// Environment name as defined in the config file
        env: String,
    },
    /// Check server health
    Health {
        /// Environment name as defined in the config file
        env: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "fde=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            process::exit(1);
        }
    };

    let result = match args.command {
        Command::Deploy { env, no_stream } => run_deploy(&config, &env, no_stream).await,
        Command::Ping { env } => run_ping(&config, &env).await,
        Command::Health { env } => run_health(&config, &env).await,
    };

    if let Err(e) = result {
        eprintln!("{} {e}", "error:".red().bold());
        process::exit(1);
    }
}

fn connection_for(config: &Config, env: &str) -> Result<Connection, String> {
    let env_config = config
        .environments
        .get(env)
        .ok_or_else(|| format!("unknown environment '{env}'"))?;

    let server_url = env_config
        .effective_server_url(config)
        .ok_or_else(|| format!("no serverUrl configured for '{env}'"))?
        .to_string();
    let token = env_config.effective_token(config).unwrap_or_default().to_string();

    Ok(Connection { server_url, token, env: env.to_string() })
}

async fn run_deploy(config: &Config, env: &str, no_stream: bool) -> Result<(), String> {
    let env_config = config.environments.get(env).ok_or_else(|| format!("unknown environment '{env}'"))?;
    let conn = connection_for(config, env)?;

    if let Some(build_command) = &env_config.build_command {
        println!("{} {build_command}", "building:".cyan().bold());
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(build_command)
            .current_dir(env_config.local_path.as_deref().unwrap_or_else(|| std::path::Path::new(".")))
            .status()
            .await
            .map_err(|e| format!("failed to run build command: {e}"))?;
        if !status.success() {
            return Err(format!("build command exited with status {}", status.code().unwrap_or(-1)));
        }
    }

    let local_path = env_config
        .local_path
        .as_deref()
        .ok_or_else(|| format!("no localPath configured for '{env}'"))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    spinner.set_message("packaging build artifact...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));

    let timestamp_millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| e.to_string())?
        .as_millis() as u64;
    let archive = fde::archive::build_archive(local_path, env, &env_config.exclude, timestamp_millis)
        .await
        .map_err(|e| e.to_string())?;
    spinner.finish_with_message("packaged");

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} chunks uploaded").unwrap().progress_chars("##-"),
    );

    let upload_client = UploadClient::new(conn.clone());
    let file_name = format!("{env}.zip");
    let outcome = upload_client
        .upload_file(archive.path(), &file_name, true, |done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        })
        .await
        .map_err(|e| e.to_string())?;
    bar.finish_with_message("upload complete");

    println!(
        "{} {} ({} bytes, checksum {})",
        "uploaded:".green().bold(),
        outcome.file_name,
        outcome.file_size,
        if outcome.checksum_verified { "verified".green() } else { "unverified".yellow() }
    );

    println!("{}", "running deploy command...".cyan().bold());
    let deploy_client = DeployClient::new(conn);

    if no_stream {
        let response = deploy_client.run_sync().await.map_err(|e| e.to_string())?;
        println!("{}", response.stdout);
        if !response.stderr.is_empty() {
            eprintln!("{}", response.stderr);
        }
        if !response.success {
            return Err("deploy command failed".to_string());
        }
        return Ok(());
    }

    let result = deploy_client
        .run(|event| match event {
            DeployEvent::Output { stream, data } => {
                if stream == "stderr" {
                    eprint!("{data}");
                } else {
                    print!("{data}");
                }
            }
            DeployEvent::Done { exit_code } => {
                println!("{} exit code {exit_code}", "deploy finished:".green().bold());
            }
            DeployEvent::Error { message, exit_code } => {
                eprintln!(
                    "{} {message} (exit code {})",
                    "deploy failed:".red().bold(),
                    exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
                );
            }
        })
        .await
        .map_err(|e| e.to_string())?;

    if !result.success {
        return Err(format!("deploy command exited with status {}", result.exit_code));
    }

    Ok(())
}

async fn run_ping(config: &Config, env: &str) -> Result<(), String> {
    let conn = connection_for(config, env)?;
    let url = conn.url("/ping");
    let response =
        fde::client::short_lived_client().get(&url).send().await.map_err(|e| e.to_string())?;
    let body = response.text().await.map_err(|e| e.to_string())?;
    println!("{} {body}", "ping:".cyan().bold());
    Ok(())
}

async fn run_health(config: &Config, env: &str) -> Result<(), String> {
    let conn = connection_for(config, env)?;
    let url = conn.url("/health");
    let response =
        fde::client::short_lived_client().get(&url).send().await.map_err(|e| e.to_string())?;
    let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
    println!("{} {}", "health:".cyan().bold(), serde_json::to_string_pretty(&body).unwrap_or_default());
    Ok(())
}
