use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Top-level fallback token, used when an environment defines none.
    #[serde(default)]
    pub token: Option<String>,

    /// Top-level fallback server URL (client side), used when an environment
    /// defines none.
    #[serde(default, rename = "serverUrl")]
    pub server_url: Option<String>,

    #[serde(default)]
    pub environments: HashMap<String, EnvironmentConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: Byte,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// A single deployment target. Client-only and server-only fields are both
/// present on one type since client and server configs share this shape;
/// each side only reads the fields it needs.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnvironmentConfig {
    #[serde(default, rename = "serverUrl")]
    pub server_url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// Client-only: where the local build artifact lives.
    #[serde(default, rename = "localPath")]
    pub local_path: Option<PathBuf>,

    /// Server-only: where uploaded files land.
    #[serde(default, rename = "uploadPath")]
    pub upload_path: Option<PathBuf>,

    /// Server-only: the deploy command run in the config directory.
    #[serde(default, rename = "deployCommand")]
    pub deploy_command: Option<String>,

    /// Client-only: optional build step run before archiving.
    #[serde(default, rename = "buildCommand")]
    pub build_command: Option<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

impl EnvironmentConfig {
    /// Effective token: this environment's, else the top-level fallback.
    pub fn effective_token<'a>(&'a self, config: &'a Config) -> Option<&'a str> {
        self.token.as_deref().or(config.token.as_deref())
    }

    pub fn effective_server_url<'a>(&'a self, config: &'a Config) -> Option<&'a str> {
        self.server_url.as_deref().or(config.server_url.as_deref())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

fn default_max_payload_size() -> Byte {
    Byte::from_u64_with_unit(512, byte_unit::Unit::MiB).unwrap()
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if config_path.is_none() {
            #[cfg(not(debug_assertions))]
            {
                builder =
                    builder.add_source(config::File::with_name("/etc/fde/config").required(false));
            }

            #[cfg(debug_assertions)]
            {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix("FDE").separator("__"));

        let built = builder.build().map_err(|e| Error::Config {
            msg: format!("failed to load configuration: {e}"),
        })?;

        let mut config: Self = built.try_deserialize().map_err(|e| Error::Config {
            msg: format!("failed to deserialize configuration: {e}"),
        })?;

        let config_dir = config_path
            .map(|p| {
                std::path::Path::new(p)
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        for env in config.environments.values_mut() {
            if let Some(local_path) = &env.local_path {
                env.local_path = Some(absolutize(local_path, &config_dir)?);
            }
            if let Some(upload_path) = &env.upload_path {
                env.upload_path = Some(absolutize(upload_path, &config_dir)?);
            }
        }

        for (name, env) in &config.environments {
            if env.token.is_none() && config.token.is_none() {
                return Err(Error::Config {
                    msg: format!(
                        "environment '{name}' has no token configured and no top-level fallback token is set"
                    ),
                });
            }
        }

        Ok(config)
    }
}

/// Convert a relative path to absolute (against `base` if given, else cwd) and
/// canonicalize it when it already exists on disk.
fn absolutize(path: &std::path::Path, base: &std::path::Path) -> Result<PathBuf> {
    let mut absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if base.as_os_str().is_empty() {
        let cwd = std::env::current_dir().map_err(|e| Error::Config {
            msg: format!("failed to get current directory: {e}"),
        })?;
        cwd.join(path)
    } else {
        base.join(path)
    };

    if let Ok(canonical) = absolute.canonicalize() {
        absolute = canonical;
    }

    Ok(absolute)
}

impl std::fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("server_url", &self.server_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("local_path", &self.local_path)
            .field("upload_path", &self.upload_path)
            .field("deploy_command", &self.deploy_command)
            .field("build_command", &self.build_command)
            .field("exclude", &self.exclude)
            .finish()
    }
}
