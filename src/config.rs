//! CLI surface and configuration resolution.
//!
//! Flags always win; credentials fall back to the conventional environment
//! variables when omitted (`AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`/
//! `AWS_REGION` for Glacier, `B2_ACCOUNT_ID`/`B2_APPLICATION_KEY`/
//! `B2_BUCKET_ID` for B2).

use crate::backend::{B2Options, GlacierOptions};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version string including build timestamp for --version output
pub fn version_long() -> &'static str {
    // e.g. "0.4.1 (built 2026-07-30T21:40:07Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("CH_BUILD_TIME"),
        )
    })
}

/// Target cold-storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Service {
    /// AWS S3 Glacier vaults
    Aws,
    /// Backblaze B2 buckets
    B2,
}

/// coldhaul — resumable multipart uploads of very large files to cold storage
#[derive(Parser, Debug)]
#[command(name = "coldhaul")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
pub struct Cli {
    /// File to upload
    #[arg(long, value_name = "PATH")]
    pub file: PathBuf,

    /// Working directory for session state; must be exclusive to this upload
    #[arg(long, value_name = "DIR")]
    pub work: PathBuf,

    /// Target service
    #[arg(long, value_enum)]
    pub service: Service,

    /// Maximum concurrent part uploads
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub concurrency: usize,

    /// Disable the progress bar
    #[arg(long)]
    pub quiet: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Resume even if the file's modification time changed since the
    /// session was created
    #[arg(long)]
    pub force: bool,

    /// AWS region (aws)
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// AWS access key id (aws)
    #[arg(long, value_name = "KEY")]
    pub access: Option<String>,

    /// AWS secret access key (aws)
    #[arg(long, value_name = "SECRET")]
    pub secret: Option<String>,

    /// Glacier vault name (aws)
    #[arg(long, value_name = "VAULT")]
    pub vault: Option<String>,

    /// B2 account id (b2)
    #[arg(long, value_name = "ACCOUNT")]
    pub account: Option<String>,

    /// B2 application key (b2)
    #[arg(long, value_name = "APPKEY")]
    pub key: Option<String>,

    /// B2 bucket id (b2)
    #[arg(long, value_name = "BUCKET")]
    pub bucket: Option<String>,
}

/// Startup configuration failures; all fatal before any upload work begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--{flag} is required for --service {service} (or set {env})")]
    MissingOption {
        flag: &'static str,
        env: &'static str,
        service: &'static str,
    },

    #[error("--file {0}: not a regular file")]
    NotAFile(String),

    #[error("--work {0}: not a directory")]
    NotADirectory(String),

    #[error("--file {0}: {1}")]
    FileUnreadable(String, #[source] std::io::Error),
}

impl Cli {
    /// Validate the local filesystem inputs before touching the network.
    pub fn validate_paths(&self) -> Result<(), ConfigError> {
        match std::fs::metadata(&self.file) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(ConfigError::NotAFile(display(&self.file))),
            Err(e) => return Err(ConfigError::FileUnreadable(display(&self.file), e)),
        }
        if !self.work.is_dir() {
            return Err(ConfigError::NotADirectory(display(&self.work)));
        }
        Ok(())
    }

    /// Resolve Glacier options from flags and environment.
    pub fn glacier_options(&self) -> Result<GlacierOptions, ConfigError> {
        Ok(GlacierOptions {
            region: flag_or_env(&self.region, "AWS_REGION").ok_or(
                ConfigError::MissingOption {
                    flag: "region",
                    env: "AWS_REGION",
                    service: "aws",
                },
            )?,
            // Missing credentials are diagnosed by the backend so the error
            // can name both sourcing mechanisms.
            access_key: flag_or_env(&self.access, "AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_key: flag_or_env(&self.secret, "AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            vault: flag_or_env(&self.vault, "AWS_VAULT").ok_or(ConfigError::MissingOption {
                flag: "vault",
                env: "AWS_VAULT",
                service: "aws",
            })?,
        })
    }

    /// Resolve B2 options from flags and environment.
    pub fn b2_options(&self) -> Result<B2Options, ConfigError> {
        Ok(B2Options {
            account_id: flag_or_env(&self.account, "B2_ACCOUNT_ID").unwrap_or_default(),
            application_key: flag_or_env(&self.key, "B2_APPLICATION_KEY").unwrap_or_default(),
            bucket_id: flag_or_env(&self.bucket, "B2_BUCKET_ID").ok_or(
                ConfigError::MissingOption {
                    flag: "bucket",
                    env: "B2_BUCKET_ID",
                    service: "b2",
                },
            )?,
        })
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Flag wins; a set-but-empty environment variable counts as unset.
fn flag_or_env(flag: &Option<String>, env: &str) -> Option<String> {
    flag.clone()
        .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
}
