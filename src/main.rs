use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use murmur_server::{load_settings, IgnoredOverride, Settings};
use murmur_store::Database;
use murmur_telemetry::{init_telemetry, parse_level, LogFormat, TelemetryConfig};

/// Chat backend: REST resources plus a real-time event socket.
#[derive(Debug, Parser)]
#[command(name = "murmur", version)]
struct Cli {
    /// JSON settings file, deep-merged over the defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, short)]
    port: Option<u16>,

    /// Directory holding the JSON collections, message logs and blobs.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// `json` or `pretty`.
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(dir) = self.data_dir {
            settings.server.data_dir = dir;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn telemetry_config(settings: &Settings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: parse_level(&logging.level).unwrap_or(tracing::Level::INFO),
        format: match logging.format.as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        },
        log_to_sqlite: logging.persist_warnings,
        log_db_path: logging.log_db_path.clone(),
        ..Default::default()
    }
}

fn report_ignored(ignored: &[IgnoredOverride]) {
    for o in ignored {
        tracing::warn!(key = o.key, value = %o.value, "{}", o.reason);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let (mut settings, ignored) =
        load_settings(config_path.as_deref()).context("loading settings")?;
    cli.apply(&mut settings);

    let _telemetry = init_telemetry(telemetry_config(&settings));
    tracing::info!(config = ?config_path, "Starting Murmur server");
    report_ignored(&ignored);

    let data_dir = settings.server.data_dir.clone();
    let db = Database::open(&data_dir)
        .with_context(|| format!("opening data dir {}", data_dir.display()))?;
    tracing::info!(path = %data_dir.display(), "Database opened");

    let handle = murmur_server::start(settings.server, db)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "Murmur server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings() {
        let cli = Cli::try_parse_from([
            "murmur",
            "--port",
            "9001",
            "--data-dir",
            "/tmp/murmur",
            "--log-format",
            "pretty",
        ])
        .unwrap();
        let mut settings = Settings::default();
        cli.apply(&mut settings);

        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.server.data_dir, PathBuf::from("/tmp/murmur"));
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(telemetry_config(&settings).format, LogFormat::Pretty);
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let mut settings = Settings::default();
        settings.logging.level = "chatty".into();
        assert_eq!(telemetry_config(&settings).log_level, tracing::Level::INFO);
        settings.logging.level = "debug".into();
        assert_eq!(telemetry_config(&settings).log_level, tracing::Level::DEBUG);
    }
}
