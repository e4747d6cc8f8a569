use std::sync::Arc;

use anyhow::Context;
use studiodrive_core::{HttpBackend, Identity};
use studiodrived::context::SyncContext;
use studiodrived::settings::Settings;
use studiodrived::sync::conflict::cleanup_conflict_files;
use studiodrived::sync::engine::Collaborators;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    PurgeConflicts,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--purge-conflicts" => mode = CliMode::PurgeConflicts,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn backend_from_settings(settings: &Settings) -> anyhow::Result<HttpBackend> {
    let url = settings
        .backend_url
        .as_deref()
        .context("STUDIODRIVE_BACKEND_URL is not set")?;
    let token = settings
        .api_token
        .as_deref()
        .context("STUDIODRIVE_TOKEN is not set")?;
    let backend = HttpBackend::new(url, token)
        .with_context(|| format!("failed to create backend client for {url}"))?;
    match std::env::var("STUDIODRIVE_USER_ID") {
        Ok(id) if !id.is_empty() => {
            let name = std::env::var("STUDIODRIVE_USER_NAME").unwrap_or_else(|_| id.clone());
            Ok(backend.with_identity(Identity { id, name }))
        }
        _ => Ok(backend),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: studiodrived [--purge-conflicts]");
        println!("  --purge-conflicts   Remove conflict copies past the retention window and exit");
        return Ok(());
    }

    let settings = Settings::from_env().context("failed to read settings")?;
    if mode == CliMode::PurgeConflicts {
        let removed = cleanup_conflict_files(
            &settings.drive_root,
            settings.conflict_retention(),
            time::OffsetDateTime::now_utc(),
        )
        .await
        .context("failed to purge conflict copies")?;
        println!("removed {removed} conflict copies");
        return Ok(());
    }

    let backend = Arc::new(backend_from_settings(&settings)?);
    let context = SyncContext::build(settings, Collaborators::from_backend(backend)).await?;
    context.start().await?;
    tracing::info!(
        root = %context.settings().drive_root.display(),
        "studiodrived running; press Ctrl-C to stop"
    );

    let result = tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal");
    context.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["studiodrived".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_purge() {
        let mode = parse_cli_mode(vec![
            "studiodrived".to_string(),
            "--purge-conflicts".to_string(),
        ])
        .unwrap();
        assert_eq!(mode, CliMode::PurgeConflicts);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode =
            parse_cli_mode(vec!["studiodrived".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["studiodrived".to_string(), "--logout".to_string()]).is_err());
    }

    #[test]
    fn backend_requires_url_and_token() {
        let settings = Settings::with_root("/tmp/drive");
        let Err(err) = backend_from_settings(&settings) else {
            panic!("backend built without a URL");
        };
        assert!(err.to_string().contains("STUDIODRIVE_BACKEND_URL"));

        let settings = Settings {
            backend_url: Some("https://studio.example.test/api/".to_string()),
            ..Settings::with_root("/tmp/drive")
        };
        let Err(err) = backend_from_settings(&settings) else {
            panic!("backend built without a token");
        };
        assert!(err.to_string().contains("STUDIODRIVE_TOKEN"));
    }
}
