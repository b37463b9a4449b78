//! credential-vault - maintenance entry point
//!
//! Unlocks the vault from the environment and runs one maintenance command:
//! `status` (default), `list`, `verify`, `backup`, `prune` or `providers`.

use credential_vault::{config::VaultConfig, secrets::passphrase_issues, VaultContext};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays machine-readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credential_vault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "status".to_string());

    let config = VaultConfig::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let ctx = VaultContext::open(config)?;

    if command == "providers" {
        let providers: Vec<_> = ctx.catalog.iter().collect();
        return print_json(&providers);
    }

    if let Some(passphrase) = ctx.config.master_passphrase.as_deref() {
        for issue in passphrase_issues(passphrase) {
            warn!("Master passphrase: {}", issue);
        }
    }
    ctx.unlock_from_config().await?;

    match command.as_str() {
        "status" => {
            let report = ctx.store.verify_all().await?;
            if !report.is_healthy() {
                warn!(
                    quarantined = report.newly_quarantined.len() + report.already_quarantined.len(),
                    "Vault needs attention"
                );
            }
            print_json(&serde_json::json!({
                "storage": ctx.store.storage_info().await?,
                "health": report,
            }))?;
        }
        "list" => print_json(&ctx.registrations.list().await?)?,
        "verify" => print_json(&ctx.store.verify_all().await?)?,
        "backup" => {
            let info = ctx.backups.backup().await?;
            let pruned = ctx.backups.prune_to_retention()?;
            if !pruned.is_empty() {
                info!(removed = pruned.len(), "Pruned old backups");
            }
            print_json(&info)?;
        }
        "prune" => print_json(&ctx.backups.prune_to_retention()?)?,
        other => anyhow::bail!(
            "Unknown command '{}'; expected status, list, verify, backup, prune or providers",
            other
        ),
    }

    ctx.store.lock().await;
    Ok(())
}
