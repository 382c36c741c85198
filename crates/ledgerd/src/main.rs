use std::io;

use anyhow::Context;

use atelier_infra::{Collaborators, Ledger, LedgerConfig};

fn main() -> anyhow::Result<()> {
    atelier_observability::init();

    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;

    // Only the Postgres stores need an async runtime.
    let runtime = match config.database_url {
        Some(_) => Some(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?,
        ),
        None => None,
    };

    let ledger = Ledger::from_config(
        &config,
        runtime.as_ref().map(|rt| rt.handle().clone()),
        Collaborators::default(),
    )
    .context("failed to set up ledger")?;

    tracing::info!(
        prefix = %config.order_prefix,
        persistent = config.database_url.is_some(),
        "serving ledger requests on stdin"
    );

    let served = atelier_ledgerd::serve(&ledger, io::stdin().lock(), io::stdout().lock())?;
    tracing::info!(served, "input closed, shutting down");
    Ok(())
}
