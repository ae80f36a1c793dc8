use anyhow::Context;
use bundler::credit::{CreditService, FreeCredit, HttpCreditClient};
use bundler::{workers, Config, Core};
use clap::Parser;
use futures::FutureExt;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    // Reasonable defaults for structured logs on stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let config = Config::parse();
    config.validate()?;
    tracing::info!(port = config.api_port, "bundler starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(config).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main completed; shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    // Bind early, so requests dispatched while the rest boots see a
    // connection rather than a refusal.
    let api_listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.api_port))
        .await
        .context("failed to bind API port")?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_secs(5))
        .max_connections(32)
        .connect(config.database_url.as_str())
        .await
        .context("connecting to database")?;
    bundler_sql::migrate(&pool)
        .await
        .context("running database migrations")?;

    let blobs = blobs::BlobStore::open(&config.store_config()?)
        .context("opening the object store")?;
    match blobs.probe().await {
        Ok(()) => tracing::info!("object store probe passed"),
        Err(err) if config.durable_store_required => {
            return Err(anyhow::Error::from(err)
                .context("durable object store probe failed and --durable-store-required is set"));
        }
        Err(err) => {
            tracing::warn!(?err, "object store probe failed; continuing without durability");
        }
    }

    let wallet = match &config.wallet_file {
        Some(path) => arweave::Wallet::load(path).context("loading wallet JWK")?,
        None => {
            tracing::warn!("no --wallet-file configured; generating an ephemeral signing key");
            arweave::Wallet::from_key(
                ans104::ArweaveKey::generate(4096).context("generating ephemeral wallet")?,
            )
        }
    };
    tracing::info!(address = wallet.address(), "bundler wallet ready");

    let credit: Arc<dyn CreditService> = match (&config.credit_service_url, &config.credit_service_secret) {
        (Some(url), Some(secret)) => {
            let http = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .context("building credit http client")?;
            Arc::new(HttpCreditClient::new(http, url.clone(), secret.clone()))
        }
        (Some(_), None) => {
            anyhow::bail!("--credit-service requires --credit-service-secret");
        }
        _ => {
            tracing::warn!("no credit service configured; admitting uploads for free");
            Arc::new(FreeCredit)
        }
    };

    let cache: Arc<dyn cache::Cache> = Arc::new(cache::MemoryCache::new());
    let core = Core::build(config, pool, blobs, cache, credit, wallet)?;

    // Prime the chain height before serving, best-effort.
    match core.gateway.current_height().await {
        Ok(height) => core.height.set(height),
        Err(err) => tracing::warn!(?err, "could not prime chain height at boot"),
    }

    // Share-able future which completes when the process should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let router = bundler::api::build_router(core.clone())?;
    let api_server = axum::serve(api_listener, router).with_graceful_shutdown(shutdown.clone());
    let api_server = async move { anyhow::Result::<()>::Ok(api_server.await?) };

    let worker_handles = workers::spawn_all(core.clone(), shutdown.clone());
    let workers_done = async move {
        for handle in worker_handles {
            handle.await.context("worker task panicked")?;
        }
        anyhow::Result::<()>::Ok(())
    };

    let ((), ()) = tokio::try_join!(api_server, workers_done)?;
    tracing::info!("bundler stopped");
    Ok(())
}
