use std::env;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info};

use scavenger_swarm::api_client::ApiClient;
use scavenger_swarm::config::{AppConfig, ConfigStore};
use scavenger_swarm::control;
use scavenger_swarm::events::EventBus;
use scavenger_swarm::hash_service::{HashService, RomParams};
use scavenger_swarm::orchestrator::{CoreServices, CoreTuning, Miner};
use scavenger_swarm::receipts::{CompositeSink, FileReceiptLog, HttpReceiptSink};
use scavenger_swarm::remote::{DevFeeSource, ReceiptSink, Registrar, RemoteGateway};
use scavenger_swarm::wallet::WalletProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    info!("🚀 scavenger_swarm starting");
    info!("Detected {} CPU cores", num_cpus::get());

    let app_config = AppConfig::load()
        .map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;
    info!("API base URL: {}", app_config.base_url);

    let store = Arc::new(
        ConfigStore::load(app_config.data_path("settings.json"))
            .context("loading persisted settings")?,
    );
    let settings = store.get();

    let events = EventBus::new();
    let api = Arc::new(
        ApiClient::new(&app_config.base_url, app_config.devfee_url.clone())
            .context("building API client")?,
    );
    let hash = Arc::new(HashService::new(
        events.clone(),
        RomParams::default(),
        settings.batch_size,
    ));

    let mut sinks: Vec<Box<dyn ReceiptSink>> = vec![Box::new(FileReceiptLog::load(
        app_config.data_path("receipts.json"),
    ))];
    if let Some(backend_url) = &app_config.backend_url {
        match HttpReceiptSink::new(backend_url, app_config.backend_token.clone()) {
            Ok(sink) => {
                info!("Receipt sink backend: {}", backend_url);
                sinks.push(Box::new(sink));
            }
            Err(e) => error!("Could not build backend sink: {}", e),
        }
    }

    let services = CoreServices {
        gateway: Arc::clone(&api) as Arc<dyn RemoteGateway>,
        registrar: Arc::clone(&api) as Arc<dyn Registrar>,
        devfee: Arc::clone(&api) as Arc<dyn DevFeeSource>,
        signer_provider: Arc::new(WalletProvider {
            seed_path: app_config.data_path("seed.txt"),
            use_mainnet: true,
        }),
        sink: Arc::new(CompositeSink::new(sinks)),
        hash,
        store: Arc::clone(&store),
        events,
        registered_path: Some(app_config.data_path("registered.json")),
    };
    let miner = Miner::new(services, CoreTuning::default());

    let control_miner = Arc::clone(&miner);
    let listen_addr = app_config.listen_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = control::serve(&listen_addr, control_miner).await {
            error!("Control surface failed: {}", e);
        }
    });

    if settings.auto_resume && settings.was_mining_active {
        info!("Auto-resume: previous run was mining, starting again");
        let password = env::var("APP_WALLET_PASSWORD").unwrap_or_default();
        if let Err(e) = miner.start(&password).await {
            error!("Auto-resume failed: {}", e);
        }
    } else {
        info!(
            "Idle until /start is called on {}",
            app_config.listen_addr
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupt received, shutting down...");
    miner.stop().await;
    Ok(())
}
