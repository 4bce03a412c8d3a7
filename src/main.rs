use dneutral::application::hedging::HedgingManager;
use dneutral::config::Config;
use dneutral::domain::errors::ExchangeError;
use dneutral::domain::ports::ExchangeApi;
use dneutral::domain::pricing::Black76Pricer;
use dneutral::domain::repositories::PortfolioStore;
use dneutral::infrastructure::exchange::{WsClientConfig, WsExchangeClient};
use dneutral::infrastructure::store::FilePortfolioStore;
use dneutral::infrastructure::{EventBus, SubscriptionManager};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 64;
const EXIT_AUTH: i32 = 69;
const EXIT_INTERNAL: i32 = 70;

fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to build runtime: {e}");
            std::process::exit(EXIT_INTERNAL);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    info!(
        testnet = config.exchange.testnet,
        "starting delta-hedging engine"
    );

    let bus = EventBus::new();

    let store = match FilePortfolioStore::open(&config.portfolios_dir, bus.clone()).await {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open portfolio store: {e}");
            return EXIT_CONFIG;
        }
    };
    let store: Arc<dyn PortfolioStore> = Arc::new(store);

    let client = match WsExchangeClient::connect(WsClientConfig::new(
        &config.exchange.ws_url,
        &config.exchange.key,
        &config.exchange.secret,
    ))
    .await
    {
        Ok(client) => Arc::new(client),
        Err(ExchangeError::AuthRequired) => {
            error!("exchange rejected the configured credentials");
            return EXIT_AUTH;
        }
        Err(e) => {
            error!("exchange connection failed: {e}");
            return EXIT_INTERNAL;
        }
    };
    let exchange: Arc<dyn ExchangeApi> = client.clone();

    let subs = Arc::new(SubscriptionManager::new(Arc::clone(&exchange)));
    let manager = Arc::new(HedgingManager::new(
        exchange,
        Arc::clone(&store),
        subs,
        Arc::new(Black76Pricer),
        bus.clone(),
        config.hedging.clone(),
    ));

    // Resume hedging for every stored portfolio.
    match store.list().await {
        Ok(portfolios) => {
            for portfolio in portfolios {
                if let Err(e) = manager.start_hedger(&portfolio.id, None).await {
                    warn!(portfolio = %portfolio.id, "hedger failed to start: {e}");
                }
            }
        }
        Err(e) => {
            error!("cannot list portfolios: {e}");
            return EXIT_INTERNAL;
        }
    }

    info!("engine running; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("unable to listen for shutdown signal: {e}");
        return EXIT_INTERNAL;
    }

    info!("shutdown requested");
    manager.shutdown().await;
    client.close().await;
    info!("bye");
    EXIT_OK
}
