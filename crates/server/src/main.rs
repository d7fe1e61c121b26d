//! Intercom server entry point

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intercom_agent::ClickToCallPublisher;
use intercom_config::{load_settings, Settings};
use intercom_directory::{
    DirectoryStore, DirectoryWatcher, PgDirectoryStore, PgDirectoryWatcher, SnapshotStore,
};
use intercom_llm::IntentExtractor;
use intercom_pipeline::{PhraseCache, Synthesizer, Transcriber};
use intercom_server::{
    create_router, AppState, ExtensionManager, HttpBusPublisher, HttpIntentExtractor,
    HttpSpeechGateway, LegDeps, OfflineDirectory, ResourceManager, SessionRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = std::env::var("INTERCOM_ENV").ok();
    let settings = load_settings(env.as_deref())?;

    init_tracing(&settings);
    tracing::info!("starting intercom server v{}", env!("CARGO_PKG_VERSION"));

    // External capabilities. Speech, extraction and the bus are hard
    // dependencies; the directory falls back to the local snapshot.
    let speech = Arc::new(HttpSpeechGateway::new(&settings.speech)?);
    let transcriber: Arc<dyn Transcriber> = speech.clone();
    let synthesizer: Arc<dyn Synthesizer> = speech;
    let extractor: Arc<dyn IntentExtractor> = Arc::new(HttpIntentExtractor::new(&settings.llm)?);
    let publisher: Arc<dyn ClickToCallPublisher> = Arc::new(HttpBusPublisher::new(&settings.bus)?);

    let (directory, watcher) = connect_directory(&settings).await;

    let registry = Arc::new(SessionRegistry::new());
    let resources = Arc::new(ResourceManager::new(&settings.resources));
    let _sampler = resources.start_sampler();

    let cache = Arc::new(PhraseCache::new(settings.cache.dir.as_str()));
    let mut prewarm = settings.cache.prewarm.clone();
    prewarm.push(settings.greeting.message.clone());
    tracing::info!(phrases = prewarm.len(), "pre-warming phrase cache");
    cache
        .prewarm(&synthesizer, &settings.greeting.voice, &prewarm)
        .await;

    let settings = Arc::new(settings);
    let deps = LegDeps {
        settings: settings.clone(),
        registry: registry.clone(),
        resources: resources.clone(),
        transcriber,
        synthesizer,
        extractor,
        directory: directory.clone(),
        publisher,
        cache,
    };

    let extensions = ExtensionManager::new(
        deps,
        SnapshotStore::new(settings.directory.snapshot_path.as_str()),
    );
    let serving = extensions.start_all().await;
    if serving == 0 {
        tracing::error!("no listener pair came up, exiting");
        return Err("no listener pair came up".into());
    }

    let _watcher_task = watcher.map(|w| extensions.spawn_watcher(w));

    let state = AppState {
        config: settings.clone(),
        registry,
        resources,
        directory,
        extensions,
    };
    let app = create_router(state);

    let host: IpAddr = settings
        .server
        .host
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(host, settings.server.port);
    tracing::info!(%addr, "management API listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn connect_directory(
    settings: &Settings,
) -> (Arc<dyn DirectoryStore>, Option<Box<dyn DirectoryWatcher>>) {
    let Some(url) = settings.directory.database_url.clone() else {
        tracing::warn!("no directory database configured, snapshot only");
        return (Arc::new(OfflineDirectory), None);
    };

    match PgDirectoryStore::connect(&url).await {
        Ok(store) => {
            let watcher: Box<dyn DirectoryWatcher> =
                Box::new(PgDirectoryWatcher::new(url, settings.directory.channel.clone()));
            let store: Arc<dyn DirectoryStore> = Arc::new(store);
            (store, Some(watcher))
        }
        Err(err) => {
            // Startup-only fallback; the snapshot keeps listeners serving.
            tracing::warn!(%err, "directory unreachable at startup, using snapshot");
            (Arc::new(OfflineDirectory), None)
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.observability.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if settings.observability.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(%err, "sigterm handler failed"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received sigterm, shutting down"),
    }
}
