//! # Coupon Issuance Backend Service
//!
//! Entry point for the coupon issuance service. It provides:
//!
//! - REST API for issuing, redeeming and cancelling coupons
//! - Queued issuance with per-policy ordered consumers
//! - Background reconciliation of quota counters against the ledger
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BACKEND SERVICE                          │
//! │                                                                 │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │  REST API   │  │  Issue Consumers │  │ Background Services│  │
//! │  │  (Actix)    │  │  (one/partition) │  │  • Quota Reconciler│  │
//! │  └─────────────┘  └──────────────────┘  └────────────────────┘  │
//! │         │                  │                      │             │
//! │         └──────────────────┴──────────────────────┘             │
//! │                            │                                    │
//! │  ┌─────────────────────────┴───────────────────────────────┐    │
//! │  │                    SERVICE LAYER                        │    │
//! │  │      IssuanceCoordinator        CouponLifecycle         │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                            │                                    │
//! │      ┌─────────────────────┼────────────────────┐               │
//! │  ┌───┴────────┐     ┌──────┴───────┐     ┌──────┴──────┐        │
//! │  │ PostgreSQL │     │    Redis     │     │    Queue    │        │
//! │  │  (ledger)  │     │ counter/lock │     │ mpsc/Kafka  │        │
//! │  └────────────┘     └──────────────┘     └─────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Start PostgreSQL and Redis
//! 2. Copy `.env.example` to `.env` and configure
//! 3. Start the server: `cargo run` (migrations run at start-up)

use std::io;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use coupon_issuance::api;
use coupon_issuance::cache::RedisCache;
use coupon_issuance::config::{AppConfig, QueueBackend};
use coupon_issuance::db::Database;
use coupon_issuance::ledger::PostgresLedger;
use coupon_issuance::lock::RedisLock;
use coupon_issuance::queue::{ChannelQueue, IssuePublisher, PartitionReceiver};
use coupon_issuance::services::{Backends, CouponLifecycle, IssuanceCoordinator, IssueConsumer, QuotaReconciler};
use coupon_issuance::utils::SystemClock;
use coupon_issuance::AppState;

/// Capacity of each in-memory queue partition.
const PARTITION_CAPACITY: usize = 1024;

/// Main entry point for the backend service.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Connects PostgreSQL and Redis
/// 3. Wires the queue and the services
/// 4. Starts consumers and the quota reconciler
/// 5. Launches the HTTP server
/// 6. Stops background tasks once the server exits
#[actix_web::main]
async fn main() -> io::Result<()> {
    // =========================================
    // STEP 1: Initialize Logging
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("🚀 Starting Coupon Issuance Backend Service");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    let config = AppConfig::from_env()
        .expect("Failed to load configuration");

    info!("📋 Configuration loaded");
    info!("   Admission strategy: {}", config.admission_strategy);
    info!("   One coupon per user: {}", config.one_coupon_per_user);
    info!("   Queue backend: {}", config.queue_backend);

    // =========================================
    // STEP 3: Initialize Database
    // =========================================
    let db = Database::connect(&config.database_url, config.database_pool_size)
        .await
        .expect("Failed to connect to database");

    info!("🗄️  Database connected");

    db.run_migrations(config.one_coupon_per_user)
        .await
        .expect("Failed to run migrations");

    info!("📦 Database migrations complete");

    // =========================================
    // STEP 4: Initialize Redis
    // =========================================
    let cache = Arc::new(
        RedisCache::connect(&config.redis_url)
            .await
            .expect("Failed to connect to Redis"),
    );
    let lock = Arc::new(RedisLock::new(cache.connection()));

    info!("🧮 Redis connected (quota counter, policy locks, coupon state)");

    // =========================================
    // STEP 5: Initialize Queue
    // =========================================
    let (publisher, partition_receivers): (Arc<dyn IssuePublisher>, Vec<PartitionReceiver>) =
        match config.queue_backend {
            QueueBackend::Memory => {
                let (queue, receivers) = ChannelQueue::new(config.queue_partitions, PARTITION_CAPACITY);
                let queue: Arc<dyn IssuePublisher> = Arc::new(queue);
                (queue, receivers)
            }
            QueueBackend::Kafka => (kafka::publisher(&config)?, Vec::new()),
        };

    info!("📨 Issue queue ready ({})", config.queue_backend);

    // =========================================
    // STEP 6: Initialize Services
    // =========================================
    let backends = Backends {
        ledger: Arc::new(PostgresLedger::new(db.clone())),
        counter: cache.clone(),
        state_cache: cache,
        lock,
        publisher,
        clock: Arc::new(SystemClock),
    };

    let issuance = IssuanceCoordinator::new(backends.clone(), config.issuance_settings());
    let lifecycle = CouponLifecycle::new(backends.clone());
    let reconciler = QuotaReconciler::new(
        backends.clone(),
        config.lock_settings(),
        config.reconciliation_interval(),
    );

    info!("🔧 Services initialized");

    let app_state = Arc::new(AppState {
        backends,
        issuance: issuance.clone(),
        lifecycle,
        config: config.clone(),
    });

    // =========================================
    // STEP 7: Start Background Services
    // =========================================
    let shutdown = CancellationToken::new();
    let consumer = IssueConsumer::new(issuance);

    let mut background: Vec<JoinHandle<usize>> = match config.queue_backend {
        QueueBackend::Memory => consumer.spawn_partitions(partition_receivers, shutdown.clone()),
        QueueBackend::Kafka => vec![kafka::spawn_consumer(&config, consumer, shutdown.clone())?],
    };

    info!("👷 Issue consumers started ({} task(s))", background.len());

    let reconciler_shutdown = shutdown.clone();
    background.push(tokio::spawn(async move {
        reconciler.start_reconciliation_loop(reconciler_shutdown).await;
        0
    }));

    info!("📊 Quota reconciler started");

    // =========================================
    // STEP 8: Start HTTP Server
    // =========================================
    let server_addr = config.server_addr();

    info!("🌐 Starting HTTP server on {}", server_addr);

    let served = HttpServer::new(move || {
        App::new()
            // Attach shared application state
            .app_data(web::Data::new(app_state.clone()))

            // Add logging middleware
            .wrap(middleware::Logger::default())

            // Configure API routes
            .configure(api::configure_routes)
    })
    .bind(&server_addr)?
    .run()
    .await;

    // =========================================
    // STEP 9: Stop Background Services
    // =========================================
    info!("🛑 HTTP server stopped, draining background tasks");
    shutdown.cancel();

    let handled: usize = join_all(background)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Background task ended abnormally: {}", e);
                None
            }
        })
        .sum();

    info!("👋 Shut down after consuming {} queued request(s)", handled);
    served
}

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use std::time::Duration;

    use coupon_issuance::queue::kafka::{KafkaIssueConsumer, KafkaIssuePublisher};
    use coupon_issuance::queue::IssueMessageHandler;

    pub fn publisher(config: &AppConfig) -> io::Result<Arc<dyn IssuePublisher>> {
        let publisher = KafkaIssuePublisher::new(
            &config.kafka_brokers,
            Duration::from_millis(config.publish_timeout_ms),
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Arc::new(publisher))
    }

    pub fn spawn_consumer(
        config: &AppConfig,
        consumer: IssueConsumer,
        shutdown: CancellationToken,
    ) -> io::Result<JoinHandle<usize>> {
        let kafka = KafkaIssueConsumer::new(&config.kafka_brokers, &config.kafka_group_id)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let handler: Arc<dyn IssueMessageHandler> = Arc::new(consumer);
        Ok(tokio::spawn(kafka.run(handler, shutdown)))
    }
}

#[cfg(not(feature = "kafka"))]
mod kafka {
    use super::*;

    fn unavailable() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "QUEUE_BACKEND=kafka requires building with --features kafka",
        )
    }

    pub fn publisher(_config: &AppConfig) -> io::Result<Arc<dyn IssuePublisher>> {
        Err(unavailable())
    }

    pub fn spawn_consumer(
        _config: &AppConfig,
        _consumer: IssueConsumer,
        _shutdown: CancellationToken,
    ) -> io::Result<JoinHandle<usize>> {
        Err(unavailable())
    }
}
