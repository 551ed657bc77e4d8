use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use crate::bus::{EventBus, EventPublisher, InProcessBus, RetryPolicy};
use crate::config::Config;
use crate::engine::chat::ChatEngine;
use crate::engine::location::LocationEngine;
use crate::engine::orders::OrderEngine;
use crate::engine::settlement::SettlementEngine;
use crate::geo::{HaversineRouter, RouteProvider};
use crate::models::driver::Driver;
use crate::observability::metrics::Metrics;
use crate::store::{MemStore, Store};

pub struct AppState {
    pub config: Config,
    pub drivers: Arc<DashMap<Uuid, Driver>>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn EventBus>,
    pub publisher: Arc<EventPublisher>,
    pub orders: Arc<OrderEngine>,
    pub location: Arc<LocationEngine>,
    pub chat: Arc<ChatEngine>,
    pub settlement: Arc<SettlementEngine>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let bus: Arc<dyn EventBus> = Arc::new(InProcessBus::new(config.event_buffer_size));
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let router: Arc<dyn RouteProvider> = Arc::new(HaversineRouter::new(config.route_speed_mps));
        Self::with_collaborators(config, store, bus, router)
    }

    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        router: Arc<dyn RouteProvider>,
    ) -> Self {
        let metrics = Metrics::new();
        let retry = RetryPolicy::new(
            config.publish_retry_attempts,
            Duration::from_millis(config.publish_backoff_ms),
        );
        let publisher = Arc::new(EventPublisher::new(bus.clone(), retry, metrics.clone()));
        let drivers: Arc<DashMap<Uuid, Driver>> = Arc::new(DashMap::new());

        let location = Arc::new(LocationEngine::new(
            store.clone(),
            publisher.clone(),
            drivers.clone(),
            router,
            metrics.clone(),
        ));
        let chat = Arc::new(ChatEngine::new(
            store.clone(),
            publisher.clone(),
            metrics.clone(),
        ));
        let orders = Arc::new(OrderEngine::new(
            store.clone(),
            publisher.clone(),
            drivers.clone(),
            location.clone(),
            metrics.clone(),
            Duration::from_secs(config.order_expiry_secs),
        ));
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            publisher.clone(),
            chat.clone(),
            location.clone(),
            drivers.clone(),
            config.commission_fee,
            config.require_proof_of_delivery,
            metrics.clone(),
        ));

        Self {
            config,
            drivers,
            store,
            bus,
            publisher,
            orders,
            location,
            chat,
            settlement,
            metrics,
        }
    }
}
