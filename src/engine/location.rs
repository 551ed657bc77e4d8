use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EventPublisher, customer_topic, driver_topic, order_topic};
use crate::error::AppError;
use crate::geo::{GeoPoint, RouteLeg, RouteProvider};
use crate::models::driver::{Driver, DriverStatus, LocationSample};
use crate::models::event::{BusEvent, EtaEstimate, LocationUpdate};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteLegKind {
    ToPickup,
    ToDropoff,
}

pub fn leg_for(status: OrderStatus) -> Option<RouteLegKind> {
    match status {
        OrderStatus::Accepted | OrderStatus::PickedUp => Some(RouteLegKind::ToPickup),
        OrderStatus::InTransit => Some(RouteLegKind::ToDropoff),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    DiscardedStale,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleInput {
    pub point: GeoPoint,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct AppliedRoute {
    leg: RouteLeg,
    stale: bool,
}

#[derive(Debug, Default)]
struct RecomputeState {
    next_seq: u64,
    applied_seq: u64,
    in_flight: bool,
    queued: Option<LocationSample>,
    route: Option<AppliedRoute>,
}

type RouteKey = (Uuid, RouteLegKind);

#[derive(Clone)]
pub struct LocationEngine {
    store: Arc<dyn Store>,
    publisher: Arc<EventPublisher>,
    drivers: Arc<DashMap<Uuid, Driver>>,
    router: Arc<dyn RouteProvider>,
    positions: Arc<DashMap<Uuid, LocationSample>>,
    recompute: Arc<DashMap<RouteKey, RecomputeState>>,
    metrics: Metrics,
}

impl LocationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<EventPublisher>,
        drivers: Arc<DashMap<Uuid, Driver>>,
        router: Arc<dyn RouteProvider>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            publisher,
            drivers,
            router,
            positions: Arc::new(DashMap::new()),
            recompute: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub async fn report(
        &self,
        driver_id: Uuid,
        input: SampleInput,
    ) -> Result<ReportOutcome, AppError> {
        {
            let driver = self
                .drivers
                .get(&driver_id)
                .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
            if driver.status == DriverStatus::Offline {
                return Err(AppError::Validation(format!(
                    "driver {driver_id} is offline and cannot report locations"
                )));
            }
        }
        if !input.point.is_finite() {
            return Err(AppError::Validation(
                "location coordinates must be finite".to_string(),
            ));
        }

        let sample = LocationSample {
            driver_id,
            point: input.point,
            heading: input.heading,
            speed: input.speed,
            captured_at: input.captured_at.unwrap_or_else(Utc::now),
        };

        // Monotonic-time rule: an older capture never replaces a newer one.
        match self.positions.entry(driver_id) {
            Entry::Occupied(mut occupied) => {
                if sample.captured_at <= occupied.get().captured_at {
                    self.metrics.stale_samples_discarded_total.inc();
                    debug!(driver_id = %driver_id, "stale location sample discarded");
                    return Ok(ReportOutcome::DiscardedStale);
                }
                occupied.insert(sample.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(sample.clone());
            }
        }

        if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
            driver.location = Some(sample.point);
            driver.updated_at = sample.captured_at;
        }

        let active = self.store.active_order_for_driver(driver_id).await?;
        let eta = active
            .as_ref()
            .and_then(|order| leg_for(order.status))
            .and_then(|leg| self.current_eta(driver_id, leg));

        let update = BusEvent::LocationUpdate(LocationUpdate {
            driver_id,
            order_id: active.as_ref().map(|o| o.id),
            point: sample.point,
            heading: sample.heading,
            speed: sample.speed,
            captured_at: sample.captured_at,
            eta,
        });
        self.publisher
            .publish(&driver_topic(driver_id), update.clone())
            .await?;
        if let Some(order) = &active {
            self.publisher
                .publish(&order_topic(order.id), update)
                .await?;
            self.trigger_recompute(order.clone(), sample);
        }

        Ok(ReportOutcome::Applied)
    }

    pub fn latest_position(&self, driver_id: Uuid) -> Option<LocationSample> {
        self.positions.get(&driver_id).map(|s| s.value().clone())
    }

    pub fn tracked_drivers(&self) -> usize {
        self.positions.len()
    }

    pub fn current_eta(&self, driver_id: Uuid, leg: RouteLegKind) -> Option<EtaEstimate> {
        self.recompute.get(&(driver_id, leg)).and_then(|state| {
            state.route.as_ref().map(|applied| EtaEstimate {
                distance_meters: applied.leg.distance_meters,
                duration_seconds: applied.leg.duration_seconds,
                stale: applied.stale,
                computed_at: applied.leg.computed_at,
            })
        })
    }

    /// Forget everything tracked for a driver once their delivery ends.
    pub fn clear_driver(&self, driver_id: Uuid) {
        self.recompute.retain(|key, _| key.0 != driver_id);
    }

    fn trigger_recompute(&self, order: Order, sample: LocationSample) {
        let Some(leg) = leg_for(order.status) else {
            return;
        };
        let key = (sample.driver_id, leg);
        let destination = match leg {
            RouteLegKind::ToPickup => order.pickup.point,
            RouteLegKind::ToDropoff => order.dropoff.point,
        };

        {
            let mut state = self.recompute.entry(key).or_default();
            if state.in_flight {
                // Coalesce: remember only the newest sample for when the
                // in-flight call resolves.
                state.queued = Some(sample);
                self.metrics
                    .route_recomputes_total
                    .with_label_values(&["coalesced"])
                    .inc();
                return;
            }
            state.in_flight = true;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.recompute_loop(key, order, destination, sample).await;
        });
    }

    async fn recompute_loop(
        &self,
        key: RouteKey,
        order: Order,
        destination: GeoPoint,
        mut sample: LocationSample,
    ) {
        loop {
            let seq = {
                let mut state = self.recompute.entry(key).or_default();
                state.next_seq += 1;
                state.next_seq
            };

            let started = Instant::now();
            let result = self.router.route(sample.point, destination).await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(leg) => {
                    self.metrics
                        .route_recompute_latency_seconds
                        .with_label_values(&["success"])
                        .observe(elapsed);
                    match self.apply_route(key, seq, order.id, leg).await {
                        Ok(true) => self
                            .metrics
                            .route_recomputes_total
                            .with_label_values(&["applied"])
                            .inc(),
                        Ok(false) => self
                            .metrics
                            .route_recomputes_total
                            .with_label_values(&["discarded"])
                            .inc(),
                        Err(err) => {
                            warn!(order_id = %order.id, error = %err, "route apply failed")
                        }
                    }
                }
                Err(err) => {
                    self.metrics
                        .route_recompute_latency_seconds
                        .with_label_values(&["error"])
                        .observe(elapsed);
                    self.metrics
                        .route_recomputes_total
                        .with_label_values(&["error"])
                        .inc();
                    // Keep the last-good route on display, just flag it.
                    if let Some(mut state) = self.recompute.get_mut(&key)
                        && let Some(route) = state.route.as_mut()
                    {
                        route.stale = true;
                    }
                    warn!(
                        driver_id = %key.0,
                        order_id = %order.id,
                        error = %err,
                        "route recompute failed; keeping last known route"
                    );
                }
            }

            let next = {
                let mut state = self.recompute.entry(key).or_default();
                match state.queued.take() {
                    Some(queued) => Some(queued),
                    None => {
                        state.in_flight = false;
                        None
                    }
                }
            };
            match next {
                Some(queued) => sample = queued,
                None => break,
            }
        }
    }

    /// Applies a finished routing call. Results can resolve out of order
    /// under jitter; only a sequence number above the last applied one wins,
    /// and only while the order still wants this leg.
    pub(crate) async fn apply_route(
        &self,
        key: RouteKey,
        seq: u64,
        order_id: Uuid,
        leg: RouteLeg,
    ) -> Result<bool, AppError> {
        let order = match self.store.order(order_id).await {
            Ok(order) => order,
            Err(AppError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if leg_for(order.status) != Some(key.1) {
            return Ok(false);
        }

        let eta = {
            let mut state = self.recompute.entry(key).or_default();
            if seq <= state.applied_seq {
                return Ok(false);
            }
            state.applied_seq = seq;
            state.route = Some(AppliedRoute { leg, stale: false });
            state.route.as_ref().map(|applied| EtaEstimate {
                distance_meters: applied.leg.distance_meters,
                duration_seconds: applied.leg.duration_seconds,
                stale: false,
                computed_at: applied.leg.computed_at,
            })
        };

        if let Some(sample) = self.latest_position(key.0) {
            let update = BusEvent::LocationUpdate(LocationUpdate {
                driver_id: key.0,
                order_id: Some(order_id),
                point: sample.point,
                heading: sample.heading,
                speed: sample.speed,
                captured_at: sample.captured_at,
                eta,
            });
            self.publisher
                .publish_all(
                    &[order_topic(order_id), customer_topic(order.customer_id)],
                    update,
                )
                .await?;
        }

        Ok(true)
    }
}
