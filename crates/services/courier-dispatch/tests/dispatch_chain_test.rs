use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_dispatch::config::{ChainConfig, FareConfig};
use courier_dispatch::{
    BroadcastNotifier, ChainResult, DispatchEngine, DispatchError, DispatchService, FareEngine, FleetDirectory,
    InMemoryFleet, JobResponse, ManualClock, NewJob, ResponseOutcome,
};
use courier_dispatch::engine::MERCHANT_HISTORY_LIMIT;
use courier_types::{
    AgentAvailability, AgentStatus, ChannelId, CourierId, CustomerId, DispatchEvent, GeoPoint, JobStatus,
    MerchantId, OfferStatus, PaymentMethod, VehicleKind,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Barrier};

const SHOP: GeoPoint = GeoPoint { lat: 41.0082, lon: 28.9784 };
const DOOR: GeoPoint = GeoPoint { lat: 41.0250, lon: 28.9900 };

struct Harness {
    service: Arc<DispatchService>,
    fleet: Arc<InMemoryFleet>,
    notifier: BroadcastNotifier,
    clock: Arc<ManualClock>,
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
}

fn harness_with(chain: ChainConfig) -> Harness {
    let fleet = Arc::new(InMemoryFleet::new());
    let clock = Arc::new(ManualClock::new(noon()));
    let fare = Arc::new(FareEngine::new(FareConfig::default(), None, std::time::Duration::from_secs(5)));
    let engine = DispatchEngine::new(fare, fleet.clone(), fleet.clone(), clock.clone(), chain);
    let notifier = BroadcastNotifier::new();
    let service = Arc::new(DispatchService::new(engine, Arc::new(notifier.clone())));
    Harness { service, fleet, notifier, clock }
}

fn harness() -> Harness {
    harness_with(ChainConfig::default())
}

/// Couriers at increasing distance north of the shop.
async fn couriers(h: &Harness, count: usize) -> Vec<CourierId> {
    let mut ids = Vec::new();
    for i in 0..count {
        let id = CourierId::new();
        h.service.register_courier(id, VehicleKind::Motorcycle).await.unwrap();
        let at = GeoPoint::new(SHOP.lat + 0.001 * (i as f64 + 1.0), SHOP.lon);
        h.service.update_location(id, at).await.unwrap();
        h.service.set_availability(id, AgentStatus::Available).await.unwrap();
        ids.push(id);
    }
    ids
}

fn new_job(merchant_id: MerchantId, customer_id: Option<CustomerId>) -> NewJob {
    NewJob {
        merchant_id,
        customer_id,
        origin: SHOP,
        destination: DOOR,
        destination_label: "Cihangir Sk. 4".to_string(),
        note: Some("ring twice".to_string()),
    }
}

fn drain(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

#[tokio::test]
async fn job_runs_the_ordered_lifecycle() {
    let h = harness();
    let ids = couriers(&h, 2).await;
    let merchant = MerchantId::new();
    let customer = CustomerId::new();
    let mut merchant_rx = h.notifier.subscribe(&ChannelId::merchant(merchant));
    let mut customer_rx = h.notifier.subscribe(&ChannelId::customer(customer));
    let mut courier_rx = h.notifier.subscribe(&ChannelId::courier(ids[0]));

    let job = h.service.create_job(new_job(merchant, Some(customer))).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.note.as_deref(), Some("ring twice"));
    assert_eq!(h.service.active_job_for_customer(customer).await.map(|j| j.id), Some(job.id));
    assert!(job.fare.total_fare >= 20.0);
    assert_eq!(drain(&mut courier_rx), vec!["job_offered"]);

    let outcome = h.service.respond(job.id, ids[0], JobResponse::Accept).await.unwrap();
    assert_eq!(outcome, ResponseOutcome::Assigned { courier_id: ids[0] });

    // Delivery cannot skip pickup
    let err = h
        .service
        .confirm_delivery(job.id, ids[0], PaymentMethod::Cash)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidTransition { from: JobStatus::Assigned, .. }));

    // Only the assigned courier may confirm
    let err = h.service.confirm_pickup(job.id, ids[1]).await.unwrap_err();
    assert!(matches!(err, DispatchError::Conflict(_)));

    h.clock.advance(Duration::minutes(10));
    h.service.confirm_pickup(job.id, ids[0]).await.unwrap();
    h.clock.advance(Duration::minutes(15));
    let payment = h
        .service
        .confirm_delivery(job.id, ids[0], PaymentMethod::CardTerminal)
        .await
        .unwrap();

    let done = h.service.job(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(payment.amount, done.fare.total_fare);
    assert_eq!(done.payment, Some(payment));
    assert_eq!(done.assigned_at, Some(noon()));
    assert_eq!(done.picked_up_at, Some(noon() + Duration::minutes(10)));
    assert_eq!(done.delivered_at, Some(noon() + Duration::minutes(25)));

    let record = h.fleet.get(ids[0]).await.unwrap();
    assert_eq!(record.status, AgentStatus::Available);
    assert_eq!(record.completed_deliveries, 1);

    // Settled jobs drop out of the live views but stay in the history
    assert!(h.service.active_job_for_customer(customer).await.is_none());
    assert!(h.service.engine().store().open_handles().await.is_empty());
    assert_eq!(h.service.jobs_for_merchant(merchant).await.len(), 1);

    assert_eq!(
        drain(&mut merchant_rx),
        vec!["job_created", "job_accepted", "job_picked_up", "delivery_completed"]
    );
    assert_eq!(drain(&mut customer_rx), vec!["delivery_completed"]);
}

#[tokio::test]
async fn customer_rates_once() {
    let h = harness();
    let ids = couriers(&h, 1).await;
    let customer = CustomerId::new();
    let job = h.service.create_job(new_job(MerchantId::new(), Some(customer))).await.unwrap();

    let early = h.service.rate(job.id, customer, 5, None).await.unwrap_err();
    assert!(matches!(early, DispatchError::InvalidTransition { from: JobStatus::Pending, event: "rate" }));

    h.service.respond(job.id, ids[0], JobResponse::Accept).await.unwrap();
    h.service.confirm_pickup(job.id, ids[0]).await.unwrap();
    h.service.confirm_delivery(job.id, ids[0], PaymentMethod::Cash).await.unwrap();

    for bad in [0, 6] {
        let err = h.service.rate(job.id, customer, bad, None).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }
    let long = "x".repeat(501);
    assert!(matches!(
        h.service.rate(job.id, customer, 4, Some(long)).await,
        Err(DispatchError::Validation(_))
    ));
    let stranger = h.service.rate(job.id, CustomerId::new(), 4, None).await.unwrap_err();
    assert!(stranger.is_conflict());

    let rating = h
        .service
        .rate(job.id, customer, 4, Some("  fast and friendly ".to_string()))
        .await
        .unwrap();
    assert_eq!(rating.comment.as_deref(), Some("fast and friendly"));
    assert_eq!(rating.courier_id, ids[0]);

    let again = h.service.rate(job.id, customer, 5, None).await.unwrap_err();
    assert!(matches!(again, DispatchError::Conflict(_)));
    assert_eq!(h.fleet.get(ids[0]).await.unwrap().average_rating(), Some(4.0));
}

#[tokio::test]
async fn job_without_couriers_is_canceled_with_its_fare() {
    let h = harness();
    let merchant = MerchantId::new();
    let mut merchant_rx = h.notifier.subscribe(&ChannelId::merchant(merchant));

    let job = h.service.create_job(new_job(merchant, None)).await.unwrap();

    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.fare.total_fare >= 20.0);
    assert_eq!(drain(&mut merchant_rx), vec!["job_canceled"]);
    assert_eq!(h.service.job(job.id).await.unwrap().status, JobStatus::Canceled);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_anything_is_stored() {
    let h = harness();
    let merchant = MerchantId::new();
    let mut request = new_job(merchant, None);
    request.origin = GeoPoint::new(91.0, 0.0);
    assert!(matches!(h.service.create_job(request).await, Err(DispatchError::Validation(_))));

    let mut request = new_job(merchant, None);
    request.destination_label = "   ".to_string();
    assert!(matches!(h.service.create_job(request).await, Err(DispatchError::Validation(_))));

    assert!(h.service.jobs_for_merchant(merchant).await.is_empty());
    assert!(h.service.engine().store().open_handles().await.is_empty());
    assert!(matches!(
        h.service.quote(SHOP, GeoPoint::new(0.0, 181.0)).await,
        Err(DispatchError::Validation(_))
    ));
}

#[tokio::test]
async fn every_courier_rejecting_cancels_the_job() {
    let h = harness();
    let ids = couriers(&h, 3).await;
    let job = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();

    let mut offered = Vec::new();
    for id in &ids {
        offered.push(h.service.pending_offers_for(*id).await.len());
        h.service.respond(job.id, *id, JobResponse::Reject).await.unwrap();
    }
    // Each courier saw the offer exactly when it was their turn
    assert_eq!(offered, vec![1, 1, 1]);

    let job = h.service.job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.offers.len(), 3);
    assert!(job.offers.iter().all(|o| o.status == OfferStatus::Rejected));
    let offered_to: Vec<_> = job.offers.iter().map(|o| o.courier_id).collect();
    assert_eq!(offered_to, ids);
    for id in &ids {
        assert_eq!(h.fleet.get(*id).await.unwrap().status, AgentStatus::Available);
    }
    assert!(h.service.engine().store().open_handles().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accept_and_reject_commit_exactly_once() {
    for _ in 0..50 {
        let h = harness();
        let ids = couriers(&h, 2).await;
        let (a, b) = (ids[0], ids[1]);
        let job_id = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap().id;

        let barrier = Arc::new(Barrier::new(2));
        let accept = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service.respond(job_id, a, JobResponse::Accept).await
            })
        };
        let reject = {
            let service = h.service.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                service.respond(job_id, a, JobResponse::Reject).await
            })
        };
        let (accepted, rejected) = (accept.await.unwrap(), reject.await.unwrap());
        let after = h.service.job(job_id).await.unwrap();

        match (accepted, rejected) {
            (Ok(_), Err(e)) => {
                assert!(e.is_conflict());
                assert_eq!(after.status, JobStatus::Assigned);
                assert_eq!(after.courier_id, Some(a));
                assert_eq!(after.offer_cursor, 0);
            }
            (Err(e), Ok(outcome)) => {
                assert!(e.is_conflict());
                assert_eq!(
                    outcome,
                    ResponseOutcome::Advanced { next: ChainResult::Offered { courier_id: b, sequence: 1 } }
                );
                assert_eq!(after.status, JobStatus::Pending);
                assert_eq!(after.offers[0].status, OfferStatus::Rejected);
                assert_eq!(h.fleet.get(a).await.unwrap().status, AgentStatus::Available);
            }
            (accepted, rejected) => panic!("expected exactly one winner, got {:?} and {:?}", accepted, rejected),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_courier_cannot_win_two_jobs_at_once() {
    let h = harness();
    let ids = couriers(&h, 1).await;
    let first = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();
    let second = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();

    let (x, y) = tokio::join!(
        h.service.respond(first.id, ids[0], JobResponse::Accept),
        h.service.respond(second.id, ids[0], JobResponse::Accept),
    );
    assert_eq!([x.is_ok(), y.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert_eq!(h.fleet.get(ids[0]).await.unwrap().status, AgentStatus::Busy);
}

#[tokio::test]
async fn merchant_can_skip_an_unanswered_offer() {
    let h = harness();
    let ids = couriers(&h, 2).await;
    let job = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();

    assert!(h.service.advance(job.id, 2).await.unwrap_err().is_conflict());
    let next = h.service.advance(job.id, 1).await.unwrap();
    assert_eq!(next, ChainResult::Offered { courier_id: ids[1], sequence: 1 });

    let job = h.service.job(job.id).await.unwrap();
    assert_eq!(job.offers[0].status, OfferStatus::Expired);
    assert!(h.service.pending_offers_for(ids[0]).await.is_empty());
    assert_eq!(h.service.pending_offers_for(ids[1]).await.len(), 1);
}

#[tokio::test]
async fn stale_offers_expire_when_ttl_is_set() {
    let h = harness_with(ChainConfig {
        offer_ttl_secs: Some(30),
        ..ChainConfig::default()
    });
    let ids = couriers(&h, 2).await;
    let job = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();
    let mut next_rx = h.notifier.subscribe(&ChannelId::courier(ids[1]));

    h.clock.advance(Duration::seconds(10));
    assert_eq!(h.service.expire_stale_offers().await, 0);

    h.clock.advance(Duration::seconds(25));
    assert_eq!(h.service.expire_stale_offers().await, 1);
    assert_eq!(drain(&mut next_rx), vec!["job_offered"]);

    h.clock.advance(Duration::seconds(31));
    h.service.expire_stale_offers().await;
    let job = h.service.job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.offers.iter().all(|o| o.status == OfferStatus::Expired));
}

#[tokio::test]
async fn offers_never_expire_without_ttl() {
    let h = harness();
    couriers(&h, 2).await;
    let job = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();

    h.clock.advance(Duration::days(1));
    assert_eq!(h.service.expire_stale_offers().await, 0);
    assert_eq!(h.service.job(job.id).await.unwrap().offers[0].status, OfferStatus::Sent);
}

#[tokio::test]
async fn location_reaches_parties_only_during_delivery() {
    let h = harness();
    let ids = couriers(&h, 1).await;
    let merchant = MerchantId::new();
    let customer = CustomerId::new();
    let mut merchant_rx = h.notifier.subscribe(&ChannelId::merchant(merchant));
    let mut customer_rx = h.notifier.subscribe(&ChannelId::customer(customer));

    let job = h.service.create_job(new_job(merchant, Some(customer))).await.unwrap();
    drain(&mut merchant_rx);

    h.service.update_location(ids[0], GeoPoint::new(41.0090, 28.9790)).await.unwrap();
    assert!(drain(&mut merchant_rx).is_empty());

    h.service.respond(job.id, ids[0], JobResponse::Accept).await.unwrap();
    drain(&mut merchant_rx);
    h.service.update_location(ids[0], GeoPoint::new(41.0100, 28.9800)).await.unwrap();

    assert_eq!(drain(&mut merchant_rx), vec!["courier_location"]);
    assert_eq!(drain(&mut customer_rx), vec!["courier_location"]);

    let record = h.fleet.get(ids[0]).await.unwrap();
    assert_eq!(record.location, Some(GeoPoint::new(41.0100, 28.9800)));
    assert!(matches!(
        h.service.update_location(ids[0], GeoPoint::new(0.0, 200.0)).await,
        Err(DispatchError::Validation(_))
    ));
}

#[tokio::test]
async fn unregistered_courier_cannot_go_online() {
    let h = harness();
    let err = h
        .service
        .set_availability(CourierId::new(), AgentStatus::Available)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(_)));

    let id = CourierId::new();
    h.fleet.register(AgentAvailability::new(id, VehicleKind::OnFoot)).await.unwrap();
    assert_eq!(
        h.service.set_availability(id, AgentStatus::Available).await.unwrap().status,
        AgentStatus::Available
    );
}

#[tokio::test]
async fn merchant_history_is_newest_first_and_capped() {
    let h = harness();
    couriers(&h, 1).await;
    let merchant = MerchantId::new();
    let other = h.service.create_job(new_job(MerchantId::new(), None)).await.unwrap();

    let mut created = Vec::new();
    for _ in 0..(MERCHANT_HISTORY_LIMIT + 2) {
        h.clock.advance(Duration::seconds(30));
        created.push(h.service.create_job(new_job(merchant, None)).await.unwrap().id);
    }

    let history = h.service.jobs_for_merchant(merchant).await;
    assert_eq!(history.len(), MERCHANT_HISTORY_LIMIT);
    assert_eq!(history[0].id, created[created.len() - 1]);
    assert_eq!(history[MERCHANT_HISTORY_LIMIT - 1].id, created[2]);
    assert!(history.iter().all(|j| j.merchant_id == merchant && j.id != other.id));
}

#[tokio::test]
async fn customer_sees_their_newest_live_job() {
    let h = harness();
    couriers(&h, 1).await;
    let customer = CustomerId::new();
    assert!(h.service.active_job_for_customer(customer).await.is_none());

    let first = h.service.create_job(new_job(MerchantId::new(), Some(customer))).await.unwrap();
    h.clock.advance(Duration::minutes(1));
    let second = h.service.create_job(new_job(MerchantId::new(), Some(customer))).await.unwrap();
    h.service.create_job(new_job(MerchantId::new(), Some(CustomerId::new()))).await.unwrap();

    let active = h.service.active_job_for_customer(customer).await.unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(active.status, JobStatus::Pending);

    // Once the newer one is canceled the older one shows again
    h.service.advance(second.id, 1).await.unwrap();
    assert_eq!(h.service.job(second.id).await.unwrap().status, JobStatus::Canceled);
    assert_eq!(h.service.active_job_for_customer(customer).await.unwrap().id, first.id);
}
