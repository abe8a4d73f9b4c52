use crate::config::ChainConfig;
use crate::error::DispatchError;
use crate::fleet::{CandidateRanker, FleetDirectory, InMemoryFleet};
use crate::offer_chain::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_types::{
    AgentAvailability, AgentStatus, ChannelId, CourierId, CourierProfile, DispatchEvent, FareQuote, GeoPoint,
    Job, JobStatus, MerchantId, OfferStatus, RankedCandidate, VehicleKind, WeatherCondition,
};
use std::sync::{Arc, Mutex};

const ORIGIN: GeoPoint = GeoPoint { lat: 41.0082, lon: 28.9784 };

// Mock ranker returning whatever list the test sets
struct ScriptedRanker {
    candidates: Mutex<Vec<CourierId>>,
    should_fail: bool,
}

impl ScriptedRanker {
    fn new(candidates: Vec<CourierId>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            should_fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            candidates: Mutex::new(Vec::new()),
            should_fail: true,
        }
    }

    fn set(&self, candidates: Vec<CourierId>) {
        *self.candidates.lock().unwrap() = candidates;
    }
}

fn candidate(courier_id: CourierId, distance_km: f64) -> RankedCandidate {
    RankedCandidate {
        courier_id,
        distance_km,
        profile: CourierProfile {
            vehicle: VehicleKind::Motorcycle,
            completed_deliveries: 0,
            average_rating: None,
        },
    }
}

#[async_trait]
impl CandidateRanker for ScriptedRanker {
    async fn rank(
        &self,
        _origin: GeoPoint,
        max_results: usize,
        _max_radius_meters: f64,
    ) -> anyhow::Result<Vec<RankedCandidate>> {
        if self.should_fail {
            return Err(anyhow::anyhow!("Mock ranker error"));
        }
        Ok(self
            .candidates
            .lock()
            .unwrap()
            .iter()
            .take(max_results)
            .enumerate()
            .map(|(i, id)| candidate(*id, 0.5 + i as f64))
            .collect())
    }
}

struct Fixture {
    chain: OfferChain,
    ranker: Arc<ScriptedRanker>,
    fleet: Arc<InMemoryFleet>,
    couriers: Vec<CourierId>,
}

async fn fixture(courier_count: usize) -> Fixture {
    let fleet = Arc::new(InMemoryFleet::new());
    let mut couriers = Vec::new();
    for _ in 0..courier_count {
        let id = CourierId::new();
        fleet.register(AgentAvailability::new(id, VehicleKind::Motorcycle)).await.unwrap();
        fleet.set_status(id, AgentStatus::Available).await.unwrap();
        couriers.push(id);
    }
    let ranker = Arc::new(ScriptedRanker::new(couriers.clone()));
    Fixture {
        chain: OfferChain::new(ranker.clone(), fleet.clone(), ChainConfig::default()),
        ranker,
        fleet,
        couriers,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn new_job() -> Job {
    let fare = FareQuote {
        distance_km: 3.2,
        base_fare: 16.0,
        weather_multiplier: 1.0,
        weather_condition: WeatherCondition::Normal,
        night_surcharge: 0.0,
        total_fare: 20.0,
        computed_at: t0(),
    };
    Job::new(MerchantId::new(), None, ORIGIN, GeoPoint::new(41.02, 28.99), "Moda 12", None, fare, t0())
}

async fn started(f: &Fixture) -> Job {
    let mut job = new_job();
    let candidates = f.chain.rank(job.origin).await;
    f.chain.start_chain(&mut job, &candidates, t0()).unwrap();
    job
}

#[tokio::test]
async fn start_offers_nearest_candidate_and_notifies_merchant() {
    let f = fixture(3).await;
    let mut job = new_job();
    let candidates = f.chain.rank(job.origin).await;

    let dispatch = f.chain.start_chain(&mut job, &candidates, t0()).unwrap();

    assert_eq!(dispatch.outcome, ChainResult::Offered { courier_id: f.couriers[0], sequence: 0 });
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.offer_cursor, 0);
    assert_eq!(job.offers.len(), 1);
    assert_eq!(job.offers[0].status, OfferStatus::Sent);

    assert_eq!(dispatch.events.len(), 2);
    assert_eq!(dispatch.events[0].channel, ChannelId::courier(f.couriers[0]));
    assert!(matches!(
        dispatch.events[0].event,
        DispatchEvent::JobOffered { sequence: 0, total_fare, .. } if total_fare == 20.0
    ));
    assert_eq!(dispatch.events[1].channel, ChannelId::merchant(job.merchant_id));
    assert!(matches!(
        dispatch.events[1].event,
        DispatchEvent::JobCreated { status: JobStatus::Pending, .. }
    ));
}

#[tokio::test]
async fn start_without_candidates_cancels_and_keeps_fare() {
    let f = fixture(0).await;
    let mut job = new_job();

    let dispatch = f.chain.start_chain(&mut job, &[], t0()).unwrap();

    assert_eq!(dispatch.outcome, ChainResult::Exhausted);
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.canceled_at, Some(t0()));
    assert_eq!(job.fare.total_fare, 20.0);
    assert!(job.offers.is_empty());
    assert!(matches!(
        &dispatch.events[0].event,
        DispatchEvent::JobCanceled { reason, .. } if reason == NO_COURIER_AVAILABLE
    ));
}

#[tokio::test]
async fn failing_ranker_reads_as_no_candidates() {
    let fleet = Arc::new(InMemoryFleet::new());
    let chain = OfferChain::new(Arc::new(ScriptedRanker::failing()), fleet, ChainConfig::default());
    assert!(chain.rank(ORIGIN).await.is_empty());
}

#[tokio::test]
async fn reject_moves_to_next_candidate_in_order() {
    let f = fixture(3).await;
    let mut job = started(&f).await;
    let (a, b) = (f.couriers[0], f.couriers[1]);

    let dispatch = f
        .chain
        .record_response(&mut job, a, JobResponse::Reject, t0())
        .await
        .unwrap();

    assert_eq!(
        dispatch.outcome,
        ResponseOutcome::Advanced { next: ChainResult::Offered { courier_id: b, sequence: 1 } }
    );
    assert_eq!(job.offer_cursor, 1);
    assert_eq!(job.offers[0].status, OfferStatus::Rejected);
    assert_eq!(job.offers[0].responded_at, Some(t0()));
    assert_eq!(job.current_offer().map(|o| o.courier_id), Some(b));
    assert_eq!(dispatch.events.len(), 1);
    assert_eq!(dispatch.events[0].channel, ChannelId::courier(b));
}

#[tokio::test]
async fn accept_assigns_and_claims_courier() {
    let f = fixture(2).await;
    let mut job = started(&f).await;
    let a = f.couriers[0];

    let dispatch = f
        .chain
        .record_response(&mut job, a, JobResponse::Accept, t0())
        .await
        .unwrap();

    assert_eq!(dispatch.outcome, ResponseOutcome::Assigned { courier_id: a });
    assert_eq!(job.status, JobStatus::Assigned);
    assert_eq!(job.courier_id, Some(a));
    assert_eq!(job.assigned_at, Some(t0()));
    assert_eq!(job.offers[0].status, OfferStatus::Accepted);
    assert_eq!(f.fleet.get(a).await.unwrap().status, AgentStatus::Busy);
    assert_eq!(
        dispatch.events[0].event,
        DispatchEvent::JobAccepted { job_id: job.id, courier_id: a }
    );

    // A late duplicate loses
    let err = f
        .chain
        .record_response(&mut job, a, JobResponse::Accept, t0())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn responses_from_other_couriers_change_nothing() {
    let f = fixture(3).await;
    let mut job = started(&f).await;
    let before = job.clone();

    for response in [JobResponse::Accept, JobResponse::Reject] {
        let err = f
            .chain
            .record_response(&mut job, f.couriers[1], response, t0())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
    assert_eq!(job, before);
    assert_eq!(f.fleet.get(f.couriers[1]).await.unwrap().status, AgentStatus::Available);
}

#[tokio::test]
async fn busy_courier_cannot_accept_a_second_job() {
    let f = fixture(1).await;
    let a = f.couriers[0];
    let mut first = started(&f).await;
    let mut second = started(&f).await;

    f.chain
        .record_response(&mut first, a, JobResponse::Accept, t0())
        .await
        .unwrap();
    let err = f
        .chain
        .record_response(&mut second, a, JobResponse::Accept, t0())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Conflict(_)));
    assert_eq!(second.status, JobStatus::Pending);
    assert_eq!(second.offers[0].status, OfferStatus::Sent);
}

#[tokio::test]
async fn exhausting_candidates_cancels_without_busy_couriers() {
    let f = fixture(2).await;
    let mut job = started(&f).await;

    f.chain
        .record_response(&mut job, f.couriers[0], JobResponse::Reject, t0())
        .await
        .unwrap();
    let dispatch = f
        .chain
        .record_response(&mut job, f.couriers[1], JobResponse::Reject, t0())
        .await
        .unwrap();

    assert_eq!(dispatch.outcome, ResponseOutcome::Advanced { next: ChainResult::Exhausted });
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.offer_cursor, 2);
    assert!(matches!(
        &dispatch.events[0].event,
        DispatchEvent::JobCanceled { reason, .. } if reason == NO_COURIER_ACCEPTED
    ));
    for id in &f.couriers {
        assert_eq!(f.fleet.get(*id).await.unwrap().status, AgentStatus::Available);
    }
}

#[tokio::test]
async fn advance_uses_fresh_ranking() {
    let f = fixture(3).await;
    let mut job = started(&f).await;

    // C moved closer than B since the chain started
    f.ranker.set(vec![f.couriers[0], f.couriers[2], f.couriers[1]]);
    let dispatch = f
        .chain
        .record_response(&mut job, f.couriers[0], JobResponse::Reject, t0())
        .await
        .unwrap();

    assert_eq!(
        dispatch.outcome,
        ResponseOutcome::Advanced { next: ChainResult::Offered { courier_id: f.couriers[2], sequence: 1 } }
    );
}

#[tokio::test]
async fn external_advance_requires_next_position() {
    let f = fixture(3).await;
    let mut job = started(&f).await;

    for wrong in [0, 2, 5] {
        let err = f.chain.advance(&mut job, wrong, t0()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Conflict(_)));
    }
    assert_eq!(job.offers[0].status, OfferStatus::Sent);

    let dispatch = f.chain.advance(&mut job, 1, t0()).await.unwrap();
    assert_eq!(dispatch.outcome, ChainResult::Offered { courier_id: f.couriers[1], sequence: 1 });
    assert_eq!(job.offers[0].status, OfferStatus::Expired);

    // The superseded courier can no longer answer
    let err = f
        .chain
        .record_response(&mut job, f.couriers[0], JobResponse::Accept, t0())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn advance_on_settled_job_is_invalid() {
    let f = fixture(1).await;
    let mut job = started(&f).await;
    f.chain
        .record_response(&mut job, f.couriers[0], JobResponse::Accept, t0())
        .await
        .unwrap();

    let err = f.chain.advance(&mut job, 1, t0()).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::InvalidTransition { from: JobStatus::Assigned, event: "advance" }
    ));
}

#[tokio::test]
async fn stale_offer_expires_after_ttl() {
    let f = fixture(2).await;
    let mut job = started(&f).await;
    let ttl = Duration::seconds(30);

    let early = f
        .chain
        .expire_if_stale(&mut job, ttl, t0() + Duration::seconds(29))
        .await
        .unwrap();
    assert!(early.is_none());

    let expired = f
        .chain
        .expire_if_stale(&mut job, ttl, t0() + Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(expired.outcome, ChainResult::Offered { courier_id: f.couriers[1], sequence: 1 });
    assert_eq!(job.offers[0].status, OfferStatus::Expired);
    assert_eq!(job.offers[1].sent_at, t0() + Duration::seconds(30));
}
