use crate::config::ChainConfig;
use crate::error::{DispatchError, Result};
use crate::fleet::{CandidateRanker, FleetDirectory};
use crate::lifecycle::{self, JobEvent};
use crate::metrics;
use chrono::{DateTime, Duration, Utc};
use courier_types::{
    ChannelId, CourierId, DispatchEvent, GeoPoint, Job, JobStatus, Offer, OfferStatus, OutboundEvent,
    RankedCandidate,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NO_COURIER_AVAILABLE: &str = "no courier available";
pub const NO_COURIER_ACCEPTED: &str = "no courier accepted";

/// The outcome of an operation plus the events the caller must publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch<T> {
    pub outcome: T,
    pub events: Vec<OutboundEvent>,
}

impl<T> Dispatch<T> {
    pub fn new(outcome: T, events: Vec<OutboundEvent>) -> Self {
        Self { outcome, events }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Dispatch<U> {
        Dispatch {
            outcome: f(self.outcome),
            events: self.events,
        }
    }
}

/// Where the chain stands after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChainResult {
    Offered { courier_id: CourierId, sequence: usize },
    /// No candidate left; the job is canceled.
    Exhausted,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobResponse {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Assigned { courier_id: CourierId },
    Advanced { next: ChainResult },
}

/// Walks a job through its ranked candidates one offer at a time.
///
/// Every method takes the job by `&mut` and expects the caller to hold the
/// job's lock for the duration of the call, so at most one step of a given
/// chain runs at a time.
pub struct OfferChain {
    ranker: Arc<dyn CandidateRanker>,
    fleet: Arc<dyn FleetDirectory>,
    config: ChainConfig,
}

impl OfferChain {
    pub fn new(ranker: Arc<dyn CandidateRanker>, fleet: Arc<dyn FleetDirectory>, config: ChainConfig) -> Self {
        Self { ranker, fleet, config }
    }

    /// Ranked candidates for `origin`. A failing ranker reads as nobody available.
    pub async fn rank(&self, origin: GeoPoint) -> Vec<RankedCandidate> {
        match self
            .ranker
            .rank(origin, self.config.max_candidates, self.config.max_radius_meters)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("Candidate ranking for {} failed: {}. Treating as no candidates.", origin, e);
                Vec::new()
            }
        }
    }

    pub fn start_chain(
        &self,
        job: &mut Job,
        candidates: &[RankedCandidate],
        now: DateTime<Utc>,
    ) -> Result<Dispatch<ChainResult>> {
        let Some(first) = candidates.first() else {
            lifecycle::apply(job, JobEvent::NoCandidates, now)?;
            metrics::record_job_canceled("no_candidates");
            return Ok(Dispatch::new(
                ChainResult::Exhausted,
                vec![canceled_event(job, NO_COURIER_AVAILABLE)],
            ));
        };

        lifecycle::apply(job, JobEvent::DispatchStarted, now)?;
        job.offer_cursor = 0;
        let offered = offer_event(job, first, 0, now);
        let created = OutboundEvent::new(
            ChannelId::merchant(job.merchant_id),
            DispatchEvent::JobCreated {
                job_id: job.id,
                status: job.status,
                fare: job.fare.clone(),
            },
        );
        Ok(Dispatch::new(
            ChainResult::Offered { courier_id: first.courier_id, sequence: 0 },
            vec![offered, created],
        ))
    }

    /// Moves the chain from the current offer to `position`, which must be
    /// the next one. An unanswered current offer is closed as expired.
    pub async fn advance(&self, job: &mut Job, position: usize, now: DateTime<Utc>) -> Result<Dispatch<ChainResult>> {
        if job.status != JobStatus::Pending {
            return Err(DispatchError::InvalidTransition {
                from: job.status,
                event: "advance",
            });
        }
        if position != job.offer_cursor + 1 {
            return Err(DispatchError::Conflict(format!(
                "job {} is at offer {}, cannot advance to {}",
                job.id, job.offer_cursor, position
            )));
        }
        if let Some(offer) = job.current_offer_mut().filter(|o| o.is_outstanding()) {
            offer.close(OfferStatus::Expired, now);
            metrics::record_offer("expired");
        }
        self.advance_to(job, position, now).await
    }

    pub async fn record_response(
        &self,
        job: &mut Job,
        courier_id: CourierId,
        response: JobResponse,
        now: DateTime<Utc>,
    ) -> Result<Dispatch<ResponseOutcome>> {
        let outstanding = job.status == JobStatus::Pending
            && job
                .current_offer()
                .is_some_and(|o| o.courier_id == courier_id && o.is_outstanding());
        if !outstanding {
            tracing::debug!("Stale {} from courier {} for job {}", response, courier_id, job.id);
            return Err(DispatchError::no_longer_available());
        }

        match response {
            JobResponse::Accept => {
                self.fleet.claim(courier_id).await?;

                lifecycle::apply(job, JobEvent::OfferAccepted, now)?;
                if let Some(offer) = job.current_offer_mut() {
                    offer.close(OfferStatus::Accepted, now);
                }
                job.courier_id = Some(courier_id);
                metrics::record_offer("accepted");

                let accepted = OutboundEvent::new(
                    ChannelId::merchant(job.merchant_id),
                    DispatchEvent::JobAccepted { job_id: job.id, courier_id },
                );
                Ok(Dispatch::new(ResponseOutcome::Assigned { courier_id }, vec![accepted]))
            }
            JobResponse::Reject => {
                if let Some(offer) = job.current_offer_mut() {
                    offer.close(OfferStatus::Rejected, now);
                }
                metrics::record_offer("rejected");
                let position = job.offer_cursor + 1;
                let next = self.advance_to(job, position, now).await?;
                Ok(next.map(|next| ResponseOutcome::Advanced { next }))
            }
        }
    }

    /// Expires the current offer if it has been outstanding for `ttl` and
    /// moves on. Returns `None` when there is nothing to expire.
    pub async fn expire_if_stale(
        &self,
        job: &mut Job,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Dispatch<ChainResult>>> {
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        let stale = job
            .current_offer()
            .is_some_and(|o| o.is_outstanding() && now - o.sent_at >= ttl);
        if !stale {
            return Ok(None);
        }
        tracing::info!("Offer {} of job {} expired unanswered", job.offer_cursor, job.id);
        let position = job.offer_cursor + 1;
        self.advance(job, position, now).await.map(Some)
    }

    async fn advance_to(&self, job: &mut Job, position: usize, now: DateTime<Utc>) -> Result<Dispatch<ChainResult>> {
        let candidates = self.rank(job.origin).await;
        job.offer_cursor = position;

        match candidates.get(position) {
            Some(candidate) => {
                let offered = offer_event(job, candidate, position, now);
                Ok(Dispatch::new(
                    ChainResult::Offered { courier_id: candidate.courier_id, sequence: position },
                    vec![offered],
                ))
            }
            None => {
                tracing::info!(
                    "Job {} ran out of candidates at position {} of {}",
                    job.id,
                    position,
                    candidates.len()
                );
                lifecycle::apply(job, JobEvent::CandidatesExhausted, now)?;
                metrics::record_job_canceled("exhausted");
                Ok(Dispatch::new(
                    ChainResult::Exhausted,
                    vec![canceled_event(job, NO_COURIER_ACCEPTED)],
                ))
            }
        }
    }
}

/// Records a new outstanding offer on the job and builds its notification.
fn offer_event(job: &mut Job, candidate: &RankedCandidate, sequence: usize, now: DateTime<Utc>) -> OutboundEvent {
    job.offers.push(Offer::sent(job.id, candidate.courier_id, sequence, now));
    metrics::record_offer("sent");
    tracing::info!(
        "Offered job {} to courier {} (position {}, {:.2} km away)",
        job.id,
        candidate.courier_id,
        sequence,
        candidate.distance_km
    );
    OutboundEvent::new(
        ChannelId::courier(candidate.courier_id),
        DispatchEvent::JobOffered {
            job_id: job.id,
            sequence,
            destination_label: job.destination_label.clone(),
            total_fare: job.fare.total_fare,
            distance_km: candidate.distance_km,
        },
    )
}

fn canceled_event(job: &Job, reason: &str) -> OutboundEvent {
    OutboundEvent::new(
        ChannelId::merchant(job.merchant_id),
        DispatchEvent::JobCanceled {
            job_id: job.id,
            reason: reason.to_string(),
        },
    )
}
