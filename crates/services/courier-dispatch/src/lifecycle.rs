use crate::error::{DispatchError, Result};
use crate::fleet::FleetDirectory;
use crate::metrics;
use crate::offer_chain::Dispatch;
use chrono::{DateTime, Utc};
use courier_types::{
    ChannelId, CourierId, CustomerId, DispatchEvent, Job, JobStatus, OutboundEvent, PaymentMethod,
    PaymentRecord, Rating,
};
use std::sync::Arc;

pub const MAX_COMMENT_CHARS: usize = 500;

/// Something that happened to a job and may move its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    DispatchStarted,
    NoCandidates,
    OfferAccepted,
    CandidatesExhausted,
    PickupConfirmed,
    DeliveryConfirmed,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::DispatchStarted => "dispatch_started",
            JobEvent::NoCandidates => "no_candidates",
            JobEvent::OfferAccepted => "offer_accepted",
            JobEvent::CandidatesExhausted => "candidates_exhausted",
            JobEvent::PickupConfirmed => "pickup_confirmed",
            JobEvent::DeliveryConfirmed => "delivery_confirmed",
        }
    }
}

/// The transition table. Anything not listed is an invalid transition.
pub fn next_status(from: JobStatus, event: JobEvent) -> Result<JobStatus> {
    use JobEvent::*;
    use JobStatus::*;

    match (from, event) {
        (Created, DispatchStarted) => Ok(Pending),
        (Created, NoCandidates) => Ok(Canceled),
        (Pending, OfferAccepted) => Ok(Assigned),
        (Pending, CandidatesExhausted) => Ok(Canceled),
        (Assigned, PickupConfirmed) => Ok(PickedUp),
        (PickedUp, DeliveryConfirmed) => Ok(Completed),
        (from, event) => Err(DispatchError::InvalidTransition {
            from,
            event: event.name(),
        }),
    }
}

/// Moves `job` along the table and stamps the matching timestamp.
/// On error the job is left untouched.
pub fn apply(job: &mut Job, event: JobEvent, now: DateTime<Utc>) -> Result<()> {
    let to = next_status(job.status, event)?;
    match to {
        JobStatus::Assigned => job.assigned_at = Some(now),
        JobStatus::PickedUp => job.picked_up_at = Some(now),
        JobStatus::Completed => job.delivered_at = Some(now),
        JobStatus::Canceled => job.canceled_at = Some(now),
        JobStatus::Created | JobStatus::Pending => {}
    }
    tracing::info!("Job {} {} -> {} ({})", job.id, job.status, to, event.name());
    job.status = to;
    Ok(())
}

fn require_assigned_courier(job: &Job, courier_id: CourierId) -> Result<()> {
    if job.courier_id != Some(courier_id) {
        return Err(DispatchError::Conflict(format!(
            "courier {} is not assigned to job {}",
            courier_id, job.id
        )));
    }
    Ok(())
}

/// Post-assignment steps of a job: pickup, delivery with payment, rating.
pub struct Lifecycle {
    fleet: Arc<dyn FleetDirectory>,
}

impl Lifecycle {
    pub fn new(fleet: Arc<dyn FleetDirectory>) -> Self {
        Self { fleet }
    }

    pub fn confirm_pickup(&self, job: &mut Job, courier_id: CourierId, now: DateTime<Utc>) -> Result<Dispatch<()>> {
        next_status(job.status, JobEvent::PickupConfirmed)?;
        require_assigned_courier(job, courier_id)?;

        apply(job, JobEvent::PickupConfirmed, now)?;
        Ok(Dispatch::new(
            (),
            vec![OutboundEvent::new(
                ChannelId::merchant(job.merchant_id),
                DispatchEvent::JobPickedUp { job_id: job.id },
            )],
        ))
    }

    /// Completes the job, records the payment and frees the courier.
    pub async fn confirm_delivery(
        &self,
        job: &mut Job,
        courier_id: CourierId,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Result<Dispatch<PaymentRecord>> {
        next_status(job.status, JobEvent::DeliveryConfirmed)?;
        require_assigned_courier(job, courier_id)?;

        self.fleet.release(courier_id).await?;

        apply(job, JobEvent::DeliveryConfirmed, now)?;
        let payment = PaymentRecord {
            job_id: job.id,
            amount: job.fare.total_fare,
            method,
            verified_at: now,
        };
        job.payment = Some(payment.clone());
        metrics::record_job_completed();
        tracing::info!("Job {} paid {} by {}", job.id, payment.amount, method);

        let event = DispatchEvent::DeliveryCompleted {
            job_id: job.id,
            payment_method: method,
        };
        let mut events = vec![OutboundEvent::new(ChannelId::merchant(job.merchant_id), event.clone())];
        if let Some(customer_id) = job.customer_id {
            events.push(OutboundEvent::new(ChannelId::customer(customer_id), event));
        }
        Ok(Dispatch::new(payment, events))
    }

    pub async fn rate(
        &self,
        job: &mut Job,
        customer_id: CustomerId,
        score: u8,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Dispatch<Rating>> {
        if !(1..=5).contains(&score) {
            return Err(DispatchError::Validation(format!("score must be between 1 and 5, got {}", score)));
        }
        let comment = comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        if comment.as_ref().is_some_and(|c| c.chars().count() > MAX_COMMENT_CHARS) {
            return Err(DispatchError::Validation(format!(
                "comment must be at most {} characters",
                MAX_COMMENT_CHARS
            )));
        }
        if job.status != JobStatus::Completed {
            return Err(DispatchError::InvalidTransition {
                from: job.status,
                event: "rate",
            });
        }
        if job.customer_id != Some(customer_id) {
            return Err(DispatchError::Conflict(format!(
                "customer {} did not receive job {}",
                customer_id, job.id
            )));
        }
        if job.rating.is_some() {
            return Err(DispatchError::Conflict(format!("job {} is already rated", job.id)));
        }
        let courier_id = job
            .courier_id
            .ok_or_else(|| anyhow::anyhow!("completed job {} has no courier", job.id))?;

        self.fleet.record_rating(courier_id, score).await?;

        let rating = Rating {
            job_id: job.id,
            rater: customer_id,
            courier_id,
            score,
            comment,
            rated_at: now,
        };
        job.rating = Some(rating.clone());
        tracing::info!("Job {} rated {} by customer {}", job.id, score, customer_id);
        Ok(Dispatch::new(rating, Vec::new()))
    }
}
