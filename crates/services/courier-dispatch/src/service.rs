use crate::engine::{DispatchEngine, NewJob, PendingOffer};
use crate::error::Result;
use crate::notifier::EventNotifier;
use crate::offer_chain::{ChainResult, Dispatch, JobResponse, ResponseOutcome};
use courier_types::{
    AgentAvailability, AgentStatus, CourierId, CustomerId, FareQuote, GeoPoint, Job, JobId, MerchantId, OutboundEvent,
    PaymentMethod, PaymentRecord, Rating, VehicleKind,
};
use std::sync::Arc;

/// Runs engine operations and publishes the events they produce.
pub struct DispatchService {
    engine: DispatchEngine,
    notifier: Arc<dyn EventNotifier>,
}

impl DispatchService {
    pub fn new(engine: DispatchEngine, notifier: Arc<dyn EventNotifier>) -> Self {
        Self { engine, notifier }
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    async fn publish(&self, events: &[OutboundEvent]) {
        for outbound in events {
            self.notifier.publish(&outbound.channel, &outbound.event).await;
        }
    }

    async fn settle<T>(&self, dispatch: Dispatch<T>) -> T {
        self.publish(&dispatch.events).await;
        dispatch.outcome
    }

    pub async fn quote(&self, origin: GeoPoint, destination: GeoPoint) -> Result<FareQuote> {
        self.engine.quote(origin, destination).await
    }

    pub async fn create_job(&self, request: NewJob) -> Result<Job> {
        let dispatch = self.engine.create_job(request).await?;
        Ok(self.settle(dispatch).await)
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        self.engine.job(job_id).await
    }

    pub async fn respond(&self, job_id: JobId, courier_id: CourierId, response: JobResponse) -> Result<ResponseOutcome> {
        let dispatch = self.engine.respond(job_id, courier_id, response).await?;
        Ok(self.settle(dispatch).await)
    }

    pub async fn advance(&self, job_id: JobId, position: usize) -> Result<ChainResult> {
        let dispatch = self.engine.advance(job_id, position).await?;
        Ok(self.settle(dispatch).await)
    }

    pub async fn confirm_pickup(&self, job_id: JobId, courier_id: CourierId) -> Result<()> {
        let dispatch = self.engine.confirm_pickup(job_id, courier_id).await?;
        self.settle(dispatch).await;
        Ok(())
    }

    pub async fn confirm_delivery(
        &self,
        job_id: JobId,
        courier_id: CourierId,
        method: PaymentMethod,
    ) -> Result<PaymentRecord> {
        let dispatch = self.engine.confirm_delivery(job_id, courier_id, method).await?;
        Ok(self.settle(dispatch).await)
    }

    pub async fn rate(
        &self,
        job_id: JobId,
        customer_id: CustomerId,
        score: u8,
        comment: Option<String>,
    ) -> Result<Rating> {
        let dispatch = self.engine.rate(job_id, customer_id, score, comment).await?;
        Ok(self.settle(dispatch).await)
    }

    pub async fn register_courier(&self, courier_id: CourierId, vehicle: VehicleKind) -> Result<AgentAvailability> {
        self.engine.register_courier(courier_id, vehicle).await
    }

    pub async fn set_availability(&self, courier_id: CourierId, status: AgentStatus) -> Result<AgentAvailability> {
        self.engine.set_availability(courier_id, status).await
    }

    pub async fn update_location(&self, courier_id: CourierId, location: GeoPoint) -> Result<()> {
        let dispatch = self.engine.update_location(courier_id, location).await?;
        self.settle(dispatch).await;
        Ok(())
    }

    pub async fn pending_offers_for(&self, courier_id: CourierId) -> Vec<PendingOffer> {
        self.engine.pending_offers_for(courier_id).await
    }

    pub async fn jobs_for_merchant(&self, merchant_id: MerchantId) -> Vec<Job> {
        self.engine.jobs_for_merchant(merchant_id).await
    }

    pub async fn active_job_for_customer(&self, customer_id: CustomerId) -> Option<Job> {
        self.engine.active_job_for_customer(customer_id).await
    }

    /// Returns how many notifications the sweep produced.
    pub async fn expire_stale_offers(&self) -> usize {
        let events = self.engine.expire_stale_offers().await;
        self.publish(&events).await;
        events.len()
    }
}

/// Runs the offer expiry sweep every `every` until the task is aborted.
pub fn spawn_expiry_task(service: Arc<DispatchService>, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let published = service.expire_stale_offers().await;
            if published > 0 {
                tracing::debug!("Offer expiry sweep published {} event(s)", published);
            }
        }
    })
}
