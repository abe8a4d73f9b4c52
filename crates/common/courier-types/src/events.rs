use crate::geo::GeoPoint;
use crate::identity::{ChannelId, CourierId};
use crate::jobs::{FareQuote, JobId, JobStatus, PaymentMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events pushed to participants' channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A job is offered to one courier.
    JobOffered {
        job_id: JobId,
        sequence: usize,
        destination_label: String,
        total_fare: f64,
        /// Courier's distance to the pickup point.
        distance_km: f64,
    },
    /// The merchant's job is searching for a courier.
    JobCreated {
        job_id: JobId,
        status: JobStatus,
        fare: FareQuote,
    },
    JobAccepted {
        job_id: JobId,
        courier_id: CourierId,
    },
    JobPickedUp {
        job_id: JobId,
    },
    DeliveryCompleted {
        job_id: JobId,
        payment_method: PaymentMethod,
    },
    CourierLocation {
        job_id: JobId,
        location: GeoPoint,
        at: DateTime<Utc>,
    },
    JobCanceled {
        job_id: JobId,
        reason: String,
    },
}

impl DispatchEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::JobOffered { .. } => "job_offered",
            DispatchEvent::JobCreated { .. } => "job_created",
            DispatchEvent::JobAccepted { .. } => "job_accepted",
            DispatchEvent::JobPickedUp { .. } => "job_picked_up",
            DispatchEvent::DeliveryCompleted { .. } => "delivery_completed",
            DispatchEvent::CourierLocation { .. } => "courier_location",
            DispatchEvent::JobCanceled { .. } => "job_canceled",
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            DispatchEvent::JobOffered { job_id, .. }
            | DispatchEvent::JobCreated { job_id, .. }
            | DispatchEvent::JobAccepted { job_id, .. }
            | DispatchEvent::JobPickedUp { job_id }
            | DispatchEvent::DeliveryCompleted { job_id, .. }
            | DispatchEvent::CourierLocation { job_id, .. }
            | DispatchEvent::JobCanceled { job_id, .. } => *job_id,
        }
    }
}

/// An event addressed to a channel, waiting to be published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub channel: ChannelId,
    pub event: DispatchEvent,
}

impl OutboundEvent {
    pub fn new(channel: ChannelId, event: DispatchEvent) -> Self {
        Self { channel, event }
    }
}
