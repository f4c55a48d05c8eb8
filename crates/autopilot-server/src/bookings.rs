//! Client for the external booking service. The control plane only
//! requests creation and reconciles ids; booking state stays remote.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use autopilot_orchestrator::{BookingRef, BookingService};
use autopilot_types::{Gap, Money};

pub struct HttpBookingClient {
    base_url: String,
    client: Client,
}

impl HttpBookingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl BookingService for HttpBookingClient {
    async fn create_booking(
        &self,
        tenant_id: &str,
        gap: &Gap,
        customer_id: &str,
    ) -> Result<BookingRef, String> {
        let url = format!("{}/internal/bookings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&json!({
                "tenant_id": tenant_id,
                "customer_id": customer_id,
                "staff_id": gap.staff_id,
                "date": gap.date,
                "start_time": gap.start_time,
                "duration_minutes": gap.duration_minutes,
                "service_id": gap.fittable_service_ids.first(),
                "source": "autopilot_gap_fill",
            }))
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = response.status();
        let value: Value = response.json().await.map_err(|err| err.to_string())?;
        if !status.is_success() {
            let detail = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("booking creation failed");
            return Err(format!("{status}: {detail}"));
        }

        let booking_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "booking response missing id".to_string())?
            .to_string();
        let amount = value.get("amount").and_then(|v| v.as_i64()).map(Money);
        Ok(BookingRef { booking_id, amount })
    }
}
