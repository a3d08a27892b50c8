//! Exclusive hold on the shared equipment for one execution attempt.

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use super::operations::{Operation, ReleaseEquipment, ReserveEquipment};
use crate::error::{SchedError, SchedResult};
use crate::hardware::Services;

/// Proof that the equipment is held. Consumed by [`ReservationToken::release`].
///
/// A token dropped without an explicit release (the owning future was
/// cancelled, or the orchestrator panicked) releases in a background task on
/// the current runtime. Outside a runtime the leak can only be logged.
#[must_use = "a reservation must be released"]
pub struct ReservationToken {
    ids: Vec<String>,
    services: Services,
    released: bool,
}

impl ReservationToken {
    /// Reserves `ids`. Any failure is reported as a `Reservation` error.
    pub async fn acquire(services: &Services, ids: Vec<String>) -> SchedResult<Self> {
        ReserveEquipment::new(ids.clone())
            .run(services)
            .await
            .map_err(|err| match err {
                SchedError::Reservation(_) => err,
                other => SchedError::Reservation(other.to_string()),
            })?;
        info!(equipment = ?ids, "Equipment reserved");
        Ok(Self {
            ids,
            services: services.clone(),
            released: false,
        })
    }

    /// Equipment held by this token.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Releases the hold. A failed release is not retried on drop.
    pub async fn release(mut self) -> SchedResult<()> {
        self.released = true;
        let result = ReleaseEquipment::new(self.ids.clone())
            .run(&self.services)
            .await;
        match &result {
            Ok(()) => info!(equipment = ?self.ids, "Equipment released"),
            Err(err) => error!(equipment = ?self.ids, %err, "Releasing equipment failed"),
        }
        result
    }
}

impl std::fmt::Debug for ReservationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationToken")
            .field("ids", &self.ids)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let Ok(runtime) = Handle::try_current() else {
            error!(equipment = ?ids, "Reservation dropped outside a runtime, equipment is still held");
            return;
        };
        warn!(equipment = ?ids, "Reservation dropped without release, releasing in the background");
        let services = self.services.clone();
        runtime.spawn(async move {
            match ReleaseEquipment::new(ids.clone()).run(&services).await {
                Ok(()) => info!(equipment = ?ids, "Equipment released after drop"),
                Err(err) => error!(equipment = ?ids, %err, "Releasing dropped reservation failed"),
            }
        });
    }
}
