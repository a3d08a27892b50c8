//! Reservation and parking.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Operation, OperationSettings};
use crate::error::{SchedError, SchedResult};
use crate::hardware::{AltAz, Services};
use crate::schedule::{fields, Command, OperationTag};

fn equipment_ids(command: &Command) -> SchedResult<Vec<String>> {
    let ids = command.identifiers(fields::EQUIPMENT_LIST)?;
    if ids.is_empty() {
        return Err(SchedError::invalid(fields::EQUIPMENT_LIST, "no equipment selected"));
    }
    Ok(ids)
}

/// Acquires exclusive hold on the listed equipment.
#[derive(Debug, Clone)]
pub struct ReserveEquipment {
    ids: Vec<String>,
}

impl ReserveEquipment {
    /// Reserve step for `ids`.
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    /// Fails when the equipment list is empty.
    pub fn construct(command: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        Ok(Arc::new(Self::new(equipment_ids(command)?)))
    }

    /// Equipment to reserve.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

#[async_trait]
impl Operation for ReserveEquipment {
    fn tag(&self) -> OperationTag {
        OperationTag::ReserveEquipment
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        services.status.info(format!("Reserving {}", self.ids.join(", ")));
        services.equipment.reserve(&self.ids).await
    }
}

/// Releases the listed equipment. Succeeds when nothing is held.
#[derive(Debug, Clone)]
pub struct ReleaseEquipment {
    ids: Vec<String>,
}

impl ReleaseEquipment {
    /// Release step for `ids`.
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    /// Fails when the equipment list is empty.
    pub fn construct(command: &Command, _: &OperationSettings) -> SchedResult<Arc<dyn Operation>> {
        Ok(Arc::new(Self::new(equipment_ids(command)?)))
    }

    /// Equipment to release.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

#[async_trait]
impl Operation for ReleaseEquipment {
    fn tag(&self) -> OperationTag {
        OperationTag::ReleaseEquipment
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        services.status.info(format!("Releasing {}", self.ids.join(", ")));
        services.equipment.release(&self.ids).await
    }
}

/// Moves equipment to the fixed park orientation.
#[derive(Debug, Clone)]
pub struct ParkEquipment {
    ids: Vec<String>,
    position: AltAz,
}

impl ParkEquipment {
    /// Parks at the configured position.
    pub fn construct(
        command: &Command,
        settings: &OperationSettings,
    ) -> SchedResult<Arc<dyn Operation>> {
        Ok(Arc::new(Self {
            ids: equipment_ids(command)?,
            position: settings.park_position,
        }))
    }
}

#[async_trait]
impl Operation for ParkEquipment {
    fn tag(&self) -> OperationTag {
        OperationTag::ParkEquipment
    }

    async fn run(&self, services: &Services) -> SchedResult<()> {
        services.status.info(format!(
            "Parking {} at az {:.1}, el {:.1}",
            self.ids.join(", "),
            self.position.azimuth_deg,
            self.position.elevation_deg
        ));
        services.equipment.park(&self.ids, self.position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::catalog::Catalog;
    use crate::hardware::mock::{HwCall, MockRig};

    #[test]
    fn test_empty_equipment_list_is_invalid() {
        let cmd = Command::new(OperationTag::ParkEquipment).with(fields::EQUIPMENT_LIST, " , ");
        assert!(ParkEquipment::construct(&cmd, &OperationSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_park_uses_configured_position() {
        let rig = MockRig::new(Catalog::new());
        let cmd = Command::new(OperationTag::ParkEquipment).with(fields::EQUIPMENT_LIST, "1a,1c");
        let op = ParkEquipment::construct(&cmd, &OperationSettings::default()).unwrap();

        op.run(&rig.services()).await.unwrap();
        assert_eq!(
            rig.log.side_effects(),
            vec![HwCall::Park(vec!["1a".into(), "1c".into()])]
        );
        assert!(rig.status.contains("el 18.0"));
    }
}
