use std::sync::Arc;

use validator::Validate;

use restraint_core::models::{ConsumerState, FacilitationMode, RestraintStepParameters};
use restraint_core::RestraintError;

use super::accounting::RestraintAccountingService;

/// Dry-run admission check run by the orchestrator before committing a step
/// to a potentially long wait. Never writes; the registration decision stays
/// authoritative.
#[derive(Clone)]
pub struct AdmissionFacilitator {
    accounting: Arc<RestraintAccountingService>,
}

impl AdmissionFacilitator {
    pub fn new(accounting: Arc<RestraintAccountingService>) -> Self {
        Self { accounting }
    }

    #[tracing::instrument(
        skip(self, parameters),
        fields(
            constraint_id = %parameters.resource_restraint_id,
            resource_unit = %parameters.resource_unit,
            permits = parameters.permits
        )
    )]
    pub async fn facilitate(
        &self,
        parameters: &RestraintStepParameters,
    ) -> Result<FacilitationMode, RestraintError> {
        parameters.validate()?;

        let request = self.accounting.effective_permits(parameters).await?;
        if request.is_satisfied() {
            tracing::debug!(
                already_held = request.already_held,
                "Permits already held, facilitating synchronously"
            );
            return Ok(FacilitationMode::Sync);
        }

        let restraint = self
            .accounting
            .get_constraint(&parameters.resource_restraint_id)
            .await?;
        let snapshot = self
            .accounting
            .unit_snapshot(&parameters.resource_restraint_id, &parameters.resource_unit)
            .await?;

        let mode = match restraint.decide_state(
            &parameters.resource_unit,
            request.to_request,
            &snapshot.consumers,
        )? {
            ConsumerState::Active => FacilitationMode::Sync,
            ConsumerState::Blocked | ConsumerState::Rejected => FacilitationMode::Async,
        };

        tracing::debug!(mode = ?mode, to_request = request.to_request, "Facilitation decided");
        Ok(mode)
    }
}
