//! Geo/Eligibility Index (component A, §4.1). A thin, stateless facade over
//! the provider projection: the ranking and filtering logic lives with the
//! store implementation that owns the projection's data, per §6.3's note
//! that `find_eligible` is the store operation this component is built on.

use std::sync::Arc;

use crate::error::CoreError;
use crate::store::{EligibilityCriteria, ProviderStore};
use crate::types::ProviderProfile;

#[derive(Clone)]
pub struct EligibilityIndex {
    providers: Arc<dyn ProviderStore>,
}

impl EligibilityIndex {
    pub fn new(providers: Arc<dyn ProviderStore>) -> Self {
        Self { providers }
    }

    /// Returns at most `criteria.max_results` eligible providers, ranked
    /// nearest-and-best first. Never fails the call (§4.1); a lookup error
    /// from the underlying store degrades to an empty result, since the
    /// Dispatcher Loop's failure semantics (§4.9) already treat "no
    /// candidates this tick" as a retryable, non-fatal outcome.
    pub async fn query(&self, criteria: &EligibilityCriteria) -> Vec<ProviderProfile> {
        self.providers
            .find_eligible(criteria)
            .await
            .unwrap_or_default()
    }

    pub async fn get_for_dispatch(
        &self,
        provider_id: &crate::types::UserId,
    ) -> Result<Option<ProviderProfile>, CoreError> {
        self.providers.get_for_dispatch(provider_id).await
    }
}
