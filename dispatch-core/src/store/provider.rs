//! In-memory `ProviderStore` reference implementation backing the
//! Geo/Eligibility Index (§4.1).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Datelike;

use crate::error::CoreError;
use crate::types::{ProviderProfile, UserId};

use super::{EligibilityCriteria, ProviderStore};

#[derive(Default)]
pub struct InMemoryProviderStore {
    rows: Mutex<BTreeMap<String, ProviderProfile>>,
}

impl InMemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: ProviderProfile) {
        self.rows
            .lock()
            .unwrap()
            .insert(profile.provider_id.0.clone(), profile);
    }

    /// Test/seed helper; production location updates go through the
    /// `ProviderStore::update_location` trait method below.
    fn set_location(&self, provider_id: &UserId, location: crate::types::GeoPoint) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&provider_id.0) {
            row.location = location;
            row.location_updated_at = chrono::Utc::now();
        }
    }
}

fn is_eligible(p: &ProviderProfile, criteria: &EligibilityCriteria, now: chrono::DateTime<chrono::Utc>) -> bool {
    if !p.active || !p.verified {
        return false;
    }
    if !p.service_kinds.iter().any(|k| k == &criteria.service_kind) {
        return false;
    }
    if criteria.exclude_providers.contains(&p.provider_id) {
        return false;
    }

    let availability_ok = match criteria.scheduled_for {
        None => p.online,
        Some(scheduled_for) => {
            let day = scheduled_for.weekday();
            let time = scheduled_for.time();
            p.availability
                .get(&day)
                .map(|windows| windows.iter().any(|w| w.covers(time)))
                .unwrap_or(false)
        }
    };
    if !availability_ok {
        return false;
    }

    let age = now - p.location_updated_at;
    if age > criteria.location_freshness {
        return false;
    }

    let distance = p.location.distance_km(&criteria.center);
    if distance > criteria.radius_km {
        return false;
    }
    if p.service_radius_km < distance {
        return false;
    }

    true
}

/// Ascending sort key: `(distance, -rating, -completion_count,
/// 1/response_rate)`, ties broken by provider-id (§4.1).
fn rank_key(p: &ProviderProfile, distance: f64) -> (f64, f64, i64, f64, String) {
    let inv_response_rate = if p.response_rate > 0.0 {
        1.0 / p.response_rate
    } else {
        f64::INFINITY
    };
    (
        distance,
        -p.rating,
        -(p.completion_count as i64),
        inv_response_rate,
        p.provider_id.0.clone(),
    )
}

#[async_trait]
impl ProviderStore for InMemoryProviderStore {
    async fn find_eligible(
        &self,
        criteria: &EligibilityCriteria,
    ) -> Result<Vec<ProviderProfile>, CoreError> {
        let now = chrono::Utc::now();
        let rows = self.rows.lock().unwrap();
        let mut eligible: Vec<ProviderProfile> = rows
            .values()
            .filter(|p| is_eligible(p, criteria, now))
            .cloned()
            .collect();

        eligible.sort_by(|a, b| {
            let da = a.location.distance_km(&criteria.center);
            let db = b.location.distance_km(&criteria.center);
            rank_key(a, da)
                .partial_cmp(&rank_key(b, db))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        eligible.truncate(criteria.max_results);
        Ok(eligible)
    }

    async fn get_for_dispatch(
        &self,
        provider_id: &UserId,
    ) -> Result<Option<ProviderProfile>, CoreError> {
        Ok(self.rows.lock().unwrap().get(&provider_id.0).cloned())
    }

    async fn update_location(
        &self,
        provider_id: &UserId,
        location: crate::types::GeoPoint,
    ) -> Result<(), CoreError> {
        self.set_location(provider_id, location);
        Ok(())
    }
}
