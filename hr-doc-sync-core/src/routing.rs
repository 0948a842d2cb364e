//! Location routing: which source locations are in scope, and which destination
//! folder each one delivers into.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// One named group of source locations sharing a delivery folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRoute {
    pub name: String,
    pub location_ids: Vec<i64>,
    pub folder: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("subject has no location")]
    NoLocation,
    #[error("location {0} has no delivery folder")]
    Unrouted(i64),
}

/// Immutable location → folder table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    folders: BTreeMap<i64, String>,
}

impl RoutingTable {
    /// Later routes win when a location id is listed twice.
    pub fn from_routes(routes: &[LocationRoute]) -> Self {
        let mut folders = BTreeMap::new();
        for route in routes {
            for id in &route.location_ids {
                if let Some(previous) = folders.insert(*id, route.folder.clone()) {
                    tracing::warn!(
                        location_id = id,
                        previous = %previous,
                        folder = %route.folder,
                        route = %route.name,
                        "Location listed in more than one route; last one wins"
                    );
                }
            }
        }
        Self { folders }
    }

    pub fn resolve(&self, location_id: Option<i64>) -> Result<&str, RoutingError> {
        let id = location_id.ok_or(RoutingError::NoLocation)?;
        self.folders
            .get(&id)
            .map(String::as_str)
            .ok_or(RoutingError::Unrouted(id))
    }

    /// The set of location ids eligible for synchronisation.
    pub fn locations(&self) -> HashSet<i64> {
        self.folders.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }
}
