//! Location path history for the map trail.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geofence;
use crate::lock;
use crate::shared::{Location, Point};
use crate::store::TypedStore;

pub const PATH_HISTORY_KEY: &str = "sentinelnet_path_history";
pub const MAX_PATH_POINTS: usize = 500;
/// Fixes closer than this to the last point are not recorded.
pub const MIN_MOVEMENT_METERS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl PathPoint {
    fn point(&self) -> Point {
        Point::new(self.lat, self.lng)
    }
}

pub struct PathHistory {
    store: TypedStore,
    points: Mutex<VecDeque<PathPoint>>,
}

impl PathHistory {
    pub fn open(store: TypedStore) -> Self {
        let loaded: Vec<PathPoint> = match store.get_json(PATH_HISTORY_KEY) {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                tracing::error!(target: "sentinel::store", "failed to load path history: {}", e);
                Vec::new()
            }
        };
        let skip = loaded.len().saturating_sub(MAX_PATH_POINTS);
        Self {
            store,
            points: Mutex::new(loaded.into_iter().skip(skip).collect()),
        }
    }

    /// Append a fix if it moved at least [`MIN_MOVEMENT_METERS`]. Returns true if recorded.
    pub fn record(&self, location: &Location) -> bool {
        if !location.point().is_valid() {
            return false;
        }
        let mut points = lock(&self.points);
        if let Some(last) = points.back() {
            if geofence::distance(last.point(), location.point()) < MIN_MOVEMENT_METERS {
                return false;
            }
        }
        points.push_back(PathPoint {
            lat: location.latitude,
            lng: location.longitude,
            accuracy: location.accuracy,
            timestamp: location.captured_at,
        });
        while points.len() > MAX_PATH_POINTS {
            points.pop_front();
        }
        if let Err(e) = self.store.put_json(PATH_HISTORY_KEY, &*points) {
            tracing::error!(target: "sentinel::store", "failed to save path history: {}", e);
        }
        tracing::debug!(target: "sentinel::tracker", points = points.len(), "path updated");
        true
    }

    pub fn clear(&self) {
        lock(&self.points).clear();
        if let Err(e) = self.store.delete(PATH_HISTORY_KEY) {
            tracing::error!(target: "sentinel::store", "failed to clear path history: {}", e);
        }
    }

    pub fn points(&self) -> Vec<PathPoint> {
        lock(&self.points).iter().cloned().collect()
    }

    /// `[lat, lng]` pairs, oldest first.
    pub fn coordinates(&self) -> Vec<[f64; 2]> {
        lock(&self.points).iter().map(|p| [p.lat, p.lng]).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.points).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn history() -> (PathHistory, TypedStore) {
        let store = TypedStore::new(Arc::new(MemoryStore::new()));
        (PathHistory::open(store.clone()), store)
    }

    #[test]
    fn skips_small_moves() {
        let (h, _) = history();
        assert!(h.record(&Location::new(12.9716, 77.5946, 5.0)));
        // ~1 m north
        assert!(!h.record(&Location::new(12.97161, 77.5946, 5.0)));
        // ~111 m north
        assert!(h.record(&Location::new(12.9726, 77.5946, 5.0)));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn keeps_last_500_and_persists() {
        let (h, store) = history();
        for i in 0..(MAX_PATH_POINTS + 20) {
            h.record(&Location::new(i as f64 * 0.001, 0.0, 5.0));
        }
        assert_eq!(h.len(), MAX_PATH_POINTS);
        assert_eq!(h.coordinates()[0], [20.0 * 0.001, 0.0]);

        let reopened = PathHistory::open(store);
        assert_eq!(reopened.len(), MAX_PATH_POINTS);
    }

    #[test]
    fn clear_empties_store() {
        let (h, store) = history();
        h.record(&Location::new(1.0, 1.0, 1.0));
        h.clear();
        assert!(h.is_empty());
        assert!(PathHistory::open(store).is_empty());
    }
}
