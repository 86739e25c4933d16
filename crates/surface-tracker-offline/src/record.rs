//! Persisted form of an offline surface.
//!
//! The location cache is stored only when every frame is resolved; a partial
//! cache is written as `null` and recomputed after loading. Bootstrap progress
//! lives under `added_in_player`. Records without it describe surfaces that
//! were fully defined before offline tracking started.

use log::warn;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surface_tracker_core::{
    Homography, LocationState, MarkerRegistry, RegisteredMarker, SurfaceTransforms,
};

use crate::{DefinitionBootstrapper, LocationCache};

/// Errors while decoding a persisted surface.
#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("invalid surface record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cache entry {index} is detected but has no `{field}`")]
    MissingTransform { index: usize, field: &'static str },
    #[error("cache entry {index} has a non-finite transform")]
    NonFiniteTransform { index: usize },
}

type Matrix = [[f64; 3]; 3];

/// One cache entry as stored on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedLocation {
    pub detected: bool,
    #[serde(default)]
    pub img_to_surf_trans: Option<Matrix>,
    #[serde(default)]
    pub surf_to_img_trans: Option<Matrix>,
    #[serde(default)]
    pub dist_img_to_surf_trans: Option<Matrix>,
    #[serde(default)]
    pub surf_to_dist_img_trans: Option<Matrix>,
    #[serde(default)]
    pub num_detected_markers: usize,
}

impl SerializedLocation {
    /// `None` for `Unknown`, which is never persisted.
    pub fn from_state(state: &LocationState) -> Option<Self> {
        match state {
            LocationState::Unknown => None,
            LocationState::NotDetected => Some(Self {
                detected: false,
                img_to_surf_trans: None,
                surf_to_img_trans: None,
                dist_img_to_surf_trans: None,
                surf_to_dist_img_trans: None,
                num_detected_markers: 0,
            }),
            LocationState::Detected {
                transforms,
                marker_count,
            } => Some(Self {
                detected: true,
                img_to_surf_trans: Some(transforms.img_to_surf.to_array()),
                surf_to_img_trans: Some(transforms.surf_to_img.to_array()),
                dist_img_to_surf_trans: Some(transforms.dist_img_to_surf.to_array()),
                surf_to_dist_img_trans: Some(transforms.surf_to_dist_img.to_array()),
                num_detected_markers: *marker_count,
            }),
        }
    }

    pub fn to_state(&self, index: usize) -> Result<LocationState, RecordError> {
        if !self.detected {
            return Ok(LocationState::NotDetected);
        }
        let matrix = |m: Option<Matrix>, field: &'static str| {
            let m = m.ok_or(RecordError::MissingTransform { index, field })?;
            if m.iter().flatten().all(|v| v.is_finite()) {
                Ok(Homography::from_array(m))
            } else {
                Err(RecordError::NonFiniteTransform { index })
            }
        };
        Ok(LocationState::Detected {
            transforms: SurfaceTransforms {
                img_to_surf: matrix(self.img_to_surf_trans, "img_to_surf_trans")?,
                surf_to_img: matrix(self.surf_to_img_trans, "surf_to_img_trans")?,
                dist_img_to_surf: matrix(self.dist_img_to_surf_trans, "dist_img_to_surf_trans")?,
                surf_to_dist_img: matrix(self.surf_to_dist_img_trans, "surf_to_dist_img_trans")?,
            },
            marker_count: self.num_detected_markers,
        })
    }
}

/// Bootstrap progress of a surface created during offline tracking.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddedInPlayer {
    #[serde(default)]
    pub start_idx: Option<usize>,
    #[serde(default)]
    pub observations_frame_idxs: Vec<usize>,
}

fn default_build_up_status() -> f32 {
    1.0
}

/// Everything persisted for one offline surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRecord {
    pub name: String,
    #[serde(default)]
    pub registered_markers_undist: Vec<RegisteredMarker>,
    #[serde(default)]
    pub registered_markers_dist: Vec<RegisteredMarker>,
    #[serde(default = "default_build_up_status")]
    pub build_up_status: f32,
    #[serde(default, deserialize_with = "lenient")]
    pub cache: Option<Vec<SerializedLocation>>,
    #[serde(default, deserialize_with = "lenient")]
    pub added_in_player: Option<AddedInPlayer>,
}

/// Decode an optional field, turning malformed data into `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(err) => {
            warn!("discarding malformed persisted field: {err}");
            Ok(None)
        }
    }
}

impl SurfaceRecord {
    pub fn from_json(value: &Value) -> Result<Self, RecordError> {
        Ok(Self::deserialize(value)?)
    }

    pub fn to_json(&self) -> Result<Value, RecordError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Persistable cache entries, or `None` while any frame is unresolved.
    pub fn encode_cache(cache: Option<&LocationCache>) -> Option<Vec<SerializedLocation>> {
        cache?.iter().map(SerializedLocation::from_state).collect()
    }

    /// The stored cache, if one was persisted.
    pub fn location_cache(&self) -> Result<Option<LocationCache>, RecordError> {
        let Some(entries) = &self.cache else {
            return Ok(None);
        };
        let states = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| entry.to_state(idx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(LocationCache::from_states(states)))
    }

    pub fn bootstrapper(&self) -> DefinitionBootstrapper {
        match &self.added_in_player {
            Some(added) => DefinitionBootstrapper::restore(
                added.start_idx,
                added.observations_frame_idxs.iter().copied(),
                self.build_up_status,
            ),
            None => DefinitionBootstrapper::already_defined(),
        }
    }

    pub fn registry_undist(&self) -> MarkerRegistry {
        to_registry(&self.registered_markers_undist)
    }

    pub fn registry_dist(&self) -> MarkerRegistry {
        to_registry(&self.registered_markers_dist)
    }
}

fn to_registry(markers: &[RegisteredMarker]) -> MarkerRegistry {
    markers.iter().map(|m| (m.id, m.clone())).collect()
}
