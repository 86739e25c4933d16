use serde::{Deserialize, Serialize};
use surface_tracker_core::SurfaceParams;

fn default_worker_thread_name() -> String {
    "surface-cache-filler".to_owned()
}

/// Configuration of an offline surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineParams {
    /// Surface definition and location tuning.
    #[serde(default)]
    pub surface: SurfaceParams,
    /// Name given to background fill threads.
    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,
}

impl Default for OfflineParams {
    fn default() -> Self {
        Self {
            surface: SurfaceParams::default(),
            worker_thread_name: default_worker_thread_name(),
        }
    }
}

impl OfflineParams {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let params =
            OfflineParams::from_json_str(r#"{ "surface": { "min_marker_perimeter": 60.0 } }"#)
                .expect("parse");
        assert_eq!(params.surface.min_marker_perimeter, 60.0);
        assert_eq!(params.surface.min_markers_for_detection, 1);
        assert_eq!(params.worker_thread_name, "surface-cache-filler");
    }
}
