//! # Calibration Profiles
//!
//! Read-only rig geometry for one job: per-camera lens model, the undistortion lookup
//! table built from it, the homography from each rectified camera into panorama space,
//! the overlap rectangles used for color statistics and the seam band used for alignment
//! and blending.
//!
//! Profiles are produced by an external calibration tool and stored as JSON documents
//! keyed by profile id. A profile is validated and its lookup tables are materialised once
//! at load; afterwards it is shared behind an `Arc` and never mutated.
//!
//! ## Document Layout
//!
//! ```json
//! {
//!   "profile_id": "stadium-north",
//!   "panorama": { "width": 3520, "height": 1080 },
//!   "seam": { "start_x": 1600, "end_x": 1920 },
//!   "cameras": [
//!     { "camera": 0, "raw_resolution": {..}, "intrinsics": {..}, "distortion": {..},
//!       "rectified_intrinsics": {..}, "rectified_resolution": {..},
//!       "to_panorama": [[1,0,0],[0,1,0],[0,0,1]], "overlap": {..} },
//!     { "camera": 1, .. }
//!   ]
//! }
//! ```

use crate::core::frame::{CameraId, Resolution};
use crate::error::{StitchError, StitchResult};
use pano_warp::Rect;
use pano_warp::lut::{CameraIntrinsics, Distortion, init_undistort_map};
use pano_warp::remap::RemapTable;
use pano_warp::warp::Homography;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Calibration of one camera as stored on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub camera: CameraId,
    pub raw_resolution: Resolution,
    pub intrinsics: CameraIntrinsics,
    #[serde(default)]
    pub distortion: Distortion,
    pub rectified_intrinsics: CameraIntrinsics,
    pub rectified_resolution: Resolution,
    /// Rectified pixel -> panorama pixel
    pub to_panorama: [[f64; 3]; 3],
    /// Region of the rectified image seen by both cameras
    pub overlap: Rect,
}

/// Horizontal panorama range in which the two cameras are blended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeamBand {
    pub start_x: u32,
    pub end_x: u32,
}

impl SeamBand {
    pub fn width(&self) -> u32 {
        self.end_x.saturating_sub(self.start_x)
    }
}

/// Serialized form of a [`CalibrationProfile`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDocument {
    pub profile_id: String,
    pub panorama: Resolution,
    pub seam: SeamBand,
    pub cameras: Vec<CameraModel>,
}

/// A validated camera model with its derived tables.
#[derive(Debug)]
pub struct CameraCalibration {
    pub model: CameraModel,
    /// Rectified pixel -> raw sensor position
    pub undistort: Arc<RemapTable>,
    pub to_panorama: Homography,
    pub from_panorama: Homography,
}

/// Immutable rig geometry for one job.
#[derive(Debug)]
pub struct CalibrationProfile {
    document: CalibrationDocument,
    left: CameraCalibration,
    right: CameraCalibration,
}

impl CalibrationProfile {
    /// Validates `document` and builds the undistortion tables.
    ///
    /// # Errors
    ///
    /// [`StitchError::Calibration`] when the camera set, resolutions, homographies or
    /// seam geometry are inconsistent.
    pub fn from_document(document: CalibrationDocument) -> StitchResult<Self> {
        let id = document.profile_id.clone();
        let mismatch = |reason: String| StitchError::calibration(id.clone(), reason);

        if document.panorama.is_empty() {
            return Err(mismatch(format!("empty panorama {}", document.panorama)));
        }
        let seam = document.seam;
        if seam.width() == 0 || seam.end_x > document.panorama.width {
            return Err(mismatch(format!(
                "seam band {}..{} outside panorama width {}",
                seam.start_x, seam.end_x, document.panorama.width
            )));
        }

        let mut left = None;
        let mut right = None;
        for model in &document.cameras {
            let slot = match model.camera {
                CameraId::LEFT => &mut left,
                CameraId::RIGHT => &mut right,
                other => return Err(mismatch(format!("unexpected camera {other}"))),
            };
            if slot.is_some() {
                return Err(mismatch(format!("camera {} listed twice", model.camera)));
            }
            *slot = Some(Self::build_camera(&id, model.clone())?);
        }
        let (Some(left), Some(right)) = (left, right) else {
            return Err(mismatch("profile must describe exactly cameras cam0 and cam1".to_string()));
        };

        if left.model.raw_resolution != right.model.raw_resolution {
            return Err(mismatch(format!(
                "raw resolutions differ: {} vs {}",
                left.model.raw_resolution, right.model.raw_resolution
            )));
        }
        if left.model.rectified_resolution != right.model.rectified_resolution {
            return Err(mismatch(format!(
                "rectified resolutions differ: {} vs {}",
                left.model.rectified_resolution, right.model.rectified_resolution
            )));
        }
        info!(
            profile = %id,
            raw = %left.model.raw_resolution,
            rectified = %left.model.rectified_resolution,
            panorama = %document.panorama,
            "calibration profile loaded"
        );
        Ok(Self { document, left, right })
    }

    fn build_camera(profile: &str, model: CameraModel) -> StitchResult<CameraCalibration> {
        let fail = |reason: String| StitchError::calibration(profile, format!("{}: {reason}", model.camera));

        if model.raw_resolution.is_empty() || model.rectified_resolution.is_empty() {
            return Err(fail("empty resolution".to_string()));
        }
        let rect = model.rectified_resolution;
        if !model.overlap.fits_within(rect.width, rect.height) {
            return Err(fail(format!("overlap {:?} outside rectified {}", model.overlap, rect)));
        }
        let to_panorama = Homography::from_rows(model.to_panorama);
        if !to_panorama.is_finite() {
            return Err(fail("homography has non-finite entries".to_string()));
        }
        let from_panorama = to_panorama
            .inverse()
            .map_err(|e| fail(format!("homography: {e}")))?;
        let undistort = init_undistort_map(
            &model.intrinsics,
            &model.distortion,
            &model.rectified_intrinsics,
            rect.width,
            rect.height,
        )
        .map_err(|e| fail(e.to_string()))?;

        Ok(CameraCalibration {
            model,
            undistort: Arc::new(undistort),
            to_panorama,
            from_panorama,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> StitchResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StitchError::calibration(path.display().to_string(), format!("cannot read profile: {e}"))
        })?;
        let document: CalibrationDocument = serde_json::from_str(&text).map_err(|e| {
            StitchError::calibration(path.display().to_string(), format!("malformed profile: {e}"))
        })?;
        Self::from_document(document)
    }

    pub fn profile_id(&self) -> &str {
        &self.document.profile_id
    }

    pub fn document(&self) -> &CalibrationDocument {
        &self.document
    }

    pub fn camera(&self, id: CameraId) -> StitchResult<&CameraCalibration> {
        match id {
            CameraId::LEFT => Ok(&self.left),
            CameraId::RIGHT => Ok(&self.right),
            other => Err(StitchError::calibration(
                self.profile_id(),
                format!("no calibration for {other}"),
            )),
        }
    }

    pub fn left(&self) -> &CameraCalibration {
        &self.left
    }

    pub fn right(&self) -> &CameraCalibration {
        &self.right
    }

    pub fn raw_resolution(&self) -> Resolution {
        self.left.model.raw_resolution
    }

    pub fn rectified_resolution(&self) -> Resolution {
        self.left.model.rectified_resolution
    }

    pub fn panorama(&self) -> Resolution {
        self.document.panorama
    }

    pub fn seam(&self) -> SeamBand {
        self.document.seam
    }

    /// The seam band as a full-height panorama rectangle.
    pub fn seam_rect(&self) -> Rect {
        let seam = self.document.seam;
        Rect::new(seam.start_x, 0, seam.width(), self.document.panorama.height)
    }

    /// Checks that the sources opened for a job deliver what this profile expects.
    pub fn verify_sources(&self, sources: &[(CameraId, Resolution)]) -> StitchResult<()> {
        for (camera, resolution) in sources {
            let expected = self.camera(*camera)?.model.raw_resolution;
            if *resolution != expected {
                return Err(StitchError::calibration(
                    self.profile_id(),
                    format!("{camera} delivers {resolution} frames, profile expects {expected}"),
                )
                .with_recovery_suggestion("Check that the job references the profile calibrated for these cameras"));
            }
        }
        Ok(())
    }
}

/// Directory of calibration profiles keyed by profile id.
#[derive(Clone, Debug)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, profile_id: &str) -> PathBuf {
        self.dir.join(format!("{profile_id}.json"))
    }

    /// Loads the profile stored under `profile_id`.
    ///
    /// # Errors
    ///
    /// Job-fatal [`StitchError::Calibration`] when the file is missing, malformed, or
    /// declares a different profile id.
    pub fn load(&self, profile_id: &str) -> StitchResult<Arc<CalibrationProfile>> {
        let profile = CalibrationProfile::load(self.path_for(profile_id))?;
        if profile.profile_id() != profile_id {
            return Err(StitchError::calibration(
                profile_id,
                format!("file declares profile '{}'", profile.profile_id()),
            ));
        }
        Ok(Arc::new(profile))
    }

    pub fn save(&self, document: &CalibrationDocument) -> StitchResult<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StitchError::io_at("create calibration dir", &self.dir, e))?;
        let path = self.path_for(&document.profile_id);
        let json = serde_json::to_string_pretty(document)?;
        std::fs::write(&path, json).map_err(|e| StitchError::io_at("write calibration", &path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: CameraId, offset_x: f64) -> CameraModel {
        let res = Resolution::new(16, 8);
        let intr = CameraIntrinsics::centered(16, 8, 20.0);
        CameraModel {
            camera: id,
            raw_resolution: res,
            intrinsics: intr,
            distortion: Distortion::default(),
            rectified_intrinsics: intr,
            rectified_resolution: res,
            to_panorama: [[1.0, 0.0, offset_x], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            overlap: Rect::new(if offset_x == 0.0 { 12 } else { 0 }, 0, 4, 8),
        }
    }

    fn document() -> CalibrationDocument {
        CalibrationDocument {
            profile_id: "bench".to_string(),
            panorama: Resolution::new(28, 8),
            seam: SeamBand { start_x: 12, end_x: 16 },
            cameras: vec![camera(CameraId::LEFT, 0.0), camera(CameraId::RIGHT, 12.0)],
        }
    }

    #[test]
    fn test_profile_builds_identity_table_without_distortion() {
        let profile = CalibrationProfile::from_document(document()).unwrap();
        assert_eq!(*profile.left().undistort, RemapTable::identity(16, 8));
        assert_eq!(profile.seam_rect(), Rect::new(12, 0, 4, 8));
        let (x, _) = profile.right().from_panorama.apply(12.0, 0.0).unwrap();
        assert!(x.abs() < 1e-12);
    }

    #[test]
    fn test_profile_rejects_inconsistent_geometry() {
        let mut doc = document();
        doc.cameras[1].rectified_resolution = Resolution::new(20, 8);
        doc.cameras[1].overlap = Rect::new(0, 0, 4, 8);
        assert_eq!(CalibrationProfile::from_document(doc).unwrap_err().category(), "calibration");

        let mut doc = document();
        doc.cameras.pop();
        assert!(CalibrationProfile::from_document(doc).is_err());

        let mut doc = document();
        doc.cameras[0].to_panorama = [[0.0; 3]; 3];
        assert!(CalibrationProfile::from_document(doc).is_err());

        let mut doc = document();
        doc.seam = SeamBand { start_x: 20, end_x: 40 };
        assert!(CalibrationProfile::from_document(doc).is_err());
    }

    #[test]
    fn test_verify_sources_detects_resolution_mismatch() {
        let profile = CalibrationProfile::from_document(document()).unwrap();
        assert!(profile.verify_sources(&[(CameraId::LEFT, Resolution::new(16, 8))]).is_ok());
        let err = profile
            .verify_sources(&[(CameraId::RIGHT, Resolution::new(32, 8))])
            .unwrap_err();
        assert!(crate::error::classify::is_fatal(&err));
    }

    #[test]
    fn test_store_round_trip_and_id_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        store.save(&document()).unwrap();
        let profile = store.load("bench").unwrap();
        assert_eq!(profile.profile_id(), "bench");

        std::fs::copy(store.path_for("bench"), store.path_for("other")).unwrap();
        let err = store.load("other").unwrap_err();
        assert_eq!(err.category(), "calibration");
        assert!(store.load("absent").is_err());
    }
}
