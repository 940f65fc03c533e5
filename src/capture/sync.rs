//! Pairing of the two camera streams by frame index.

use crate::capture::FrameSource;
use crate::core::frame::{CameraId, FrameIndex, RawImage, Resolution, skew_ns};
use crate::error::{StitchError, StitchResult};

/// Both cameras' frames for one index, still in host memory.
#[derive(Clone, Debug)]
pub struct RawPair {
    pub index: FrameIndex,
    pub left: RawImage,
    pub right: RawImage,
}

impl RawPair {
    pub fn timestamp_ns(&self) -> u64 {
        self.left.timestamp_ns.min(self.right.timestamp_ns)
    }
}

/// Accepts a pair only when its capture times differ by less than `tolerance_ns`.
pub fn check_sync(index: FrameIndex, left: &RawImage, right: &RawImage, tolerance_ns: u64) -> StitchResult<()> {
    let skew = skew_ns(left.timestamp_ns, right.timestamp_ns);
    if skew >= tolerance_ns {
        return Err(StitchError::sync(index, skew, tolerance_ns));
    }
    Ok(())
}

/// Reads the left and right streams in lockstep.
pub struct FramePairer {
    left: Box<dyn FrameSource>,
    right: Box<dyn FrameSource>,
    tolerance_ns: u64,
}

impl FramePairer {
    /// # Errors
    ///
    /// [`StitchError::Calibration`] when the sources are not cam0 and cam1 or disagree
    /// on resolution.
    pub fn new(left: Box<dyn FrameSource>, right: Box<dyn FrameSource>, tolerance_ns: u64) -> StitchResult<Self> {
        if left.camera() != CameraId::LEFT || right.camera() != CameraId::RIGHT {
            return Err(StitchError::calibration(
                "sources",
                format!("expected cam0 and cam1, got {} and {}", left.camera(), right.camera()),
            ));
        }
        if left.resolution() != right.resolution() {
            return Err(StitchError::calibration(
                "sources",
                format!("resolutions differ: {} vs {}", left.resolution(), right.resolution()),
            ));
        }
        Ok(Self {
            left,
            right,
            tolerance_ns,
        })
    }

    /// Pairs available in both streams.
    pub fn frame_count(&self) -> u64 {
        self.left.frame_count().min(self.right.frame_count())
    }

    pub fn resolution(&self) -> Resolution {
        self.left.resolution()
    }

    /// Camera ids and resolutions, for checking against a calibration profile.
    pub fn describe(&self) -> Vec<(CameraId, Resolution)> {
        vec![
            (self.left.camera(), self.left.resolution()),
            (self.right.camera(), self.right.resolution()),
        ]
    }

    /// Reads both cameras at `index`; `Ok(None)` once either stream has ended.
    pub fn read_pair(&mut self, index: FrameIndex) -> StitchResult<Option<RawPair>> {
        let Some(left) = self.left.read_frame(index)? else {
            return Ok(None);
        };
        let Some(right) = self.right.read_frame(index)? else {
            return Ok(None);
        };
        left.validate()?;
        right.validate()?;
        check_sync(index, &left, &right, self.tolerance_ns)?;
        Ok(Some(RawPair { index, left, right }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{FaultPlan, SyntheticRig};
    use crate::error::classify::{ErrorClass, class_of};

    #[test]
    fn test_pairer_reads_in_lockstep() {
        let rig = SyntheticRig::new(24, 12).frames(3);
        let (l, r) = rig.sources();
        let mut pairer = FramePairer::new(Box::new(l), Box::new(r), 1_000).unwrap();
        assert_eq!(pairer.frame_count(), 3);
        let pair = pairer.read_pair(1).unwrap().unwrap();
        assert_eq!(pair.left.camera, CameraId::LEFT);
        assert_eq!(pair.right.camera, CameraId::RIGHT);
        assert!(pairer.read_pair(3).unwrap().is_none());
    }

    #[test]
    fn test_skewed_pair_is_a_sync_rejection() {
        let rig = SyntheticRig::new(24, 12)
            .frames(4)
            .faults(FaultPlan::default().skew(2, 50_000_000));
        let (l, r) = rig.sources();
        let mut pairer = FramePairer::new(Box::new(l), Box::new(r), 8_000_000).unwrap();
        assert!(pairer.read_pair(1).is_ok());
        let err = pairer.read_pair(2).unwrap_err();
        assert_eq!(class_of(&err), ErrorClass::SyncRejection);
    }

    #[test]
    fn test_skew_equal_to_tolerance_is_rejected() {
        let rig = SyntheticRig::new(24, 12)
            .frames(2)
            .faults(FaultPlan::default().skew(1, 8_000_000));
        let (l, r) = rig.sources();
        let mut strict = FramePairer::new(Box::new(l), Box::new(r), 8_000_000).unwrap();
        let err = strict.read_pair(1).unwrap_err();
        assert!(matches!(err, StitchError::Sync { skew_ns: 8_000_000, .. }));

        let (l, r) = rig.sources();
        let mut loose = FramePairer::new(Box::new(l), Box::new(r), 8_000_001).unwrap();
        assert!(loose.read_pair(1).unwrap().is_some());
    }

    #[test]
    fn test_swapped_sources_are_rejected() {
        let rig = SyntheticRig::new(24, 12).frames(1);
        let (l, r) = rig.sources();
        assert!(FramePairer::new(Box::new(r), Box::new(l), 1_000).is_err());
    }
}
