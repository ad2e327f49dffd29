//! Parameter-vector assembly/disassembly for the LM solver (§4.8 ¶1):
//! free feature coordinates, free camera rotations (raw quaternion
//! components with a soft unit-norm residual rather than a tangent-space
//! reparameterization, so the quaternion unit-norm residual type in §4.8
//! has something to act on), free camera positions, and optionally camera
//! intrinsics.

use std::collections::HashMap;

use nalgebra::DVector;

use crate::project::{FeatureId, Project, ViewpointId, AXIS_X, AXIS_Y, AXIS_Z};

/// `optimize_camera_intrinsics` from §6's options table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicsMode {
    Always,
    Never,
    /// Free only when no vanishing lines were used for this camera and no
    /// single-axis-only ambiguity remains project-wide (§4.8 last ¶).
    Auto,
}

impl Default for IntrinsicsMode {
    fn default() -> Self {
        IntrinsicsMode::Auto
    }
}

/// Maps every free scalar in the project onto a column of the LM parameter
/// vector. Built once per solve call (dimensions never change mid-solve).
#[derive(Debug, Clone, Default)]
pub struct ParamLayout {
    pub feature_axis: HashMap<(FeatureId, usize), usize>,
    /// Base index of the 4 raw quaternion params `[w, x, y, z]`.
    pub camera_rotation: HashMap<ViewpointId, usize>,
    /// Base index of the 3 position params `[x, y, z]`.
    pub camera_position: HashMap<ViewpointId, usize>,
    /// Base index of the 10 intrinsics params
    /// `[focal_length, cx, cy, aspect_ratio, skew, k1, k2, k3, p1, p2]`.
    pub camera_intrinsics: HashMap<ViewpointId, usize>,
    pub n_params: usize,
}

pub const INTRINSICS_BLOCK_SIZE: usize = 10;

fn camera_is_free(project: &Project, id: ViewpointId) -> bool {
    let vp = project.viewpoint(id);
    vp.enabled_in_solve && !vp.is_pose_locked
}

fn intrinsics_free(project: &Project, id: ViewpointId, mode: IntrinsicsMode, has_axis_ambiguity: bool) -> bool {
    if !camera_is_free(project, id) {
        return false;
    }
    match mode {
        IntrinsicsMode::Always => true,
        IntrinsicsMode::Never => false,
        IntrinsicsMode::Auto => project.viewpoint(id).vanishing_lines_count() == 0 && !has_axis_ambiguity,
    }
}

impl ParamLayout {
    /// Build a layout from the project's current state. `has_axis_ambiguity`
    /// is true when any ambiguous axis-constrained line remains in the
    /// project (drives the `Auto` intrinsics rule, §4.8).
    pub fn build(project: &Project, intrinsics_mode: IntrinsicsMode, has_axis_ambiguity: bool) -> Self {
        Self::build_excluding(project, intrinsics_mode, has_axis_ambiguity, &std::collections::HashSet::new())
    }

    /// Like [`Self::build`] but holds every axis of `excluded_features` fixed
    /// regardless of lock state. Used for the Stage-1 multi-camera solve
    /// (§4.8, §2), which defers single-camera back-projected points to the
    /// Full BA pass rather than letting them move freely alongside points
    /// triangulated from multiple cameras.
    pub fn build_excluding(
        project: &Project,
        intrinsics_mode: IntrinsicsMode,
        has_axis_ambiguity: bool,
        excluded_features: &std::collections::HashSet<FeatureId>,
    ) -> Self {
        let mut layout = ParamLayout::default();
        let mut next = 0usize;

        for fid in project.feature_ids() {
            if excluded_features.contains(&fid) {
                continue;
            }
            let feat = project.feature(fid);
            for axis in [AXIS_X, AXIS_Y, AXIS_Z] {
                if feat.is_axis_free(axis) {
                    layout.feature_axis.insert((fid, axis), next);
                    next += 1;
                }
            }
        }

        for vid in project.viewpoint_ids() {
            if !camera_is_free(project, vid) {
                continue;
            }
            layout.camera_rotation.insert(vid, next);
            next += 4;
            layout.camera_position.insert(vid, next);
            next += 3;
            if intrinsics_free(project, vid, intrinsics_mode, has_axis_ambiguity) {
                layout.camera_intrinsics.insert(vid, next);
                next += INTRINSICS_BLOCK_SIZE;
            }
        }

        layout.n_params = next;
        layout
    }

    pub fn is_feature_axis_free(&self, fid: FeatureId, axis: usize) -> bool {
        self.feature_axis.contains_key(&(fid, axis))
    }

    pub fn is_camera_free(&self, vid: ViewpointId) -> bool {
        self.camera_rotation.contains_key(&vid)
    }

    pub fn is_intrinsics_free(&self, vid: ViewpointId) -> bool {
        self.camera_intrinsics.contains_key(&vid)
    }
}

/// Read the current project state into a parameter vector matching `layout`.
pub fn extract_params(project: &Project, layout: &ParamLayout) -> DVector<f64> {
    let mut x = DVector::zeros(layout.n_params);
    for (&(fid, axis), &idx) in &layout.feature_axis {
        x[idx] = project.feature(fid).optimized_xyz[axis];
    }
    for (&vid, &idx) in &layout.camera_rotation {
        let q = project.viewpoint(vid).rotation.quaternion();
        x[idx] = q.w;
        x[idx + 1] = q.i;
        x[idx + 2] = q.j;
        x[idx + 3] = q.k;
    }
    for (&vid, &idx) in &layout.camera_position {
        let p = project.viewpoint(vid).position;
        x[idx] = p.x;
        x[idx + 1] = p.y;
        x[idx + 2] = p.z;
    }
    for (&vid, &idx) in &layout.camera_intrinsics {
        let intr = &project.viewpoint(vid).intrinsics;
        let vals = [
            intr.focal_length,
            intr.cx,
            intr.cy,
            intr.aspect_ratio,
            intr.skew,
            intr.k1,
            intr.k2,
            intr.k3,
            intr.p1,
            intr.p2,
        ];
        for (k, v) in vals.into_iter().enumerate() {
            x[idx + k] = v;
        }
    }
    x
}

/// Write a parameter vector back onto the project. The raw quaternion is
/// re-normalized on write-back only when `renormalize_rotations` is set
/// (the inner LM loop keeps the raw, possibly slightly non-unit quaternion
/// so the unit-norm residual has a real gradient to act on; the
/// orchestrator renormalizes once the phase has converged, per the
/// testable property in §8 item 1).
pub fn apply_params(project: &mut Project, layout: &ParamLayout, x: &DVector<f64>, renormalize_rotations: bool) {
    for (&(fid, axis), &idx) in &layout.feature_axis {
        project.feature_mut(fid).optimized_xyz[axis] = x[idx];
    }
    for (&vid, &idx) in &layout.camera_rotation {
        let raw = nalgebra::Quaternion::new(x[idx], x[idx + 1], x[idx + 2], x[idx + 3]);
        let q = if renormalize_rotations {
            nalgebra::UnitQuaternion::new_normalize(raw)
        } else {
            nalgebra::UnitQuaternion::new_unchecked(raw)
        };
        project.viewpoint_mut(vid).rotation = q;
    }
    for (&vid, &idx) in &layout.camera_position {
        project.viewpoint_mut(vid).position = nalgebra::Vector3::new(x[idx], x[idx + 1], x[idx + 2]);
    }
    for (&vid, &idx) in &layout.camera_intrinsics {
        let vp = project.viewpoint_mut(vid);
        vp.intrinsics.focal_length = x[idx];
        vp.intrinsics.cx = x[idx + 1];
        vp.intrinsics.cy = x[idx + 2];
        vp.intrinsics.aspect_ratio = x[idx + 3];
        vp.intrinsics.skew = x[idx + 4];
        vp.intrinsics.k1 = x[idx + 5];
        vp.intrinsics.k2 = x[idx + 6];
        vp.intrinsics.k3 = x[idx + 7];
        vp.intrinsics.p1 = x[idx + 8];
        vp.intrinsics.p2 = x[idx + 9];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;

    #[test]
    fn locked_axes_get_no_param() {
        let mut project = Project::new();
        let f = project.add_feature("p");
        project.feature_mut(f).locked_xyz = [Some(1.0), None, None];
        let layout = ParamLayout::build(&project, IntrinsicsMode::Never, false);
        assert!(!layout.is_feature_axis_free(f, AXIS_X));
        assert!(layout.is_feature_axis_free(f, AXIS_Y));
        assert!(layout.is_feature_axis_free(f, AXIS_Z));
    }

    #[test]
    fn extract_then_apply_round_trips() {
        let mut project = Project::new();
        let f = project.add_feature("p");
        project.feature_mut(f).optimized_xyz = nalgebra::Vector3::new(1.0, 2.0, 3.0);
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).position = nalgebra::Vector3::new(4.0, 5.0, 6.0);
        let layout = ParamLayout::build(&project, IntrinsicsMode::Always, false);
        let x = extract_params(&project, &layout);
        let mut project2 = project.clone();
        project2.feature_mut(f).optimized_xyz = nalgebra::Vector3::zeros();
        project2.viewpoint_mut(v).position = nalgebra::Vector3::zeros();
        apply_params(&mut project2, &layout, &x, true);
        assert_eq!(project2.feature(f).optimized_xyz, project.feature(f).optimized_xyz);
        assert_eq!(project2.viewpoint(v).position, project.viewpoint(v).position);
    }

    #[test]
    fn disabled_or_locked_camera_gets_no_params() {
        let mut project = Project::new();
        let v = project.add_viewpoint("cam", 640.0, 480.0);
        project.viewpoint_mut(v).enabled_in_solve = false;
        let layout = ParamLayout::build(&project, IntrinsicsMode::Always, false);
        assert!(!layout.is_camera_free(v));
    }
}
