//! Solver state snapshot/restore (§3, §4.11): a copy of every feature's
//! `optimized_xyz`/`inferred_xyz` and every viewpoint's full mutable state,
//! used for rollback when a phase diverges or is cancelled.

use std::collections::HashMap;

use nalgebra::{UnitQuaternion, Vector3};

use scene_solver_geom::Intrinsics;

use crate::project::{AxisTriple, FeatureId, Project, ViewpointId};

#[derive(Debug, Clone)]
struct FeatureState {
    optimized_xyz: Vector3<f64>,
    inferred_xyz: AxisTriple,
}

#[derive(Debug, Clone)]
struct ViewpointState {
    position: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
    intrinsics: Intrinsics,
    enabled_in_solve: bool,
    is_pose_locked: bool,
    is_z_reflected: bool,
}

#[derive(Debug, Clone)]
pub struct SolverStateSnapshot {
    features: HashMap<FeatureId, FeatureState>,
    viewpoints: HashMap<ViewpointId, ViewpointState>,
}

impl SolverStateSnapshot {
    pub fn capture(project: &Project) -> Self {
        let features = project
            .features()
            .map(|f| {
                (
                    f.id,
                    FeatureState {
                        optimized_xyz: f.optimized_xyz,
                        inferred_xyz: f.inferred_xyz,
                    },
                )
            })
            .collect();
        let viewpoints = project
            .viewpoints()
            .map(|v| {
                (
                    v.id,
                    ViewpointState {
                        position: v.position,
                        rotation: v.rotation,
                        intrinsics: v.intrinsics,
                        enabled_in_solve: v.enabled_in_solve,
                        is_pose_locked: v.is_pose_locked,
                        is_z_reflected: v.is_z_reflected,
                    },
                )
            })
            .collect();
        SolverStateSnapshot { features, viewpoints }
    }

    pub fn restore(&self, project: &mut Project) {
        for (id, state) in &self.features {
            let feat = project.feature_mut(*id);
            feat.optimized_xyz = state.optimized_xyz;
            feat.inferred_xyz = state.inferred_xyz;
        }
        for (id, state) in &self.viewpoints {
            let vp = project.viewpoint_mut(*id);
            vp.position = state.position;
            vp.rotation = state.rotation;
            vp.intrinsics = state.intrinsics;
            vp.enabled_in_solve = state.enabled_in_solve;
            vp.is_pose_locked = state.is_pose_locked;
            vp.is_z_reflected = state.is_z_reflected;
        }
    }
}
