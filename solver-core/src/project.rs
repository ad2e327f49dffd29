//! The in-memory project graph: features, lines, constraints, viewpoints,
//! and observations, per §3. Cyclic references (feature <-> line <->
//! observation <-> viewpoint) are modelled as relation + lookup against a
//! single owning arena rather than as ownership, so every cross-reference is
//! an opaque handle resolved through [`Project`]'s accessors.

use std::collections::HashMap;

use nalgebra::{UnitQuaternion, Vector3};

use scene_solver_geom::Intrinsics;

macro_rules! handle_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle_type!(FeatureId);
handle_type!(LineId);
handle_type!(ConstraintId);
handle_type!(ViewpointId);
handle_type!(ObservationId);

/// One axis's worth of optional coordinate data, used both by
/// `locked_xyz` and `inferred_xyz`.
pub type AxisTriple = [Option<f64>; 3];

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub locked_xyz: AxisTriple,
    pub inferred_xyz: AxisTriple,
    pub optimized_xyz: Vector3<f64>,
    pub color: Option<[u8; 3]>,
    pub is_locked: bool,
    pub lines: Vec<LineId>,
    pub observations: Vec<ObservationId>,
}

impl Feature {
    pub fn new(id: FeatureId, name: impl Into<String>) -> Self {
        Feature {
            id,
            name: name.into(),
            locked_xyz: [None, None, None],
            inferred_xyz: [None, None, None],
            optimized_xyz: Vector3::zeros(),
            color: None,
            is_locked: false,
            lines: Vec::new(),
            observations: Vec::new(),
        }
    }

    /// True when every axis is known via `locked_xyz` or `inferred_xyz`.
    pub fn is_fully_constrained(&self) -> bool {
        (0..3).all(|i| self.locked_xyz[i].is_some() || self.inferred_xyz[i].is_some())
    }

    /// Locked value takes priority, then inferred, then the live optimized
    /// coordinate.
    pub fn effective_xyz(&self) -> Vector3<f64> {
        Vector3::new(
            self.effective_axis(AXIS_X),
            self.effective_axis(AXIS_Y),
            self.effective_axis(AXIS_Z),
        )
    }

    pub fn effective_axis(&self, axis: usize) -> f64 {
        self.locked_xyz[axis]
            .or(self.inferred_xyz[axis])
            .unwrap_or(self.optimized_xyz[axis])
    }

    /// Whether this axis is free for the LM solver to move (not locked).
    pub fn is_axis_free(&self, axis: usize) -> bool {
        self.locked_xyz[axis].is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDirection {
    Free,
    X,
    Y,
    Z,
    Xy,
    Xz,
    Yz,
}

impl LineDirection {
    /// Single-axis directions (`x`, `y`, `z`) are the ones axis-constraint
    /// propagation and alignment act on.
    pub fn single_axis(&self) -> Option<usize> {
        match self {
            LineDirection::X => Some(AXIS_X),
            LineDirection::Y => Some(AXIS_Y),
            LineDirection::Z => Some(AXIS_Z),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Line {
    pub id: LineId,
    pub feature_a: FeatureId,
    pub feature_b: FeatureId,
    pub direction: LineDirection,
    pub target_length: Option<f64>,
    pub tolerance: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ImageObservation {
    pub id: ObservationId,
    pub viewpoint: ViewpointId,
    pub feature: FeatureId,
    pub pixel: (f64, f64),
    pub is_outlier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpAxis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone)]
pub struct VanishingLine {
    pub viewpoint: ViewpointId,
    pub p0: (f64, f64),
    pub p1: (f64, f64),
    pub axis: VpAxis,
}

#[derive(Debug, Clone)]
pub struct Viewpoint {
    pub id: ViewpointId,
    pub name: String,
    pub image_width: f64,
    pub image_height: f64,
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
    pub intrinsics: Intrinsics,
    pub enabled_in_solve: bool,
    pub is_pose_locked: bool,
    pub is_z_reflected: bool,
    pub vanishing_lines: Vec<VanishingLine>,
    pub observations: Vec<ObservationId>,
    /// Set once a camera has been successfully initialized by any strategy.
    pub is_initialized: bool,
    /// Whether this camera's rotation came from a VP-based strategy, kept
    /// for `cameras_via_vp` diagnostics and `lock_vp_cameras`.
    pub initialized_via_vp: bool,
}

impl Viewpoint {
    pub fn new(id: ViewpointId, name: impl Into<String>, image_width: f64, image_height: f64) -> Self {
        Viewpoint {
            id,
            name: name.into(),
            image_width,
            image_height,
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            intrinsics: Intrinsics::new_default(image_width.max(image_height), image_width / 2.0, image_height / 2.0),
            enabled_in_solve: true,
            is_pose_locked: false,
            is_z_reflected: false,
            vanishing_lines: Vec::new(),
            observations: Vec::new(),
            is_initialized: false,
            initialized_via_vp: false,
        }
    }

    pub fn vanishing_lines_count(&self) -> usize {
        self.vanishing_lines.len()
    }
}

#[derive(Debug, Clone)]
pub enum Constraint {
    PointsDistance { a: FeatureId, b: FeatureId, distance: f64, weight: f64, enabled: bool },
    PointsEqualDistance { set: Vec<(FeatureId, FeatureId)>, weight: f64, enabled: bool },
    PointsColinear { set: Vec<FeatureId>, weight: f64, enabled: bool },
    PointsCoplanar { set: Vec<FeatureId>, weight: f64, enabled: bool },
    LinesParallel { a: LineId, b: LineId, weight: f64, enabled: bool },
    LinesPerpendicular { a: LineId, b: LineId, weight: f64, enabled: bool },
    PointFixedCoord { point: FeatureId, axis: usize, value: f64, weight: f64, enabled: bool },
    /// Symmetry variant (§3): `a` and `b` mirror each other across the plane
    /// perpendicular to `axis` through `plane_point`'s coordinate on that
    /// axis — equal on the other two axes, opposite displacement from the
    /// plane on `axis`.
    PointsMirrored { a: FeatureId, b: FeatureId, axis: usize, plane_point: FeatureId, weight: f64, enabled: bool },
}

impl Constraint {
    pub fn is_enabled(&self) -> bool {
        match self {
            Constraint::PointsDistance { enabled, .. }
            | Constraint::PointsEqualDistance { enabled, .. }
            | Constraint::PointsColinear { enabled, .. }
            | Constraint::PointsCoplanar { enabled, .. }
            | Constraint::LinesParallel { enabled, .. }
            | Constraint::LinesPerpendicular { enabled, .. }
            | Constraint::PointFixedCoord { enabled, .. }
            | Constraint::PointsMirrored { enabled, .. } => *enabled,
        }
    }
}

/// The project arena: owns every entity; everything else refers back by
/// handle.
#[derive(Debug, Clone, Default)]
pub struct Project {
    features: HashMap<FeatureId, Feature>,
    lines: HashMap<LineId, Line>,
    constraints: Vec<(ConstraintId, Constraint)>,
    viewpoints: HashMap<ViewpointId, Viewpoint>,
    observations: HashMap<ObservationId, ImageObservation>,
    next_feature: u32,
    next_line: u32,
    next_constraint: u32,
    next_viewpoint: u32,
    next_observation: u32,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_feature(&mut self, name: impl Into<String>) -> FeatureId {
        let id = FeatureId(self.next_feature);
        self.next_feature += 1;
        self.features.insert(id, Feature::new(id, name));
        id
    }

    pub fn add_line(&mut self, feature_a: FeatureId, feature_b: FeatureId, direction: LineDirection) -> LineId {
        let id = LineId(self.next_line);
        self.next_line += 1;
        self.lines.insert(
            id,
            Line {
                id,
                feature_a,
                feature_b,
                direction,
                target_length: None,
                tolerance: None,
            },
        );
        if let Some(f) = self.features.get_mut(&feature_a) {
            f.lines.push(id);
        }
        if let Some(f) = self.features.get_mut(&feature_b) {
            f.lines.push(id);
        }
        id
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> ConstraintId {
        let id = ConstraintId(self.next_constraint);
        self.next_constraint += 1;
        self.constraints.push((id, constraint));
        id
    }

    pub fn add_viewpoint(&mut self, name: impl Into<String>, width: f64, height: f64) -> ViewpointId {
        let id = ViewpointId(self.next_viewpoint);
        self.next_viewpoint += 1;
        self.viewpoints.insert(id, Viewpoint::new(id, name, width, height));
        id
    }

    pub fn add_observation(&mut self, viewpoint: ViewpointId, feature: FeatureId, pixel: (f64, f64)) -> ObservationId {
        let id = ObservationId(self.next_observation);
        self.next_observation += 1;
        self.observations.insert(
            id,
            ImageObservation {
                id,
                viewpoint,
                feature,
                pixel,
                is_outlier: false,
            },
        );
        if let Some(f) = self.features.get_mut(&feature) {
            f.observations.push(id);
        }
        if let Some(v) = self.viewpoints.get_mut(&viewpoint) {
            v.observations.push(id);
        }
        id
    }

    pub fn feature(&self, id: FeatureId) -> &Feature {
        &self.features[&id]
    }
    pub fn feature_mut(&mut self, id: FeatureId) -> &mut Feature {
        self.features.get_mut(&id).expect("feature handle must be valid")
    }
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }
    pub fn feature_ids(&self) -> Vec<FeatureId> {
        let mut ids: Vec<_> = self.features.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn line(&self, id: LineId) -> &Line {
        &self.lines[&id]
    }
    pub fn line_mut(&mut self, id: LineId) -> &mut Line {
        self.lines.get_mut(&id).expect("line handle must be valid")
    }
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.values()
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().map(|(_, c)| c)
    }

    pub fn viewpoint(&self, id: ViewpointId) -> &Viewpoint {
        &self.viewpoints[&id]
    }
    pub fn viewpoint_mut(&mut self, id: ViewpointId) -> &mut Viewpoint {
        self.viewpoints.get_mut(&id).expect("viewpoint handle must be valid")
    }
    pub fn viewpoints(&self) -> impl Iterator<Item = &Viewpoint> {
        self.viewpoints.values()
    }
    pub fn viewpoint_ids(&self) -> Vec<ViewpointId> {
        let mut ids: Vec<_> = self.viewpoints.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn observation(&self, id: ObservationId) -> &ImageObservation {
        &self.observations[&id]
    }
    pub fn observation_mut(&mut self, id: ObservationId) -> &mut ImageObservation {
        self.observations.get_mut(&id).expect("observation handle must be valid")
    }
    pub fn observations(&self) -> impl Iterator<Item = &ImageObservation> {
        self.observations.values()
    }

    /// Reset every observation's `is_outlier` flag; called at the start of
    /// each solve (§3 lifecycle).
    pub fn reset_outlier_flags(&mut self) {
        for obs in self.observations.values_mut() {
            obs.is_outlier = false;
        }
    }

    pub fn fully_constrained_feature_ids(&self) -> Vec<FeatureId> {
        let mut ids: Vec<_> = self
            .features
            .values()
            .filter(|f| f.is_fully_constrained())
            .map(|f| f.id)
            .collect();
        ids.sort();
        ids
    }
}
