use nalgebra::{UnitQuaternion, Vector3};

/// Full perspective intrinsics: focal length, principal point, aspect ratio,
/// skew, and the 5-parameter Brown-Conrady distortion model (3 radial, 2
/// tangential), per §3 (Viewpoint) and §4.8.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intrinsics {
    pub focal_length: f64,
    pub cx: f64,
    pub cy: f64,
    /// fy / fx. 1.0 for square pixels.
    pub aspect_ratio: f64,
    pub skew: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl Intrinsics {
    pub fn new_default(focal_length: f64, cx: f64, cy: f64) -> Self {
        Intrinsics {
            focal_length,
            cx,
            cy,
            aspect_ratio: 1.0,
            skew: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.focal_length
    }

    #[inline]
    pub fn fy(&self) -> f64 {
        self.focal_length * self.aspect_ratio
    }

    /// Apply the Brown-Conrady distortion model to normalized camera
    /// coordinates `(xn, yn)` (i.e. camera-space x/z, y/z).
    pub fn distort_normalized(&self, xn: f64, yn: f64) -> (f64, f64) {
        let r2 = xn * xn + yn * yn;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let xd = xn * radial + 2.0 * self.p1 * xn * yn + self.p2 * (r2 + 2.0 * xn * xn);
        let yd = yn * radial + self.p1 * (r2 + 2.0 * yn * yn) + 2.0 * self.p2 * xn * yn;
        (xd, yd)
    }

    /// Map distorted normalized coordinates to pixel coordinates.
    pub fn normalized_to_pixel(&self, xd: f64, yd: f64) -> (f64, f64) {
        let u = self.fx() * xd + self.skew * yd + self.cx;
        let v = self.fy() * yd + self.cy;
        (u, v)
    }

    /// Project a camera-space point with positive depth to a pixel. Returns
    /// `None` if the point is at or behind the camera (`z <= 0`).
    pub fn project_camera_space(&self, p_cam: Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 1e-9 {
            return None;
        }
        let xn = p_cam.x / p_cam.z;
        let yn = p_cam.y / p_cam.z;
        let (xd, yd) = self.distort_normalized(xn, yn);
        Some(self.normalized_to_pixel(xd, yd))
    }

    /// Undistort+back-project a pixel to a camera-space ray direction
    /// (normalized-plane coordinates, z=1), ignoring distortion (the scene
    /// solver only ever needs this for VP/PnP bootstrap where distortion is
    /// assumed small; the LM stage is the one that models distortion
    /// exactly via [`Self::project_camera_space`]).
    pub fn pixel_to_camera_ray(&self, u: f64, v: f64) -> Vector3<f64> {
        let yn = (v - self.cy) / self.fy();
        let xn = (u - self.cx - self.skew * yn) / self.fx();
        Vector3::new(xn, yn, 1.0)
    }
}

/// Camera extrinsics: world-to-camera rotation and the camera center in
/// world coordinates (not the translation vector `t = -R*C`; storing the
/// center directly keeps the position parameter block intuitive for the LM
/// solver and for scene alignment, mirroring `ExtrinsicParameters`'s
/// `camcenter()` accessor in the reference camera model).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub position: Vector3<f64>,
}

impl Pose {
    pub fn identity_at_origin() -> Self {
        Pose {
            rotation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
        }
    }

    #[inline]
    pub fn world_to_camera(&self, p_world: Vector3<f64>) -> Vector3<f64> {
        self.rotation * (p_world - self.position)
    }

    #[inline]
    pub fn camera_to_world_dir(&self, d_cam: Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * d_cam
    }
}

/// A full camera: pose plus intrinsics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub pose: Pose,
    pub intrinsics: Intrinsics,
}

impl Camera {
    pub fn project(&self, p_world: Vector3<f64>) -> Option<(f64, f64)> {
        let p_cam = self.pose.world_to_camera(p_world);
        self.intrinsics.project_camera_space(p_cam)
    }

    /// A world-space ray from the camera center through pixel `(u, v)`.
    pub fn pixel_to_world_ray(&self, u: f64, v: f64) -> (Vector3<f64>, Vector3<f64>) {
        let dir_cam = self.intrinsics.pixel_to_camera_ray(u, v);
        let dir_world = self.pose.camera_to_world_dir(dir_cam);
        (self.pose.position, scene_solver_math::normalize3(dir_world).unwrap_or(dir_world))
    }

    pub fn reprojection_error(&self, p_world: Vector3<f64>, observed_uv: (f64, f64)) -> Option<f64> {
        let (pu, pv) = self.project(p_world)?;
        Some(((pu - observed_uv.0).powi(2) + (pv - observed_uv.1).powi(2)).sqrt())
    }
}
