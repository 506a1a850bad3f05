//! Head-pose estimation from six facial landmarks.
//!
//! A pinhole camera is assumed (focal length = frame width, principal point
//! at the frame center, no distortion). The rigid 3-D face model below is
//! expressed in image-aligned axes: x right, y down, z away from the camera,
//! so a frontal face solves to the identity rotation and zero angles.
//!
//! The PnP solve is a damped Gauss-Newton (Levenberg-Marquardt) minimization
//! of reprojection error over axis-angle rotation plus translation.

use anyhow::{anyhow, Result};
use nalgebra::{Rotation3, SMatrix, SVector, Vector3};

/// Landmark mesh indices feeding the pose solve, in model-point order:
/// nose tip, chin, left eye outer corner, right eye outer corner,
/// left mouth corner, right mouth corner.
pub const POSE_LANDMARK_IDS: [usize; 6] = [1, 152, 263, 33, 287, 57];

/// Anthropometric face model, millimetres.
const MODEL_POINTS: [[f64; 3]; 6] = [
    [0.0, 0.0, 0.0],        // nose tip
    [0.0, 330.0, 65.0],     // chin
    [-225.0, -170.0, 135.0], // left eye outer corner
    [225.0, -170.0, 135.0], // right eye outer corner
    [-150.0, 150.0, 125.0], // left mouth corner
    [150.0, 150.0, 125.0],  // right mouth corner
];

/// Distance between the model eye corners, used to seed the depth estimate.
const MODEL_EYE_SPAN: f64 = 450.0;

const MAX_OUTER_ITERATIONS: usize = 100;
const MAX_DAMPING_RETRIES: usize = 10;

pub const NO_FACE_LABEL: &str = "No face detected";

#[derive(Clone, Copy, Debug)]
pub struct PoseThresholds {
    /// Degrees.
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Default for PoseThresholds {
    fn default() -> Self {
        Self {
            yaw: 30.0,
            pitch: 20.0,
            roll: 30.0,
        }
    }
}

/// Euler angles in degrees: pitch about x, yaw about y, roll about z (ZYX).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeadPose {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadDirection {
    Forward,
    Left,
    Right,
    Up,
    Down,
    Tilted,
}

impl HeadDirection {
    pub fn label(&self) -> &'static str {
        match self {
            HeadDirection::Forward => "Looking Forward",
            HeadDirection::Left => "ALERT: Looking Left",
            HeadDirection::Right => "ALERT: Looking Right",
            HeadDirection::Up => "ALERT: Looking Up",
            HeadDirection::Down => "ALERT: Looking Down",
            HeadDirection::Tilted => "ALERT: Tilting Head",
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Intrinsics {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

impl Intrinsics {
    fn for_frame(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let focal = f64::from(width);
        Ok(Self {
            fx: focal,
            fy: focal,
            cx: f64::from(width) / 2.0,
            cy: f64::from(height) / 2.0,
        })
    }
}

pub struct PoseEstimator {
    thresholds: PoseThresholds,
    model_points: [Vector3<f64>; 6],
}

impl PoseEstimator {
    pub fn new(thresholds: PoseThresholds) -> Self {
        let model_points = MODEL_POINTS.map(|[x, y, z]| Vector3::new(x, y, z));
        Self {
            thresholds,
            model_points,
        }
    }

    pub fn thresholds(&self) -> PoseThresholds {
        self.thresholds
    }

    /// Solve head pose from the six landmark pixel positions.
    pub fn estimate(
        &self,
        image_points: &[(f64, f64); 6],
        width: u32,
        height: u32,
    ) -> Result<HeadPose> {
        let intrinsics = Intrinsics::for_frame(width, height)?;
        for &(u, v) in image_points {
            if !u.is_finite() || !v.is_finite() {
                return Err(anyhow!("landmark coordinates must be finite"));
            }
        }

        let params = self.solve_pnp(image_points, &intrinsics)?;
        let rotation = Rotation3::new(Vector3::new(params[0], params[1], params[2]));
        let pose = rotation_to_euler_degrees(&rotation);
        if !pose.pitch.is_finite() || !pose.yaw.is_finite() || !pose.roll.is_finite() {
            return Err(anyhow!("pose solve produced non-finite angles"));
        }
        Ok(pose)
    }

    /// Fixed-threshold classification; first match wins, in the order
    /// right, left, down, up, tilt.
    pub fn classify(&self, pose: &HeadPose) -> HeadDirection {
        if pose.yaw > self.thresholds.yaw {
            HeadDirection::Right
        } else if pose.yaw < -self.thresholds.yaw {
            HeadDirection::Left
        } else if pose.pitch > self.thresholds.pitch {
            HeadDirection::Down
        } else if pose.pitch < -self.thresholds.pitch {
            HeadDirection::Up
        } else if pose.roll.abs() > self.thresholds.roll {
            HeadDirection::Tilted
        } else {
            HeadDirection::Forward
        }
    }

    /// Simplified head-position heuristic over a normalized face-box center.
    ///
    /// Reports synthetic angles at the configured thresholds so callers see
    /// the same response shape as the full solve.
    pub fn position_heuristic(&self, center_x: f64, center_y: f64, margin: f64) -> (HeadDirection, HeadPose) {
        let mut pose = HeadPose::default();
        let direction = if center_x < margin {
            pose.yaw = -self.thresholds.yaw;
            HeadDirection::Left
        } else if center_x > 1.0 - margin {
            pose.yaw = self.thresholds.yaw;
            HeadDirection::Right
        } else if center_y < margin {
            pose.pitch = -self.thresholds.pitch;
            HeadDirection::Up
        } else if center_y > 1.0 - margin {
            pose.pitch = self.thresholds.pitch;
            HeadDirection::Down
        } else {
            HeadDirection::Forward
        };
        (direction, pose)
    }

    fn solve_pnp(
        &self,
        image_points: &[(f64, f64); 6],
        intrinsics: &Intrinsics,
    ) -> Result<SVector<f64, 6>> {
        let mut params = self.initial_guess(image_points, intrinsics)?;
        let mut cost = self
            .residuals(&params, image_points, intrinsics)?
            .norm_squared();
        let mut lambda = 1e-3;

        for _ in 0..MAX_OUTER_ITERATIONS {
            if cost < 1e-16 {
                break;
            }
            let residuals = self.residuals(&params, image_points, intrinsics)?;
            let jacobian = self.numeric_jacobian(&params, image_points, intrinsics)?;
            let jtj = jacobian.transpose() * jacobian;
            let jtr = jacobian.transpose() * residuals;

            let mut stepped = false;
            for _ in 0..MAX_DAMPING_RETRIES {
                let mut damped = jtj;
                for i in 0..6 {
                    damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
                }
                let Some(delta) = damped.lu().solve(&(-jtr)) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = params + delta;
                let candidate_cost = match self.residuals(&candidate, image_points, intrinsics) {
                    Ok(r) => r.norm_squared(),
                    Err(_) => {
                        lambda *= 10.0;
                        continue;
                    }
                };
                if candidate_cost < cost {
                    params = candidate;
                    cost = candidate_cost;
                    lambda = (lambda * 0.1).max(1e-12);
                    stepped = delta.norm() >= 1e-10;
                    break;
                }
                lambda *= 10.0;
            }
            if !stepped {
                break;
            }
        }

        if !cost.is_finite() {
            return Err(anyhow!("PnP solve diverged"));
        }
        Ok(params)
    }

    /// Seed translation from the nose ray and the apparent eye span;
    /// rotation starts at identity.
    fn initial_guess(
        &self,
        image_points: &[(f64, f64); 6],
        intrinsics: &Intrinsics,
    ) -> Result<SVector<f64, 6>> {
        let (lx, ly) = image_points[2];
        let (rx, ry) = image_points[3];
        let eye_span = ((lx - rx).powi(2) + (ly - ry).powi(2)).sqrt();
        if eye_span < 1e-6 {
            return Err(anyhow!("degenerate landmarks: eye corners coincide"));
        }
        let tz = intrinsics.fx * MODEL_EYE_SPAN / eye_span;
        let (nose_u, nose_v) = image_points[0];
        let tx = (nose_u - intrinsics.cx) * tz / intrinsics.fx;
        let ty = (nose_v - intrinsics.cy) * tz / intrinsics.fy;
        Ok(SVector::<f64, 6>::from_column_slice(&[
            0.0, 0.0, 0.0, tx, ty, tz,
        ]))
    }

    fn residuals(
        &self,
        params: &SVector<f64, 6>,
        image_points: &[(f64, f64); 6],
        intrinsics: &Intrinsics,
    ) -> Result<SVector<f64, 12>> {
        let rotation = Rotation3::new(Vector3::new(params[0], params[1], params[2]));
        let translation = Vector3::new(params[3], params[4], params[5]);
        let mut out = SVector::<f64, 12>::zeros();
        for (i, model_point) in self.model_points.iter().enumerate() {
            let cam = rotation * model_point + translation;
            if cam.z < 1e-9 {
                return Err(anyhow!("model point projected behind the camera"));
            }
            let u = intrinsics.fx * cam.x / cam.z + intrinsics.cx;
            let v = intrinsics.fy * cam.y / cam.z + intrinsics.cy;
            out[2 * i] = u - image_points[i].0;
            out[2 * i + 1] = v - image_points[i].1;
        }
        Ok(out)
    }

    fn numeric_jacobian(
        &self,
        params: &SVector<f64, 6>,
        image_points: &[(f64, f64); 6],
        intrinsics: &Intrinsics,
    ) -> Result<SMatrix<f64, 12, 6>> {
        let mut jacobian = SMatrix::<f64, 12, 6>::zeros();
        for col in 0..6 {
            let step = 1e-6 * params[col].abs().max(1.0);
            let mut plus = *params;
            let mut minus = *params;
            plus[col] += step;
            minus[col] -= step;
            let r_plus = self.residuals(&plus, image_points, intrinsics)?;
            let r_minus = self.residuals(&minus, image_points, intrinsics)?;
            jacobian.set_column(col, &((r_plus - r_minus) / (2.0 * step)));
        }
        Ok(jacobian)
    }
}

/// ZYX Euler extraction, degrees. Gimbal-locked poses zero the roll.
fn rotation_to_euler_degrees(rotation: &Rotation3<f64>) -> HeadPose {
    let m = rotation.matrix();
    let sy = (m[(0, 0)].powi(2) + m[(1, 0)].powi(2)).sqrt();
    let (pitch, yaw, roll) = if sy > 1e-6 {
        (
            m[(2, 1)].atan2(m[(2, 2)]),
            (-m[(2, 0)]).atan2(sy),
            m[(1, 0)].atan2(m[(0, 0)]),
        )
    } else {
        ((-m[(1, 2)]).atan2(m[(1, 1)]), (-m[(2, 0)]).atan2(sy), 0.0)
    };
    HeadPose {
        pitch: pitch.to_degrees(),
        yaw: yaw.to_degrees(),
        roll: roll.to_degrees(),
    }
}
