//! Math utilities and types
//!
//! nalgebra aliases plus the bounding volumes used for culling and sorting.

pub use nalgebra::{Matrix4, Quaternion, Unit, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Aabb {
    /// Box with inverted extents; extending it with any point makes it valid
    pub fn invalid() -> Self {
        Self {
            min: Vec3::repeat(f32::INFINITY),
            max: Vec3::repeat(f32::NEG_INFINITY),
        }
    }

    /// Create a box from its two corners
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create a box centered on `center` with the given half extents
    pub fn from_center_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Whether min <= max on every axis
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Grow the box to contain `point`
    pub fn extend(&mut self, point: Vec3) {
        self.min = self.min.inf(&point);
        self.max = self.max.sup(&point);
    }

    /// Grow the box to contain `other`; invalid boxes are ignored
    pub fn union(&mut self, other: &Self) {
        if other.is_valid() {
            self.min = self.min.inf(&other.min);
            self.max = self.max.sup(&other.max);
        }
    }

    /// Box center, zero for invalid boxes
    pub fn center(&self) -> Vec3 {
        if self.is_valid() {
            (self.min + self.max) * 0.5
        } else {
            Vec3::zeros()
        }
    }

    /// Scale both corners around the origin
    pub fn scaled(&self, scale: f32) -> Self {
        if self.is_valid() {
            Self::new(self.min * scale, self.max * scale)
        } else {
            *self
        }
    }
}

/// Plane stored as `normal . p + d`, positive inside
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Unit normal
    pub normal: Vec3,
    /// Distance term
    pub d: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = Vec3::new(row.x, row.y, row.z);
        let len = normal.norm();
        if len > f32::EPSILON {
            Self {
                normal: normal / len,
                d: row.w / len,
            }
        } else {
            Self { normal, d: row.w }
        }
    }

    /// Signed distance from the plane to `point`
    pub fn distance(&self, point: &Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// View frustum built from a view-projection matrix (OpenGL clip conventions)
#[derive(Debug, Clone, PartialEq)]
pub struct Frustum {
    planes: [Plane; 6],
}

impl Frustum {
    /// Extract the six clip planes of `view_projection`
    pub fn from_view_projection(view_projection: &Mat4) -> Self {
        let row = |i: usize| -> Vec4 {
            let r = view_projection.row(i);
            Vec4::new(r[0], r[1], r[2], r[3])
        };
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r3 + r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    /// Conservative box test: `false` only when the box is fully outside one plane
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        if !aabb.is_valid() {
            return true;
        }
        self.planes.iter().all(|plane| {
            let positive = Vec3::new(
                if plane.normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if plane.normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if plane.normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            plane.distance(&positive) >= 0.0
        })
    }
}
