// related_world_server/server/src/world/transform.rs
//! Coordinate conversions between related-world space, persistent-world space
//! and each world's floating origin.
//!
//! All functions are pure. A translation is applied exactly once per call;
//! callers never accumulate translations into stored positions.

use crate::core::types::{Vec3, WorldTranslation, IntVector};

/// Related-world local position to persistent-world position.
#[inline]
pub fn rel_to_world(translation: WorldTranslation, local: Vec3) -> Vec3 {
    local + translation.to_vec3()
}

/// Persistent-world position to related-world local position.
#[inline]
pub fn world_to_rel(translation: WorldTranslation, global: Vec3) -> Vec3 {
    global - translation.to_vec3()
}

/// Position in one related world to the same point in another related world.
///
/// Evaluated as `(pos + from) - to`, the same operation order as
/// `world_to_rel(to, rel_to_world(from, pos))`, so both agree bit for bit.
#[inline]
pub fn rel_to_rel(from: WorldTranslation, to: WorldTranslation, pos: Vec3) -> Vec3 {
    pos + from.to_vec3() - to.to_vec3()
}

/// Floating-origin local position to zero-origin position.
#[inline]
pub fn rebase_onto_zero_origin(location: Vec3, origin: IntVector) -> Vec3 {
    location + origin.to_vec3()
}

/// Zero-origin position to floating-origin local position.
#[inline]
pub fn rebase_onto_local_origin(location: Vec3, origin: IntVector) -> Vec3 {
    location - origin.to_vec3()
}

/// The coordinate frame a position is expressed in: which related world
/// (by translation) and which applied floating origin of that world.
///
/// The persistent world is `translation == ZERO`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OriginFrame {
    pub translation: WorldTranslation,
    pub origin: IntVector,
}

impl OriginFrame {
    pub const ABSOLUTE: OriginFrame = OriginFrame { translation: IntVector::ZERO, origin: IntVector::ZERO };

    pub fn new(translation: WorldTranslation, origin: IntVector) -> Self {
        OriginFrame { translation, origin }
    }

    /// Persistent-world frame with the given floating origin.
    pub fn persistent(origin: IntVector) -> Self {
        OriginFrame { translation: IntVector::ZERO, origin }
    }

    /// Related-world frame with its origin already rebased to zero.
    pub fn related(translation: WorldTranslation) -> Self {
        OriginFrame { translation, origin: IntVector::ZERO }
    }
}

/// Convert `pos` from one frame to another.
///
/// Order is fixed:
/// 1. rebase onto zero origin with the source world's applied origin,
/// 2. apply the related-world translation delta,
/// 3. rebase onto the destination world's applied origin.
///
/// Origins passed here must be the *applied* origins of the worlds. A
/// requested-but-not-yet-applied origin shift must not be used.
pub fn convert(from: OriginFrame, to: OriginFrame, pos: Vec3) -> Vec3 {
    let absolute = rebase_onto_zero_origin(pos, from.origin);
    let moved = rel_to_rel(from.translation, to.translation, absolute);
    rebase_onto_local_origin(moved, to.origin)
}
