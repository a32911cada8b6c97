// related_world_server/server/src/network/packed.rs
//! Packed character-movement payloads. Only the fields that carry positions
//! are modelled; the layout is fixed little-endian.

use crate::core::error::{RelatedWorldError, RelatedWorldResult};
use crate::core::types::{ActorId, Rotator, Vec3};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FLAG_ACK_ONLY: u8 = 1 << 0;
const FLAG_HAS_BASE: u8 = 1 << 1;
const FLAG_BASE_RELATIVE: u8 = 1 << 2;

/// Serialized movement bits as received off the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedMovementBits {
    data: Bytes,
    num_bits: usize,
}

impl PackedMovementBits {
    pub fn new(data: Bytes, num_bits: usize) -> Self {
        PackedMovementBits { data, num_bits }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let num_bits = data.len() * 8;
        PackedMovementBits { data, num_bits }
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Reject before touching the body. The bit count is client-controlled.
    pub fn check_limit(&self, limit: usize) -> RelatedWorldResult<()> {
        if self.num_bits > limit {
            return Err(RelatedWorldError::PayloadTooLarge { bits: self.num_bits, limit });
        }
        if self.data.len() * 8 < self.num_bits {
            return Err(RelatedWorldError::MalformedPayload(format!(
                "{} bits declared, {} bytes present",
                self.num_bits,
                self.data.len()
            )));
        }
        Ok(())
    }

    fn reader(&self, limit: usize) -> RelatedWorldResult<Bytes> {
        self.check_limit(limit)?;
        Ok(self.data.clone())
    }
}

/// Server to client correction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveResponseData {
    pub timestamp: f32,
    pub ack_only: bool,
    pub location: Vec3,
    pub velocity: Vec3,
    pub movement_base: Option<ActorId>,
    pub base_relative: bool,
}

impl MoveResponseData {
    pub fn correction(timestamp: f32, location: Vec3, velocity: Vec3) -> Self {
        MoveResponseData {
            timestamp,
            ack_only: false,
            location,
            velocity,
            movement_base: None,
            base_relative: false,
        }
    }

    pub fn ack(timestamp: f32) -> Self {
        MoveResponseData {
            timestamp,
            ack_only: true,
            location: Vec3::ZERO,
            velocity: Vec3::ZERO,
            movement_base: None,
            base_relative: false,
        }
    }

    pub fn encode(&self) -> PackedMovementBits {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_f32_le(self.timestamp);
        buf.put_u8(flags(self.ack_only, self.movement_base, self.base_relative));
        if !self.ack_only {
            put_vec3(&mut buf, self.location);
            put_vec3(&mut buf, self.velocity);
        }
        if let Some(base) = self.movement_base {
            buf.put_u64_le(base.0);
        }
        PackedMovementBits::from_bytes(buf.freeze())
    }

    pub fn decode(bits: &PackedMovementBits, limit: usize) -> RelatedWorldResult<Self> {
        let mut reader = bits.reader(limit)?;
        let timestamp = get_f32(&mut reader)?;
        let flags = get_u8(&mut reader)?;
        let ack_only = flags & FLAG_ACK_ONLY != 0;
        let (location, velocity) = if ack_only {
            (Vec3::ZERO, Vec3::ZERO)
        } else {
            (get_vec3(&mut reader)?, get_vec3(&mut reader)?)
        };
        let movement_base = get_base(&mut reader, flags)?;
        Ok(MoveResponseData {
            timestamp,
            ack_only,
            location,
            velocity,
            movement_base,
            base_relative: flags & FLAG_BASE_RELATIVE != 0,
        })
    }
}

/// Client to server move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServerMoveData {
    pub timestamp: f32,
    pub acceleration: Vec3,
    pub location: Vec3,
    pub control_rotation: Rotator,
    pub movement_mode: u8,
    pub movement_base: Option<ActorId>,
    pub base_relative: bool,
}

impl ServerMoveData {
    pub fn new(timestamp: f32, location: Vec3) -> Self {
        ServerMoveData {
            timestamp,
            acceleration: Vec3::ZERO,
            location,
            control_rotation: Rotator::ZERO,
            movement_mode: 1,
            movement_base: None,
            base_relative: false,
        }
    }

    pub fn encode(&self) -> PackedMovementBits {
        let mut buf = BytesMut::with_capacity(96);
        buf.put_f32_le(self.timestamp);
        buf.put_u8(flags(false, self.movement_base, self.base_relative));
        put_vec3(&mut buf, self.acceleration);
        put_vec3(&mut buf, self.location);
        buf.put_f64_le(self.control_rotation.pitch);
        buf.put_f64_le(self.control_rotation.yaw);
        buf.put_f64_le(self.control_rotation.roll);
        buf.put_u8(self.movement_mode);
        if let Some(base) = self.movement_base {
            buf.put_u64_le(base.0);
        }
        PackedMovementBits::from_bytes(buf.freeze())
    }

    pub fn decode(bits: &PackedMovementBits, limit: usize) -> RelatedWorldResult<Self> {
        let mut reader = bits.reader(limit)?;
        let timestamp = get_f32(&mut reader)?;
        let flags = get_u8(&mut reader)?;
        let acceleration = get_vec3(&mut reader)?;
        let location = get_vec3(&mut reader)?;
        let control_rotation = Rotator::new(get_f64(&mut reader)?, get_f64(&mut reader)?, get_f64(&mut reader)?);
        let movement_mode = get_u8(&mut reader)?;
        let movement_base = get_base(&mut reader, flags)?;
        Ok(ServerMoveData {
            timestamp,
            acceleration,
            location,
            control_rotation,
            movement_mode,
            movement_base,
            base_relative: flags & FLAG_BASE_RELATIVE != 0,
        })
    }
}

fn flags(ack_only: bool, base: Option<ActorId>, base_relative: bool) -> u8 {
    let mut flags = 0;
    if ack_only {
        flags |= FLAG_ACK_ONLY;
    }
    if base.is_some() {
        flags |= FLAG_HAS_BASE;
    }
    if base_relative {
        flags |= FLAG_BASE_RELATIVE;
    }
    flags
}

fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f64_le(v.x);
    buf.put_f64_le(v.y);
    buf.put_f64_le(v.z);
}

fn need(reader: &Bytes, bytes: usize) -> RelatedWorldResult<()> {
    if reader.remaining() < bytes {
        return Err(RelatedWorldError::MalformedPayload(format!(
            "needed {} more bytes, {} left",
            bytes,
            reader.remaining()
        )));
    }
    Ok(())
}

fn get_u8(reader: &mut Bytes) -> RelatedWorldResult<u8> {
    need(reader, 1)?;
    Ok(reader.get_u8())
}

fn get_f32(reader: &mut Bytes) -> RelatedWorldResult<f32> {
    need(reader, 4)?;
    Ok(reader.get_f32_le())
}

fn get_f64(reader: &mut Bytes) -> RelatedWorldResult<f64> {
    need(reader, 8)?;
    Ok(reader.get_f64_le())
}

fn get_vec3(reader: &mut Bytes) -> RelatedWorldResult<Vec3> {
    need(reader, 24)?;
    Ok(Vec3::new(reader.get_f64_le(), reader.get_f64_le(), reader.get_f64_le()))
}

fn get_base(reader: &mut Bytes, flags: u8) -> RelatedWorldResult<Option<ActorId>> {
    if flags & FLAG_HAS_BASE == 0 {
        return Ok(None);
    }
    need(reader, 8)?;
    Ok(Some(ActorId(reader.get_u64_le())))
}
