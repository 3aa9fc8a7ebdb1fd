//! Change-masked binary encoding of replicated entity state.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! frame  := [f64 simulationTime][u32 changedCount] entity*
//! entity := [u32 networkId][u32 ownerPeerIndex][u8 changeMask] component*
//! ```
//!
//! Bit `i` of an entity's change mask is set when the `i`-th component of
//! the [`SerializationSchema`] wrote anything. Each component writes its own
//! inner change mask followed by only the fields that moved since the last
//! frame, as tracked by the [`ShadowStore`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use bevy_ecs::prelude::*;
use flux_actions::PeerId;
use flux_config::NetworkConfig;
use flux_wire::{
    CursorError, ReadCursor, VectorPacking, WriteCursor, pack_quaternion, unpack_quaternion,
};
use glam::Vec4;

use crate::components::{NetworkObject, NetworkObjectIndex, Transform, Velocity};
use crate::error::FrameError;
use crate::network::{Network, PeerIndex};

/// Most components one schema can declare (one change-mask bit each).
pub const MAX_SCHEMA_COMPONENTS: usize = 8;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Tolerances and packing shared by writers and readers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecSettings {
    /// Per-axis position change below this is not sent.
    pub position_epsilon: f64,
    /// Per-component rotation change below this is not sent.
    pub rotation_epsilon: f32,
    /// Packing of linear velocity.
    pub velocity: VectorPacking,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

impl CodecSettings {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            position_epsilon: config.position_epsilon,
            rotation_epsilon: config.rotation_epsilon,
            velocity: VectorPacking::for_range(config.velocity_max_range),
        }
    }
}

// ---------------------------------------------------------------------------
// ShadowStore
// ---------------------------------------------------------------------------

/// Last values written per (component, entity), for delta detection.
#[derive(Default)]
pub struct ShadowStore {
    values: HashMap<(&'static str, Entity), Box<dyn Any + Send + Sync>>,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: 'static>(&self, component: &'static str, entity: Entity) -> Option<&T> {
        self.values.get(&(component, entity))?.downcast_ref::<T>()
    }

    pub fn set<T: Send + Sync + 'static>(&mut self, component: &'static str, entity: Entity, value: T) {
        self.values.insert((component, entity), Box::new(value));
    }

    /// Forgets every shadow of a destroyed entity.
    pub fn clear_entity(&mut self, entity: Entity) {
        self.values.retain(|(_, shadowed), _| *shadowed != entity);
    }

    /// Forgets everything; the next frame carries full state.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ShadowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowStore")
            .field("entries", &self.values.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Component serializers
// ---------------------------------------------------------------------------

/// Writes the component's changed fields. Returns `false` (with nothing
/// written) when nothing changed or the entity lacks the component.
pub type WriteFn = fn(
    &mut WriteCursor,
    &World,
    Entity,
    &mut ShadowStore,
    &CodecSettings,
) -> Result<bool, CursorError>;

/// Reads the component's fields and applies them to the target. With no
/// target the bytes are consumed and discarded.
pub type ReadFn =
    fn(&mut ReadCursor<'_>, &mut World, Option<Entity>, &CodecSettings) -> Result<(), CursorError>;

/// Type-erased codec of one replicated component.
#[derive(Debug, Clone, Copy)]
pub struct ComponentSerializer {
    pub name: &'static str,
    pub write: WriteFn,
    pub read: ReadFn,
}

const TRANSFORM_NAME: &str = "transform";
const VELOCITY_NAME: &str = "velocity";

const ROTATION_BIT: u8 = 1 << 3;

/// Position as up to three `f64` axes (inner mask bits 0..=2) and rotation
/// as one packed quaternion word (bit 3).
pub const TRANSFORM: ComponentSerializer = ComponentSerializer {
    name: TRANSFORM_NAME,
    write: write_transform,
    read: read_transform,
};

/// Linear velocity as one packed vector word (inner mask bit 0).
pub const VELOCITY: ComponentSerializer = ComponentSerializer {
    name: VELOCITY_NAME,
    write: write_velocity,
    read: read_velocity,
};

fn rotation_moved(current: glam::Quat, previous: glam::Quat, epsilon: f32) -> bool {
    // q and -q are the same rotation.
    let previous = if current.dot(previous) < 0.0 {
        -previous
    } else {
        previous
    };
    (Vec4::from(current) - Vec4::from(previous)).abs().max_element() > epsilon
}

fn write_transform(
    cursor: &mut WriteCursor,
    world: &World,
    entity: Entity,
    shadows: &mut ShadowStore,
    settings: &CodecSettings,
) -> Result<bool, CursorError> {
    let Some(transform) = world.get::<Transform>(entity).copied() else {
        return Ok(false);
    };
    let previous = shadows.get::<Transform>(TRANSFORM_NAME, entity).copied();

    let start = cursor.position();
    let mask_slot = cursor.space_u8();
    let mut mask = 0u8;
    let mut sent = previous.unwrap_or(transform);

    for axis in 0..3 {
        let value = transform.position[axis];
        let changed = previous
            .is_none_or(|previous| (value - previous.position[axis]).abs() > settings.position_epsilon);
        if changed {
            mask |= 1 << axis;
            cursor.write_f64(value);
            sent.position[axis] = value;
        }
    }

    let rotation_changed = previous.is_none_or(|previous| {
        rotation_moved(transform.rotation, previous.rotation, settings.rotation_epsilon)
    });
    if rotation_changed {
        mask |= ROTATION_BIT;
        cursor.write_u32(pack_quaternion(transform.rotation));
        sent.rotation = transform.rotation;
    }

    if mask == 0 {
        cursor.rewind(start);
        return Ok(false);
    }
    cursor.backfill_u8(mask_slot, mask)?;
    shadows.set(TRANSFORM_NAME, entity, sent);
    Ok(true)
}

fn read_transform(
    cursor: &mut ReadCursor<'_>,
    world: &mut World,
    target: Option<Entity>,
    _settings: &CodecSettings,
) -> Result<(), CursorError> {
    let mask = cursor.read_u8()?;
    let mut position = [None; 3];
    for (axis, slot) in position.iter_mut().enumerate() {
        if mask & (1 << axis) != 0 {
            *slot = Some(cursor.read_f64()?);
        }
    }
    let rotation = if mask & ROTATION_BIT != 0 {
        Some(unpack_quaternion(cursor.read_u32()?))
    } else {
        None
    };

    if let Some(entity) = target
        && let Some(mut transform) = world.get_mut::<Transform>(entity)
    {
        for (axis, value) in position.into_iter().enumerate() {
            if let Some(value) = value {
                transform.position[axis] = value;
            }
        }
        if let Some(rotation) = rotation {
            transform.rotation = rotation;
        }
    }
    Ok(())
}

fn write_velocity(
    cursor: &mut WriteCursor,
    world: &World,
    entity: Entity,
    shadows: &mut ShadowStore,
    settings: &CodecSettings,
) -> Result<bool, CursorError> {
    let Some(velocity) = world.get::<Velocity>(entity) else {
        return Ok(false);
    };
    // Changes smaller than one quantization step pack to the same word.
    let word = settings.velocity.pack(velocity.linear);
    if shadows.get::<u32>(VELOCITY_NAME, entity) == Some(&word) {
        return Ok(false);
    }
    cursor.write_u8(1);
    cursor.write_u32(word);
    shadows.set(VELOCITY_NAME, entity, word);
    Ok(true)
}

fn read_velocity(
    cursor: &mut ReadCursor<'_>,
    world: &mut World,
    target: Option<Entity>,
    settings: &CodecSettings,
) -> Result<(), CursorError> {
    let mask = cursor.read_u8()?;
    if mask & 1 == 0 {
        return Ok(());
    }
    let linear = settings.velocity.unpack(cursor.read_u32()?);
    if let Some(entity) = target
        && let Some(mut velocity) = world.get_mut::<Velocity>(entity)
    {
        velocity.linear = linear;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SerializationSchema
// ---------------------------------------------------------------------------

/// Ordered list of replicated components. Writer and reader must agree.
#[derive(Debug, Clone)]
pub struct SerializationSchema {
    components: Vec<ComponentSerializer>,
}

impl SerializationSchema {
    pub fn new(components: Vec<ComponentSerializer>) -> Result<Self, FrameError> {
        if components.len() > MAX_SCHEMA_COMPONENTS {
            return Err(FrameError::SchemaTooLarge(components.len()));
        }
        Ok(Self { components })
    }

    /// [`TRANSFORM`] then [`VELOCITY`].
    pub fn standard() -> Self {
        Self {
            components: vec![TRANSFORM, VELOCITY],
        }
    }

    pub fn components(&self) -> &[ComponentSerializer] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl Default for SerializationSchema {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Encodes the entities the local peer has authority over.
#[derive(Debug, Clone, Default)]
pub struct EntityFrameWriter {
    settings: CodecSettings,
}

impl EntityFrameWriter {
    pub fn new(settings: CodecSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CodecSettings {
        &self.settings
    }

    /// Writes one frame. Returns an empty buffer when no entity changed.
    #[allow(clippy::too_many_arguments)]
    pub fn write_frame(
        &self,
        world: &World,
        network: &Network,
        objects: &NetworkObjectIndex,
        schema: &SerializationSchema,
        shadows: &mut ShadowStore,
        simulation_time: f64,
        local_peer: &PeerId,
    ) -> Result<Vec<u8>, FrameError> {
        let mut cursor = WriteCursor::new();
        cursor.write_f64(simulation_time);
        let count_slot = cursor.space_u32();
        let mut count = 0u32;

        for entity in objects.entities() {
            let Some(object) = world.get::<NetworkObject>(entity) else {
                continue;
            };
            if &object.authority_peer != local_peer {
                continue;
            }
            let Some(owner_index) = network.peer_index(&object.owner_peer) else {
                tracing::debug!(entity = %object.entity_uuid, owner = %object.owner_peer, "owner has no peer index; not replicated");
                continue;
            };

            let start = cursor.position();
            cursor.write_u32(object.network_id);
            cursor.write_u32(owner_index);
            let mask_slot = cursor.space_u8();
            let mut mask = 0u8;
            for (bit, component) in schema.components().iter().enumerate() {
                if (component.write)(&mut cursor, world, entity, shadows, &self.settings)
                    .map_err(FrameError::Encode)?
                {
                    mask |= 1 << bit;
                }
            }

            if mask == 0 {
                cursor.rewind(start);
                continue;
            }
            cursor
                .backfill_u8(mask_slot, mask)
                .map_err(FrameError::Encode)?;
            count += 1;
        }

        if count == 0 {
            return Ok(Vec::new());
        }
        cursor
            .backfill_u32(count_slot, count)
            .map_err(FrameError::Encode)?;
        Ok(cursor.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Outcome of decoding one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameReport {
    pub simulation_time: f64,
    /// Entity entries in the frame.
    pub entities: usize,
    /// Entries applied to a local entity.
    pub applied: usize,
    /// Entries consumed without effect (unknown target or not authorized).
    pub rejected: usize,
}

/// Simulation time of a frame, without decoding the rest.
pub fn frame_time(bytes: &[u8]) -> Result<f64, FrameError> {
    ReadCursor::new(bytes).read_f64().map_err(FrameError::Truncated)
}

/// Decodes frames and applies authorized entries.
#[derive(Debug, Clone, Default)]
pub struct EntityFrameReader {
    settings: CodecSettings,
}

impl EntityFrameReader {
    pub fn new(settings: CodecSettings) -> Self {
        Self { settings }
    }

    /// Decodes a frame from `from` and applies it.
    ///
    /// An entry is applied only if `from` is the entity's authority and the
    /// local peer is not. The frame is validated in full before anything is
    /// applied, so a truncated or malformed frame changes nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn read_frame(
        &self,
        world: &mut World,
        network: &Network,
        objects: &NetworkObjectIndex,
        schema: &SerializationSchema,
        from: &PeerId,
        bytes: &[u8],
        local_peer: &PeerId,
    ) -> Result<FrameReport, FrameError> {
        if bytes.is_empty() {
            return Ok(FrameReport::default());
        }
        let context = ReadContext {
            network,
            objects,
            schema,
            from,
            bytes,
            local_peer,
        };
        if let Err(err) = self.decode(world, &context, false) {
            tracing::warn!(%from, len = bytes.len(), "dropping entity frame: {err}");
            return Err(err);
        }
        self.decode(world, &context, true)
    }

    fn decode(
        &self,
        world: &mut World,
        context: &ReadContext<'_>,
        apply: bool,
    ) -> Result<FrameReport, FrameError> {
        let mut cursor = ReadCursor::new(context.bytes);
        let simulation_time = cursor.read_f64().map_err(FrameError::Truncated)?;
        let count = cursor.read_u32().map_err(FrameError::Truncated)?;
        let mut report = FrameReport {
            simulation_time,
            ..FrameReport::default()
        };

        for _ in 0..count {
            let network_id = cursor.read_u32().map_err(FrameError::Truncated)?;
            let owner_index = cursor.read_u32().map_err(FrameError::Truncated)?;
            let mask = cursor.read_u8().map_err(FrameError::Truncated)?;
            if let Some(bit) = (context.schema.len()..8).find(|bit| mask & (1 << bit) != 0) {
                return Err(FrameError::UnknownComponent(bit as u8));
            }

            let target = context.resolve(world, owner_index, network_id);
            report.entities += 1;
            if target.is_some() {
                report.applied += 1;
            } else {
                report.rejected += 1;
            }
            let target = if apply { target } else { None };

            for (bit, component) in context.schema.components().iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    (component.read)(&mut cursor, world, target, &self.settings)
                        .map_err(FrameError::Truncated)?;
                }
            }
        }

        if !cursor.is_exhausted() {
            return Err(FrameError::TrailingBytes(cursor.remaining()));
        }
        Ok(report)
    }
}

struct ReadContext<'a> {
    network: &'a Network,
    objects: &'a NetworkObjectIndex,
    schema: &'a SerializationSchema,
    from: &'a PeerId,
    bytes: &'a [u8],
    local_peer: &'a PeerId,
}

impl ReadContext<'_> {
    /// Local entity an entry may be applied to, if any.
    fn resolve(&self, world: &World, owner_index: PeerIndex, network_id: u32) -> Option<Entity> {
        let Some(owner) = self.network.peer_id_for_index(owner_index) else {
            tracing::trace!(owner_index, network_id, "entry for unknown peer index");
            return None;
        };
        let Some(entity) = self.objects.entity(owner, network_id) else {
            tracing::trace!(%owner, network_id, "entry for unknown object");
            return None;
        };
        let object = world.get::<NetworkObject>(entity)?;
        if &object.authority_peer != self.from {
            tracing::trace!(entity = %object.entity_uuid, from = %self.from, authority = %object.authority_peer, "entry from non-authority dropped");
            return None;
        }
        if &object.authority_peer == self.local_peer {
            return None;
        }
        Some(entity)
    }
}

#[cfg(test)]
#[path = "serialization_tests.rs"]
mod tests;
