//! Unit tests for the entity frame codec.

use flux_actions::Topic;
use flux_wire::QUATERNION_STEP;
use glam::{DVec3, EulerRot, Quat, Vec3, Vec4};

use super::*;
use crate::network::UserId;

struct Side {
    world: World,
    index: NetworkObjectIndex,
    shadows: ShadowStore,
}

impl Side {
    fn new() -> Self {
        Self {
            world: World::new(),
            index: NetworkObjectIndex::new(),
            shadows: ShadowStore::new(),
        }
    }

    fn spawn(&mut self, uuid: &str, network_id: u32, authority: &str, transform: Transform) -> Entity {
        let entity = self
            .world
            .spawn((
                NetworkObject {
                    entity_uuid: uuid.into(),
                    owner_peer: PeerId::new("host"),
                    owner_user: UserId::new("u0"),
                    network_id,
                    authority_peer: PeerId::new(authority),
                },
                transform,
                Velocity::default(),
            ))
            .id();
        self.index
            .insert(uuid, PeerId::new("host"), network_id, entity);
        entity
    }

    fn write(&mut self, time: f64, local: &str) -> Vec<u8> {
        EntityFrameWriter::default()
            .write_frame(
                &self.world,
                &network(),
                &self.index,
                &SerializationSchema::standard(),
                &mut self.shadows,
                time,
                &PeerId::new(local),
            )
            .unwrap()
    }

    fn read(&mut self, bytes: &[u8], from: &str, local: &str) -> Result<FrameReport, FrameError> {
        EntityFrameReader::default().read_frame(
            &mut self.world,
            &network(),
            &self.index,
            &SerializationSchema::standard(),
            &PeerId::new(from),
            bytes,
            &PeerId::new(local),
        )
    }

    fn transform(&self, entity: Entity) -> Transform {
        *self.world.get::<Transform>(entity).unwrap()
    }
}

fn network() -> Network {
    let mut network = Network::new("net", Topic::world(), PeerId::new("host"));
    network.add_peer(PeerId::new("host"), UserId::new("u0"));
    network.add_peer(PeerId::new("p1"), UserId::new("u1"));
    network.add_peer(PeerId::new("p2"), UserId::new("u2"));
    network
}

fn at(x: f64, y: f64, z: f64) -> Transform {
    Transform {
        position: DVec3::new(x, y, z),
        rotation: Quat::IDENTITY,
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

// ---------------------------------------------------------------------------
// Write path
// ---------------------------------------------------------------------------

#[test]
fn test_first_frame_carries_full_state() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(1.0, 2.0, 3.0));
    let bytes = host.write(10.0, "host");

    assert_eq!(frame_time(&bytes).unwrap(), 10.0);
    assert_eq!(u32_at(&bytes, 8), 1);
    // Both components changed.
    assert_eq!(bytes[20], 0b11);
    // Transform: three axes plus rotation.
    assert_eq!(bytes[21], 0b1111);
    // header + key + mask + transform (1 + 24 + 4) + velocity (1 + 4)
    assert_eq!(bytes.len(), 12 + 9 + 29 + 5);
}

#[test]
fn test_unchanged_entity_emits_nothing_and_is_not_counted() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(0.0, 0.0, 0.0));
    let moving = host.spawn("e2", 1, "host", at(0.0, 0.0, 0.0));
    assert_eq!(u32_at(&host.write(1.0, "host"), 8), 2);

    host.world.get_mut::<Transform>(moving).unwrap().position.x = 1.0;
    let bytes = host.write(2.0, "host");
    assert_eq!(u32_at(&bytes, 8), 1);
    assert_eq!(u32_at(&bytes, 12), 1, "only e2 is present");
    // header + key + mask + transform mask + one f64
    assert_eq!(bytes.len(), 12 + 9 + 1 + 8);

    assert!(host.write(3.0, "host").is_empty());
}

#[test]
fn test_changed_axes_set_exact_bits_in_order() {
    let mut host = Side::new();
    let entity = host.spawn("e1", 7, "host", at(1.0, 2.0, 3.0));
    host.write(1.0, "host");

    {
        let mut transform = host.world.get_mut::<Transform>(entity).unwrap();
        transform.position.x = 5.0;
        transform.position.z = 7.0;
    }
    let bytes = host.write(2.0, "host");

    let mut expected = Vec::new();
    expected.extend_from_slice(&2.0f64.to_be_bytes());
    expected.extend_from_slice(&1u32.to_be_bytes());
    expected.extend_from_slice(&7u32.to_be_bytes());
    expected.extend_from_slice(&0u32.to_be_bytes());
    expected.push(0b01);
    expected.push(0b101);
    expected.extend_from_slice(&5.0f64.to_be_bytes());
    expected.extend_from_slice(&7.0f64.to_be_bytes());
    assert_eq!(bytes, expected);
}

#[test]
fn test_only_authoritative_entities_written() {
    let mut host = Side::new();
    host.spawn("e1", 0, "p1", at(1.0, 1.0, 1.0));
    assert!(host.write(1.0, "host").is_empty());
    assert!(host.shadows.is_empty());
}

#[test]
fn test_moves_below_epsilon_accumulate_until_sent() {
    let mut host = Side::new();
    let entity = host.spawn("e1", 0, "host", at(0.0, 0.0, 0.0));
    host.write(1.0, "host");

    host.world.get_mut::<Transform>(entity).unwrap().position.y = 0.00006;
    assert!(host.write(2.0, "host").is_empty());

    // Measured against the last value sent, not the last value seen.
    host.world.get_mut::<Transform>(entity).unwrap().position.y = 0.00012;
    let bytes = host.write(3.0, "host");
    assert_eq!(bytes[21], 0b010);
}

#[test]
fn test_clearing_shadows_resends_everything() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(1.0, 2.0, 3.0));
    let first = host.write(1.0, "host");
    assert!(host.write(2.0, "host").is_empty());

    host.shadows.clear();
    let again = host.write(3.0, "host");
    assert_eq!(again[8..], first[8..]);
}

#[test]
fn test_destroyed_entity_shadows_cleared() {
    let mut host = Side::new();
    let entity = host.spawn("e1", 0, "host", at(1.0, 2.0, 3.0));
    let other = host.spawn("e2", 1, "host", at(1.0, 2.0, 3.0));
    host.write(1.0, "host");
    assert_eq!(host.shadows.len(), 4);

    host.shadows.clear_entity(entity);
    assert_eq!(host.shadows.len(), 2);
    assert!(host.shadows.get::<Transform>("transform", other).is_some());
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_within_tolerance() {
    let rotation = Quat::from_euler(EulerRot::YXZ, 0.7, -0.3, 1.9);
    let mut host = Side::new();
    let source = host.spawn(
        "e1",
        0,
        "host",
        Transform {
            position: DVec3::new(1.5, -2.25, 1e6),
            rotation,
        },
    );
    host.world.get_mut::<Velocity>(source).unwrap().linear = Vec3::new(1.0, 2.0, -3.0);
    let bytes = host.write(4.0, "host");

    let mut peer = Side::new();
    let target = peer.spawn("e1", 0, "host", Transform::default());
    let report = peer.read(&bytes, "host", "p1").unwrap();
    assert_eq!(
        report,
        FrameReport {
            simulation_time: 4.0,
            entities: 1,
            applied: 1,
            rejected: 0,
        }
    );

    let received = peer.transform(target);
    assert_eq!(received.position, DVec3::new(1.5, -2.25, 1e6));
    let aligned = if received.rotation.dot(rotation) < 0.0 {
        -received.rotation
    } else {
        received.rotation
    };
    let error = (Vec4::from(aligned) - Vec4::from(rotation)).abs().max_element();
    assert!(error <= QUATERNION_STEP, "rotation error {error}");
    assert!((received.rotation.length() - 1.0).abs() < 1e-5);

    let step = CodecSettings::default().velocity.step();
    let linear = peer.world.get::<Velocity>(target).unwrap().linear;
    assert!((linear - Vec3::new(1.0, 2.0, -3.0)).abs().max_element() <= step);
}

#[test]
fn test_frame_from_non_authority_is_noop() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(9.0, 9.0, 9.0));
    let bytes = host.write(1.0, "host");

    let mut peer = Side::new();
    let target = peer.spawn("e1", 0, "host", Transform::default());
    let report = peer.read(&bytes, "p2", "p1").unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.rejected, 1);
    assert_eq!(peer.transform(target), Transform::default());
}

#[test]
fn test_frame_for_locally_authoritative_entity_is_noop() {
    let mut host = Side::new();
    host.spawn("e1", 0, "p1", at(9.0, 9.0, 9.0));
    let bytes = host.write(1.0, "p1");
    assert!(!bytes.is_empty());

    let mut peer = Side::new();
    let target = peer.spawn("e1", 0, "p1", Transform::default());
    let report = peer.read(&bytes, "p1", "p1").unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(peer.transform(target), Transform::default());
}

#[test]
fn test_rejected_entry_still_consumes_its_bytes() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(1.0, 1.0, 1.0));
    host.spawn("e2", 1, "host", at(2.0, 2.0, 2.0));
    let bytes = host.write(1.0, "host");

    // The peer never heard of e1.
    let mut peer = Side::new();
    let known = peer.spawn("e2", 1, "host", Transform::default());
    let report = peer.read(&bytes, "host", "p1").unwrap();
    assert_eq!(report.entities, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(peer.transform(known).position, DVec3::splat(2.0));
}

#[test]
fn test_truncated_frame_changes_nothing() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(1.0, 1.0, 1.0));
    host.spawn("e2", 1, "host", at(2.0, 2.0, 2.0));
    let bytes = host.write(1.0, "host");

    let mut peer = Side::new();
    let first = peer.spawn("e1", 0, "host", Transform::default());
    let err = peer
        .read(&bytes[..bytes.len() - 3], "host", "p1")
        .unwrap_err();
    assert!(matches!(
        err,
        FrameError::Truncated(CursorError::OutOfBounds { needed: 4, .. })
    ));
    assert_eq!(peer.transform(first), Transform::default());

    assert!(matches!(
        peer.read(&bytes[..6], "host", "p1"),
        Err(FrameError::Truncated(_))
    ));
}

#[test]
fn test_unknown_component_bit_rejected() {
    let mut cursor = WriteCursor::new();
    cursor.write_f64(0.0);
    cursor.write_u32(1);
    cursor.write_u32(0);
    cursor.write_u32(0);
    cursor.write_u8(0b100);
    let mut peer = Side::new();
    assert_eq!(
        peer.read(cursor.as_bytes(), "host", "p1").unwrap_err(),
        FrameError::UnknownComponent(2)
    );
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut host = Side::new();
    host.spawn("e1", 0, "host", at(1.0, 1.0, 1.0));
    let mut bytes = host.write(1.0, "host");
    bytes.push(0);

    let mut peer = Side::new();
    let target = peer.spawn("e1", 0, "host", Transform::default());
    assert_eq!(
        peer.read(&bytes, "host", "p1").unwrap_err(),
        FrameError::TrailingBytes(1)
    );
    assert_eq!(peer.transform(target), Transform::default());
}

#[test]
fn test_empty_frame_reads_as_nothing() {
    let mut peer = Side::new();
    assert_eq!(peer.read(&[], "host", "p1").unwrap(), FrameReport::default());
}

#[test]
fn test_schema_limited_to_eight_components() {
    assert!(SerializationSchema::new(vec![TRANSFORM; 8]).is_ok());
    assert_eq!(
        SerializationSchema::new(vec![VELOCITY; 9]).unwrap_err(),
        FrameError::SchemaTooLarge(9)
    );
    assert_eq!(SerializationSchema::standard().len(), 2);
}
