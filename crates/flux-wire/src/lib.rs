//! Wire primitives: bounds-checked binary cursors, fixed-size vector and
//! rotation packing, and the envelope used for reliable-channel payloads.

pub mod cursor;
pub mod envelope;
pub mod packing;

pub use cursor::{CursorError, ReadCursor, ReservedU8, ReservedU32, WriteCursor};
pub use envelope::{EnvelopeConfig, EnvelopeError, open, seal};
pub use packing::{
    QUATERNION_STEP, VectorPacking, pack_quaternion, unpack_quaternion,
};
