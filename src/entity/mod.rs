//! Entity layer modules.

pub mod entity;

pub use entity::{Entity, EntityStatus, EntityType};
pub use crate::ids::EntityId;
