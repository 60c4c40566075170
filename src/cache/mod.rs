//! Cache engine internals
//!
//! The public surface lives in the crate root; these modules are exposed for
//! embedders that plug in their own tiers, serializers or clock.

pub mod clock;
pub mod coordinator;
pub mod invalidation;
pub mod item;
pub mod memory;
pub mod serializer;
pub mod stampede;
pub mod tags;
pub mod tier;
pub mod types;
pub mod wire;
