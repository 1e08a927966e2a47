//! Foundational and often-reused types.

pub mod clock;
pub mod cost;
pub mod identity;
pub mod message;
pub mod pool;
pub mod traits;
pub mod waiting;
