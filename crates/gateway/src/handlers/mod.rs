//! API handlers module

pub mod admin;
pub mod beds;
pub mod health;
pub mod me;
pub mod realtime;
