//! Matrix client-server API request and response bodies.

pub mod auth;
pub mod devices;
pub mod events;
pub mod keys;
pub mod room_keys;
pub mod sync;
pub mod to_device;
pub mod verification;
