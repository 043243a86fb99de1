//! Scheduling and synchronisation core of a digital-signage kiosk.
//!
//! A primary instance rotates a playlist of assets and pushes show-events
//! to its local renderer and, signed, to any paired secondaries. A secondary
//! verifies and replays what its primary shows.

pub mod asset;
pub mod control;
pub mod display;
pub mod engine;
pub mod error;
pub mod hub;
pub mod playlist;
pub mod registry;
pub mod remote;
pub mod roles;
pub mod routes;
pub mod scheduler;
pub mod secondary;
pub mod settings;
pub mod show;
pub mod signing;
pub mod store;
pub mod timer;
pub mod uploads;

#[cfg(test)]
mod testing;
