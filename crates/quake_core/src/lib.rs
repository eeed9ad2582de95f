pub mod archive;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod geo;
pub mod locator;
pub mod quality;
pub mod scheduler;
pub mod station;
pub mod synthetic;
pub mod tracker;
pub mod travel_time;
pub mod types;
