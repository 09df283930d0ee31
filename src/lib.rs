pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod scan;
pub mod store;
pub mod streaks;
