pub mod analysis;
pub mod behavior;
pub mod client;
pub mod cluster;
pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod groups;
pub mod matrix;
pub mod output;
pub mod person;
pub mod products;
pub mod randomization;
pub mod types;
