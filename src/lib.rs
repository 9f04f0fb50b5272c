pub mod config;
pub mod fatal;
pub mod group;
pub mod net;
pub mod payload;
pub mod protocol;
