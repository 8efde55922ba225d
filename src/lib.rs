pub mod config;
pub mod server;
pub mod torch;
pub mod transform;
