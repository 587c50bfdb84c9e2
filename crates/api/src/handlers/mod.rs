pub mod cluster;
pub mod health;
