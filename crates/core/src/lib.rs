pub mod agent;
pub mod config;
pub mod dialogue;
pub mod embedding;
pub mod emotion;
pub mod error;
pub mod persona;
pub mod policy;
pub mod trajectory;
pub mod types;
