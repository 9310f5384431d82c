pub mod embedding;
pub mod http;
pub mod provider;
