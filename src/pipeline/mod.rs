pub mod annotate;
pub mod client;
pub mod orchestrator;
pub mod prompt;
pub mod rasterize;
pub mod schema;
