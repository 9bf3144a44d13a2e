pub mod api;

pub use api::{BackendClient, IngestApi};
