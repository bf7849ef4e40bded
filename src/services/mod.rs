pub mod charts;
pub mod ingest;
pub mod insight;
pub mod pipeline;
pub mod profile;
