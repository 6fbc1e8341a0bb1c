mod error;
mod ingestion_config;
mod payload_normalizer;
mod reading_ingestion_service;
mod timestamp;
mod topic;

pub use error::*;
pub use ingestion_config::*;
pub use payload_normalizer::*;
pub use reading_ingestion_service::*;
pub use timestamp::*;
pub use topic::*;
