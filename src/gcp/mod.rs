//! Outbound GCP clients: token resolution plus thin JSON-API wrappers
//! for Cloud Storage, Pub/Sub, and Cloud KMS.

pub mod auth;
pub mod gcs;
pub mod kms;
pub mod pubsub;
