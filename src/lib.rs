//! CloudShim — protocol-translation sidecar core.
//!
//! CloudShim terminates cloud-provider HTTP APIs (S3, Kinesis, SQS, GCS)
//! on loopback ports and re-issues the equivalent operations against the
//! other provider.  A client configured to talk to S3 at
//! `127.0.0.1:<port>` transparently writes to a GCS bucket, and the
//! other way around.  Incoming request signatures are accepted and
//! discarded; outgoing calls are re-signed with server-side credentials.
//!
//! The crate is organized around a hot-reloadable listener supervisor
//! ([`supervisor`]) that binds one server per configured tenant and
//! swaps tenant routers atomically on config change, and the
//! per-protocol translators under [`handlers`].

pub mod chunked;
pub mod config;
pub mod convert;
pub mod errors;
pub mod gcp;
pub mod handlers;
pub mod metrics;
pub mod multipart;
pub mod server;
pub mod supervisor;
pub mod upload;
pub mod xml;
