//! CRD conversion webhook
//!
//! The API server posts a `ConversionReview` to `/convert` whenever a
//! client reads or writes a version other than the stored one. Objects
//! are converted through the `v1beta1` hub by `crd::convert_object`.

pub mod server;

pub use server::{convert_review, router, TlsConfig, WebhookServer};
