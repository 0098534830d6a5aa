//! MVP backend implementations
//!
//! Two backends available:
//! - **Software**: interprets program images on the host against device memory
//! - **Trace**: records program images, optionally forwarding to another backend

pub mod software;
pub mod trace;

pub use software::SoftwareBackend;
pub use trace::{TraceBackend, TraceLog};
