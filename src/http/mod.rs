//! HTTP values, the network seam, and the two credential transforms.

pub mod credentials;
pub mod network;
pub mod sanitize;
pub mod types;

pub use credentials::CredentialStore;
pub use network::{HttpNetwork, Network};
pub use types::{Request, Response};
