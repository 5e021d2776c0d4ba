// Authentication module
// Decision: bearer tokens mapped to roles; admin tokens authorize writes,
//           reader tokens authorize reads, and admins can read too
// Decision: "none" mode for local development disables enforcement

pub mod config;
pub mod middleware;

pub use config::{AuthConfig, AuthMode};
pub use middleware::{require_admin, require_auth, AuthState};
