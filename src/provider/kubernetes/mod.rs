//! # Kubernetes Backends
//!
//! - `target`: server-side apply of manifest documents through the dynamic API
//! - `secrets`: `Secret`-backed source secrets
//! - `watch`: forced refresh when a watched source secret changes

mod secrets;
mod target;
mod watch;

pub use secrets::KubeSecretSource;
pub use target::KubeTarget;
pub use watch::start_source_secret_watch;

/// Map a kube client error onto a status code, when the API server returned one
fn api_error_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(api_err) => Some(api_err.code),
        _ => None,
    }
}
