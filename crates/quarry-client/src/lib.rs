pub mod adzuna;
pub mod cleaner;
mod http;
pub mod remoteok;
pub mod service;

use std::sync::Arc;

use quarry_core::AppError;
use quarry_core::traits::SourceAdapter;

pub use adzuna::{AdzunaAdapter, AdzunaCredentials};
pub use remoteok::RemoteOkAdapter;
pub use service::HttpServiceInvoker;

/// The adapters shipped with Quarry, configured from the environment.
/// Adzuna is included even without credentials and reports itself as
/// unconfigured.
pub fn default_adapters() -> Result<Vec<Arc<dyn SourceAdapter>>, AppError> {
    Ok(vec![
        Arc::new(RemoteOkAdapter::new()?),
        Arc::new(AdzunaAdapter::from_env()?),
    ])
}
