//! Ranked backend selection shared by the detector and recognizer gateways.

use std::error::Error;

type Constructor<B> = Box<dyn FnOnce() -> Result<Box<B>, Box<dyn Error + Send + Sync>> + Send>;

/// A named, lazily-constructed backend candidate.
pub struct BackendCandidate<B: ?Sized> {
    name: &'static str,
    construct: Constructor<B>,
}

impl<B: ?Sized> BackendCandidate<B> {
    pub fn new<F, E>(name: &'static str, construct: F) -> Self
    where
        F: FnOnce() -> Result<Box<B>, E> + Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        Self {
            name,
            construct: Box::new(move || construct().map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Construct candidates in order and keep the first that succeeds.
///
/// Later candidates are never constructed once one succeeds.
pub(crate) fn select_first<B: ?Sized>(kind: &str, candidates: Vec<BackendCandidate<B>>) -> Option<Box<B>> {
    for candidate in candidates {
        match (candidate.construct)() {
            Ok(backend) => {
                tracing::info!(kind, backend = candidate.name, "backend selected");
                return Some(backend);
            }
            Err(e) => {
                tracing::warn!(kind, backend = candidate.name, error = %e, "backend unavailable");
            }
        }
    }
    tracing::warn!(kind, "no backend available; results will be empty");
    None
}
