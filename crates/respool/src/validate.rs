//! Validation of resources before they are pooled and during garbage collection.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::resource::Resource;

#[derive(Debug, Clone, thiserror::Error)]
#[error("Validation error: {0}")]
pub struct ValidationError(pub String);

/// Decides whether a resource is usable.
///
/// `Ok(false)` means the resource is definitely invalid. An error means the
/// check itself could not be completed.
#[async_trait]
pub trait Validator<T>: Send + Sync {
    async fn validate(&self, resource: &Resource<T>) -> Result<bool, ValidationError>;
}

/// Adapts an async closure into a [`Validator`].
///
/// The closure receives a clone of the resource so the returned future does
/// not borrow from the pool.
pub struct FnValidator<T, F> {
    check: F,
    _resource: PhantomData<fn(T)>,
}

impl<T, F, Fut> FnValidator<T, F>
where
    F: Fn(Resource<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ValidationError>> + Send,
{
    pub fn new(check: F) -> Self {
        Self {
            check,
            _resource: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Validator<T> for FnValidator<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Resource<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, ValidationError>> + Send + 'static,
{
    async fn validate(&self, resource: &Resource<T>) -> Result<bool, ValidationError> {
        (self.check)(resource.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_validator_checks_payload() {
        let validator = FnValidator::new(|r: Resource<u32>| async move { Ok(r.payload > 10) });

        assert!(
            validator
                .validate(&Resource::with_id("big", 42))
                .await
                .unwrap()
        );
        assert!(
            !validator
                .validate(&Resource::with_id("small", 1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn fn_validator_propagates_errors() {
        let validator = FnValidator::new(|_: Resource<()>| async {
            Err(ValidationError("probe timed out".to_string()))
        });

        let err = validator
            .validate(&Resource::with_id("r", ()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: probe timed out");
    }
}
