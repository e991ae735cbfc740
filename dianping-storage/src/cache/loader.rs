//! Loaders fetch the source-of-truth value for a cache key.

use async_trait::async_trait;
use dianping_core::DianpingResult;
use std::future::Future;
use std::marker::PhantomData;

/// Fetches a value from the record store. `Ok(None)` means the id does not
/// exist.
#[async_trait]
pub trait Loader<Id, T>: Send + Sync + 'static
where
    Id: Send + Sync + 'static,
    T: Send + 'static,
{
    async fn load(&self, id: &Id) -> DianpingResult<Option<T>>;
}

/// Adapts an async closure into a `Loader`.
pub struct FnLoader<F, Id, T> {
    f: F,
    _marker: PhantomData<fn(Id) -> T>,
}

impl<F, Id, T> FnLoader<F, Id, T> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, Id, T> Loader<Id, T> for FnLoader<F, Id, T>
where
    F: Fn(Id) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DianpingResult<Option<T>>> + Send + 'static,
    Id: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    async fn load(&self, id: &Id) -> DianpingResult<Option<T>> {
        (self.f)(id.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_loader() {
        let loader: FnLoader<_, u64, u64> = FnLoader::new(|id: u64| async move {
            Ok::<_, dianping_core::DianpingError>(if id % 2 == 0 { Some(id * 10) } else { None })
        });
        assert_eq!(loader.load(&4).await.unwrap(), Some(40));
        assert_eq!(loader.load(&3).await.unwrap(), None);
    }
}
