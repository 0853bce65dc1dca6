use crate::error::ResolveError;
use async_trait::async_trait;

/// The remote that owns the truth the cache mirrors.
#[async_trait]
pub trait SourceOfRecord<Key, Value>: Send + Sync
where
    Key: Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    /// Fails with `RemoteUnavailable` when the remote cannot be reached and `InvalidResponse`
    /// when it answers with something that cannot be parsed.
    async fn retrieve(&self, key: &Key) -> Result<Value, ResolveError>;

    /// Accepts current value if one exists in case it can be used for optimized load
    /// ex. If building an HTTP cache, and you receive a 304 response, replay the current value
    async fn retrieve_with_hint(
        &self,
        key: &Key,
        _current_value: &Value,
    ) -> Result<Value, ResolveError> {
        //The default case is no current value based optimization, so provide pass-through implementation
        self.retrieve(key).await
    }

    /// Shape check applied both to values read back from the cache and to fresh remote responses.
    fn is_valid(&self, key: &Key, value: &Value) -> bool;
}
