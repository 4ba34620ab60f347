//! Connection and factory capabilities supplied by connector modules.
//!
//! The pool never knows what a connection is. Connectors hand it a
//! [`ConnectionFactory`] that knows how to create, validate and destroy
//! their resources, and get back opaque `Arc<dyn Connection>` handles they
//! can downcast to the concrete type.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type erasure for [`Connection`] handles.
///
/// Implemented for every `'static + Send + Sync` type, so connectors never
/// implement it by hand.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Marker for any pooled or standalone resource (database session, broker
/// channel, API client, ...).
///
/// Has no behavior of its own: callers use the concrete type and eventually
/// hand the handle back to the registry or pool it came from.
pub trait Connection: AsAny + fmt::Debug {}

impl dyn Connection {
    /// Borrow the concrete connection type, if it is `T`.
    pub fn downcast_ref<T: Connection>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Whether the concrete connection type is `T`.
    pub fn is<T: Connection>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

/// Recover a shared handle to the concrete connection type.
///
/// Returns `None` (dropping the handle) when the connection is not a `T`.
pub fn downcast_arc<T: Connection>(connection: Arc<dyn Connection>) -> Option<Arc<T>> {
    AsAny::into_any_arc(connection).downcast::<T>().ok()
}

/// Creation, validation and destruction strategy for one kind of connection.
///
/// Implementations are called outside the pool's critical section and may
/// block briefly (e.g. a network round-trip for `validate`).
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection.
    fn create(&self) -> anyhow::Result<Arc<dyn Connection>>;

    /// Check that a connection is still usable.
    ///
    /// The pool treats a panic here the same as `false`.
    fn validate(&self, _connection: &dyn Connection) -> bool {
        true
    }

    /// Tear a connection down. Errors are logged by the pool, never propagated.
    fn destroy(&self, connection: Arc<dyn Connection>) -> anyhow::Result<()> {
        drop(connection);
        Ok(())
    }
}
