//! Scoped dependency resolution for handlers.
//!
//! A [`ServiceProvider`] holds one factory per handler (or dependency)
//! type. The consumer loop opens one [`Scope`] per delivered message;
//! everything resolved inside that scope is built at most once and dropped
//! with the scope when the message is done.
//!
//! ```
//! use std::sync::Arc;
//! use integration_bus::ServiceProvider;
//!
//! struct Clock;
//! struct AuditHandler { clock: Arc<Clock> }
//!
//! let services = ServiceProvider::new();
//! services
//!     .add_singleton(Clock)
//!     .add_scoped(|scope| AuditHandler { clock: scope.resolve::<Clock>().unwrap() });
//!
//! let scope = services.create_scope();
//! let a = scope.resolve::<AuditHandler>().unwrap();
//! let b = scope.resolve::<AuditHandler>().unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Scope) -> Instance + Send + Sync>;

/// Registry of factories, shared by every scope it creates.
///
/// Cloning yields another handle to the same registrations.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    factories: Arc<RwLock<HashMap<TypeId, Factory>>>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory that builds a new `T` once per scope.
    pub fn add_scoped<T, F>(&self, build: F) -> &Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Scope) -> T + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |scope: &Scope| Arc::new(build(scope)) as Instance);
        self.insert::<T>(factory);
        self
    }

    /// Register one shared `T` handed to every scope.
    pub fn add_singleton<T>(&self, instance: T) -> &Self
    where
        T: Send + Sync + 'static,
    {
        let shared: Instance = Arc::new(instance);
        self.insert::<T>(Arc::new(move |_: &Scope| Arc::clone(&shared)));
        self
    }

    /// Whether a factory is registered for `T`.
    pub fn contains<T: 'static>(&self) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    pub fn create_scope(&self) -> Scope {
        Scope {
            provider: self.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn insert<T: 'static>(&self, factory: Factory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), factory);
    }

    fn factory(&self, type_id: TypeId) -> Option<Factory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned()
    }
}

/// One resolution scope; instances are cached for its lifetime.
pub struct Scope {
    provider: ServiceProvider,
    instances: Mutex<HashMap<TypeId, Instance>>,
}

impl Scope {
    /// Resolve `T`, building it on first use. `None` if nothing is registered.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();
        let cached = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned();

        let instance = match cached {
            Some(instance) => instance,
            None => {
                // built without holding the lock; factories may resolve their own dependencies
                let built = (self.provider.factory(type_id)?)(self);
                self.instances
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(type_id)
                    .or_insert(built)
                    .clone()
            }
        };

        instance.downcast::<T>().ok()
    }
}
