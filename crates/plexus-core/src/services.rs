//! Name → instance lookup shared between plugins.
//!
//! Services are stored type-erased and recovered with a typed lookup. Names
//! listed in [`CORE_SERVICES`] belong to the kernel: registering one of them
//! without `allow_override` is an error. Any other name may be replaced
//! silently apart from a warning, which lets plugins layer on top of each
//! other's services.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use crate::CoreError;

/// Service names reserved by the kernel.
pub const CORE_SERVICES: &[&str] = &[
    "kernel",
    "events",
    "services",
    "clock",
    "scheduler",
    "commands",
    "rng",
    "state",
    "snapshots",
    "migrations",
];

/// Type-erased service registry.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Box<dyn Any>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is reserved by the kernel.
    pub fn is_core(name: &str) -> bool {
        CORE_SERVICES.contains(&name)
    }

    /// Register `value` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReservedService`] when `name` is a core service
    /// and `allow_override` is false. Core names always count as taken: the
    /// kernel itself occupies them. A collision on any other name is logged
    /// and the new value wins.
    pub fn register<T: Any>(
        &mut self,
        name: &str,
        value: T,
        allow_override: bool,
    ) -> Result<(), CoreError> {
        if !allow_override {
            if Self::is_core(name) {
                return Err(CoreError::ReservedService {
                    name: name.to_owned(),
                });
            }
            if self.services.contains_key(name) {
                tracing::warn!(service = name, "service overridden without allow_override");
            }
        }
        self.services.insert(name.to_owned(), Box::new(value));
        Ok(())
    }

    /// The service called `name`, if present and of type `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.services.get(name)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.services.get_mut(name)?.downcast_mut::<T>()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Remove `name`, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Audio {
        volume: u8,
    }

    #[test]
    fn typed_lookup() {
        let mut services = ServiceRegistry::new();
        services.register("audio", Audio { volume: 3 }, false).unwrap();

        assert_eq!(services.get::<Audio>("audio"), Some(&Audio { volume: 3 }));
        assert_eq!(services.get::<String>("audio"), None);
        assert_eq!(services.get::<Audio>("video"), None);

        services.get_mut::<Audio>("audio").unwrap().volume = 9;
        assert_eq!(services.get::<Audio>("audio").unwrap().volume, 9);
    }

    #[test]
    fn non_core_collision_replaces() {
        let mut services = ServiceRegistry::new();
        services.register("audio", Audio { volume: 1 }, false).unwrap();
        services.register("audio", Audio { volume: 2 }, false).unwrap();
        assert_eq!(services.get::<Audio>("audio").unwrap().volume, 2);
    }

    #[test]
    fn core_collision_requires_override() {
        let mut services = ServiceRegistry::new();
        let err = services.register("clock", 2u32, false).unwrap_err();
        assert!(matches!(err, CoreError::ReservedService { ref name } if name == "clock"));
        assert!(!services.contains("clock"));

        services.register("clock", 1u32, true).unwrap();
        assert_eq!(services.get::<u32>("clock"), Some(&1));
        assert!(services.register("clock", 2u32, false).is_err());
        assert_eq!(services.get::<u32>("clock"), Some(&1));

        services.register("clock", 3u32, true).unwrap();
        assert_eq!(services.get::<u32>("clock"), Some(&3));
    }
}
