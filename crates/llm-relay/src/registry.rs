//! Name-keyed factories for building generators from configuration.
//!
//! Backend crates register a [`GeneratorFactory`] under a provider name;
//! applications then pick a backend from a config file or environment
//! without naming its type at compile time.
//!
//! ```rust,no_run
//! use llm_relay::registry::{GeneratorConfig, GeneratorRegistry};
//!
//! # fn example() -> Result<(), llm_relay::LlmError> {
//! let config = GeneratorConfig::new("anthropic", "claude-sonnet")
//!     .api_key("sk-...");
//! let generator = GeneratorRegistry::global().build(&config)?;
//! # let _ = generator;
//! # Ok(())
//! # }
//! ```
//!
//! # Registering a backend
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::future::BoxFuture;
//! use llm_relay::registry::{GeneratorConfig, GeneratorFactory, GeneratorRegistry};
//! use llm_relay::{Dialog, GenOptions, Generator, LlmError, Response};
//!
//! # struct MyGenerator { model: String }
//! # impl MyGenerator {
//! #     fn connect(config: &GeneratorConfig) -> Result<Self, LlmError> {
//! #         Ok(Self { model: config.model.clone() })
//! #     }
//! # }
//! # impl Generator for MyGenerator {
//! #     fn generate<'a>(&'a self, _: &'a Dialog, _: &'a GenOptions)
//! #         -> BoxFuture<'a, Result<Response, LlmError>> {
//! #         Box::pin(async { Ok(Response::empty()) })
//! #     }
//! # }
//! struct MyFactory;
//!
//! impl GeneratorFactory for MyFactory {
//!     fn name(&self) -> &str { "my-backend" }
//!
//!     fn build(&self, config: &GeneratorConfig) -> Result<Arc<dyn Generator>, LlmError> {
//!         Ok(Arc::new(MyGenerator::connect(config)?))
//!     }
//! }
//!
//! GeneratorRegistry::global().register(Box::new(MyFactory));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::Value;

use crate::error::LlmError;
use crate::generator::Generator;

/// Settings shared by every backend, plus a free-form `extra` map.
#[derive(Debug, Clone, Default)]
pub struct GeneratorConfig {
    /// Registry key, matched case-insensitively.
    pub provider: String,
    /// Model identifier understood by the backend.
    pub model: String,
    /// Credential for authenticated backends.
    pub api_key: Option<String>,
    /// Endpoint override.
    pub base_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
    /// Backend-specific options. Each backend documents the keys it reads.
    pub extra: HashMap<String, Value>,
}

impl GeneratorConfig {
    /// A config for `model` on the `provider` backend.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a backend-specific option.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// A string option from `extra`.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// A boolean option from `extra`.
    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(Value::as_bool)
    }

    /// An integer option from `extra`.
    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(Value::as_i64)
    }
}

/// Builds generators for one backend.
pub trait GeneratorFactory: Send + Sync {
    /// Lowercase registry key, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Creates a generator from `config`.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports for a missing or invalid setting.
    fn build(&self, config: &GeneratorConfig) -> Result<Arc<dyn Generator>, LlmError>;
}

/// Thread-safe map from provider name to [`GeneratorFactory`].
///
/// Use [`GeneratorRegistry::global`] for the process-wide instance or
/// [`GeneratorRegistry::new`] for an isolated one (tests, embedded use).
pub struct GeneratorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn GeneratorFactory>>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<GeneratorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(GeneratorRegistry::new)
    }

    // A panic while holding the lock cannot leave the map half-updated,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn GeneratorFactory>>> {
        self.factories.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn GeneratorFactory>>> {
        self.factories.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `factory`, replacing any factory with the same name.
    pub fn register(&self, factory: Box<dyn GeneratorFactory>) -> &Self {
        self.register_shared(Arc::from(factory))
    }

    /// Registers a shared factory, replacing any factory with the same name.
    pub fn register_shared(&self, factory: Arc<dyn GeneratorFactory>) -> &Self {
        let name = factory.name().to_lowercase();
        tracing::debug!(provider = %name, "registered generator factory");
        self.write().insert(name, factory);
        self
    }

    /// Removes a factory. Returns `true` if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(&name.to_lowercase()).is_some()
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(&name.to_lowercase())
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds a generator with the factory named by `config.provider`.
    ///
    /// # Errors
    ///
    /// [`LlmError::InvalidParameter`] if no factory has that name; otherwise
    /// whatever the factory returns.
    pub fn build(&self, config: &GeneratorConfig) -> Result<Arc<dyn Generator>, LlmError> {
        let factory = {
            let factories = self.read();
            match factories.get(&config.provider.to_lowercase()) {
                Some(factory) => Arc::clone(factory),
                None => {
                    let mut available: Vec<_> = factories.keys().cloned().collect();
                    available.sort();
                    return Err(LlmError::InvalidParameter {
                        parameter: "provider".into(),
                        message: format!(
                            "unknown provider {:?}, available: {available:?}",
                            config.provider
                        ),
                    });
                }
            }
        };
        factory.build(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Capability;
    use crate::mock::MockGenerator;

    struct MockFactory;

    impl GeneratorFactory for MockFactory {
        fn name(&self) -> &'static str {
            "Mock"
        }

        fn build(&self, config: &GeneratorConfig) -> Result<Arc<dyn Generator>, LlmError> {
            if config.model.is_empty() {
                return Err(LlmError::InvalidParameter {
                    parameter: "model".into(),
                    message: "required".into(),
                });
            }
            let streaming = config.extra_bool("streaming").unwrap_or(true);
            let capabilities = if streaming {
                vec![Capability::Streaming]
            } else {
                Vec::new()
            };
            Ok(Arc::new(MockGenerator::new().with_capabilities(capabilities)))
        }
    }

    #[test]
    fn test_register_and_build() {
        let registry = GeneratorRegistry::new();
        registry.register(Box::new(MockFactory));

        assert!(registry.contains("mock"));
        assert!(registry.contains("MOCK"));

        let generator = registry
            .build(&GeneratorConfig::new("mock", "m1").extra("streaming", false))
            .unwrap();
        assert!(generator.capabilities().is_empty());

        let generator = registry.build(&GeneratorConfig::new("mock", "m1")).unwrap();
        assert!(generator.capabilities().contains(&Capability::Streaming));
    }

    #[test]
    fn test_unknown_provider_lists_available() {
        let registry = GeneratorRegistry::new();
        registry.register(Box::new(MockFactory));

        let err = registry
            .build(&GeneratorConfig::new("nope", "m"))
            .err()
            .unwrap();
        match err {
            LlmError::InvalidParameter { parameter, message } => {
                assert_eq!(parameter, "provider");
                assert!(message.contains("mock"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_factory_error_propagates() {
        let registry = GeneratorRegistry::new();
        registry.register(Box::new(MockFactory));
        let err = registry.build(&GeneratorConfig::new("mock", "")).err().unwrap();
        assert!(matches!(err, LlmError::InvalidParameter { parameter, .. } if parameter == "model"));
    }

    #[test]
    fn test_unregister() {
        let registry = GeneratorRegistry::new();
        registry.register(Box::new(MockFactory));
        assert!(registry.unregister("mock"));
        assert!(!registry.contains("mock"));
        assert!(!registry.unregister("mock"));
    }

    #[test]
    fn test_providers_sorted() {
        struct Named(&'static str);
        impl GeneratorFactory for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn build(&self, _: &GeneratorConfig) -> Result<Arc<dyn Generator>, LlmError> {
                Ok(Arc::new(MockGenerator::new()))
            }
        }

        let registry = GeneratorRegistry::new();
        registry
            .register(Box::new(Named("zeta")))
            .register_shared(Arc::new(Named("alpha")));
        assert_eq!(registry.providers(), vec!["alpha", "zeta"]);
        assert!(format!("{registry:?}").contains("alpha"));
    }

    #[test]
    fn test_config_builder() {
        let config = GeneratorConfig::new("openai", "gpt")
            .api_key("sk-1")
            .base_url("http://localhost:8080")
            .timeout(Duration::from_secs(30))
            .extra("org", "acme")
            .extra("max_retries", 4);

        assert_eq!(config.api_key.as_deref(), Some("sk-1"));
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.extra_str("org"), Some("acme"));
        assert_eq!(config.extra_i64("max_retries"), Some(4));
        assert_eq!(config.extra_bool("org"), None);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(GeneratorRegistry::global(), GeneratorRegistry::global()));
    }
}
