//! Primitives for loading and querying layered configuration data.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use chassis_error::GenericError;
use figment::{error::Kind, providers::Env, providers::Serialized, Figment, Provider};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        ///
        /// Meant to be shown to the user. Includes the environment variable form of the key when
        /// environment variables were one of the configured sources.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field had an unexpected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field, as a period-separated path.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e.into() },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    /// The configuration key is looked up in a form suitable for environment variables.
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is already uppercased with a trailing underscore by the time it lands
            // here, since that form is needed to configure the environment provider itself.
            LookupSource::Environment { prefix } => {
                format!("{}{}", prefix, key.replace('.', "_").to_uppercase())
            }
        }
    }
}

struct BoxedProvider(Box<dyn figment::Provider + Send + Sync>);

impl figment::Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// This is a thin wrapper over a lower-level library, `figment`, exposing a focused API for
/// loading configuration data and querying it. Sources added later take precedence over sources
/// added earlier. Once all sources are added, the loader is consumed either into a typed value
/// ([`into_typed`][Self::into_typed]) or into a generic queryable form
/// ([`into_generic`][Self::into_generic]).
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let resolved = ResolvedProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(resolved)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved) => {
                self.providers.push(BoxedProvider(Box::new(resolved)));
            }
            Err(e) => {
                tracing::debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid JSON, an error is returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let resolved = ResolvedProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(resolved)));
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable, and not being valid JSON.
    pub fn try_from_json<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match ResolvedProvider::from_json(&path) {
            Ok(resolved) => {
                self.providers.push(BoxedProvider(Box::new(resolved)));
            }
            Err(e) => {
                tracing::debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read JSON configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given has an underscore appended to it if it does not already end with one,
    /// so a prefix of `app` matches any environment variable starting with `APP_`. The prefix is
    /// case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // Snapshot the environment into a `Serialized` provider, since `Env` itself isn't
        // `Send + Sync`.
        let env = Env::prefixed(&prefix);
        let values = env.data().map_err(|e| ConfigurationError::Generic { source: e.into() })?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    /// Consumes the configuration loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));
        figment.extract().map_err(Into::into)
    }

    /// Consumes the configuration loader, wrapping the merged configuration in a generic
    /// queryable form.
    pub fn into_generic(self) -> GenericConfiguration {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                lookup_sources: self.lookup_sources,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    lookup_sources: HashSet<LookupSource>,
}

/// A generic configuration object.
///
/// This is the merged configuration derived from [`ConfigurationLoader`], in raw form. Values
/// are queried by key, where periods (`.`) indicate a nested lookup: with a configuration of
/// `{ "a": { "b": "value" } }`, querying `a.b` returns `"value"` and querying `a` returns the
/// nested object.
///
/// Cheap to clone and safe to share between tasks.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(e.kind, figment::error::Kind::MissingField(_)) {
                    // The key may use nested notation (`foo.bar`) but only be present via
                    // environment variables, which flatten nesting with underscores. Rather than
                    // teaching the environment provider a separate separator, retry with the
                    // separators replaced.
                    let fallback_key = key.replace('.', "_");
                    self.inner
                        .figment
                        .extract_inner(&fallback_key)
                        .map_err(|fallback_e| from_figment_error(&self.inner.lookup_sources, fallback_e))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Gets a configuration value by key.
    ///
    /// The key must be in the form of `a.b.c`, where periods (`.`) indicate a nested lookup.
    ///
    /// # Errors
    ///
    /// If the key does not exist in the configuration, or if the value could not be deserialized
    /// into `T`, an error is returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, or the default value if the key does not exist or
    /// could not be deserialized.
    ///
    /// This swallows lookup and deserialization errors entirely, so it should be reserved for
    /// settings where the default is always acceptable.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// Returns `Ok(Some(value))` when the key exists and deserializes cleanly, and `Ok(None)`
    /// when the key is absent.
    ///
    /// # Errors
    ///
    /// If the value could not be deserialized into `T`, an error is returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to deserialize the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| from_figment_error(&self.inner.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();

            // The original key is always worth suggesting too.
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize)]
    struct ListenConfig {
        listen_addr: String,
        max_conns: u64,
    }

    fn write_temp_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn yaml_nested_lookup() {
        let path = write_temp_config(
            "chassis-config-test-nested.yaml",
            "server:\n  listen_addr: 127.0.0.1:8080\n  max_conns: 32\n",
        );

        let config = ConfigurationLoader::default().from_yaml(&path).unwrap().into_generic();

        let addr: String = config.get_typed("server.listen_addr").unwrap();
        assert_eq!(addr, "127.0.0.1:8080");

        let server: ListenConfig = config.get_typed("server").unwrap();
        assert_eq!(server.listen_addr, "127.0.0.1:8080");
        assert_eq!(server.max_conns, 32);
    }

    #[test]
    fn later_sources_take_precedence() {
        let base = write_temp_config("chassis-config-test-base.yaml", "listen_addr: 127.0.0.1:8080\n");
        let overlay = write_temp_config("chassis-config-test-overlay.json", "{\"listen_addr\": \"0.0.0.0:9000\"}");

        let config = ConfigurationLoader::default()
            .from_yaml(&base)
            .unwrap()
            .from_json(&overlay)
            .unwrap()
            .into_generic();

        let addr: String = config.get_typed("listen_addr").unwrap();
        assert_eq!(addr, "0.0.0.0:9000");
    }

    #[test]
    fn missing_field_mentions_environment_form() {
        std::env::set_var("CHASSISCFGTEST_UNRELATED", "1");

        let config = ConfigurationLoader::default()
            .from_environment("chassiscfgtest")
            .unwrap()
            .into_generic();

        match config.get_typed::<String>("server.listen_addr") {
            Err(ConfigurationError::MissingField { help_text, .. }) => {
                assert!(help_text.contains("CHASSISCFGTEST_SERVER_LISTEN_ADDR"), "got: {}", help_text);
            }
            other => panic!("expected missing field error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn try_get_typed_absent_is_none() {
        let path = write_temp_config("chassis-config-test-absent.yaml", "listen_addr: 127.0.0.1:8080\n");
        let config = ConfigurationLoader::default().from_yaml(&path).unwrap().into_generic();

        let missing: Option<u64> = config.try_get_typed("shutdown_timeout_secs").unwrap();
        assert_eq!(missing, None);

        let defaulted: u64 = config.get_typed_or_default("shutdown_timeout_secs");
        assert_eq!(defaulted, 0);
    }

    #[test]
    fn empty_prefix_rejected() {
        let result = ConfigurationLoader::default().from_environment("");
        assert!(matches!(result, Err(ConfigurationError::EmptyPrefix)));
    }
}
