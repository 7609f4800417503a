use crate::core::config::ConfigError;
use std::env;

/// Environment variable holding the fully qualified host name.
pub const ENV_FQDN: &str = "FQDN";
/// Environment variable holding the component (software package) name.
pub const ENV_COMPONENT_NAME: &str = "RPM_SOFTWARE_NAME";
/// Fallback environment variable for the component name.
pub const ENV_ARTIFACT_NAME: &str = "ARTIFACT_NAME";
/// Environment variable holding the deployed artifact version.
pub const ENV_ARTIFACT_VERSION: &str = "ARTIFACT_VERSION";
/// Environment variable holding the installation directory.
pub const ENV_INSTALL_DIR: &str = "INSTALL_DIR";
/// Environment variable holding this instance's datacenter tag.
pub const ENV_DATA_CENTER: &str = "DATA_CENTER";

/// Identity of this process instance within the fleet.
///
/// The `instance_id` is the lease-owner token written to the backend: it is
/// composed from host, component name, deployed version and install path, so
/// several instances of the same component on one host stay distinguishable.
/// It is fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    component: String,
    host: String,
    version: Option<String>,
    install_path: Option<String>,
    datacenter: Option<String>,
    instance_id: String,
}

impl InstanceIdentity {
    /// Build an identity from explicit parts. Prefer [`from_env`] in
    /// production; this constructor exists for embedding and tests.
    ///
    /// [`from_env`]: InstanceIdentity::from_env
    pub fn new(component: impl Into<String>, host: impl Into<String>) -> Self {
        let mut identity = Self {
            component: component.into(),
            host: host.into(),
            version: None,
            install_path: None,
            datacenter: None,
            instance_id: String::new(),
        };
        identity.recompose();
        identity
    }

    /// Build the identity from the process environment: component name from
    /// `RPM_SOFTWARE_NAME` (falling back to `ARTIFACT_NAME`), host from
    /// `FQDN`, version from `ARTIFACT_VERSION`, install path from
    /// `INSTALL_DIR` and datacenter tag from `DATA_CENTER`.
    ///
    /// The component name is mandatory; everything else is optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        let component = env::var(ENV_COMPONENT_NAME)
            .or_else(|_| env::var(ENV_ARTIFACT_NAME))
            .map_err(|_| ConfigError::MissingEnv(ENV_COMPONENT_NAME))?;
        let host = env::var(ENV_FQDN).unwrap_or_else(|_| "localhost".to_string());

        let mut identity = Self::new(component, host);
        if let Ok(version) = env::var(ENV_ARTIFACT_VERSION) {
            identity = identity.with_version(version);
        }
        if let Ok(install_path) = env::var(ENV_INSTALL_DIR) {
            identity = identity.with_install_path(install_path);
        }
        if let Ok(datacenter) = env::var(ENV_DATA_CENTER) {
            if !datacenter.is_empty() {
                identity = identity.with_datacenter(datacenter);
            }
        }
        Ok(identity)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self.recompose();
        self
    }

    pub fn with_install_path(mut self, install_path: impl Into<String>) -> Self {
        self.install_path = Some(install_path.into());
        self.recompose();
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Component name shared by all instances of this software.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Unique lease-owner token for this process.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    fn recompose(&mut self) {
        let mut instance_id = format!("{}-{}", self.host, self.component);
        if let Some(version) = &self.version {
            instance_id.push('-');
            instance_id.push_str(version);
        }
        if let Some(install_path) = &self.install_path {
            instance_id.push('-');
            instance_id.push_str(&install_path.replace('/', "_"));
        }
        self.instance_id = instance_id;
    }
}
