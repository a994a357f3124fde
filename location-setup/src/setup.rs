use crate::properties::Properties;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use topo::config::ValidationError;
use topo::provision::{validate_credentials, ComputeService, CredentialError, ProvisionError};
use topo::ManagementContext;
use tracing::{debug, info, warn};

pub const CERTIFICATE_FILE: &str = "certificate.p12";
pub const PROPERTIES_FILE: &str = "topo.properties";

const CONSOLE_USERS: &str = "topo.console.security.users";

/// Form fields submitted by an operator
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub subscription_id: Option<String>,
    pub certificate: Option<PathBuf>,
    pub certificate_password: Option<String>,
    pub console_password: Option<String>,
}

/// Fixed parts of the location definition written by a setup
#[derive(Debug, Clone)]
pub struct LocationDefaults {
    pub name: String,
    pub spec: String,
    pub endpoint_base: String,
    pub image_id: String,
    pub hardware_id: String,
    pub display_name: String,
    pub vm_name_max_length: u32,
    pub operation_timeout_ms: u64,
    pub console_user: String,
}

impl Default for LocationDefaults {
    fn default() -> Self {
        Self {
            name: "azure".to_string(),
            spec: "azurecompute:East US".to_string(),
            endpoint_base: "https://management.core.windows.net/".to_string(),
            image_id: concat!(
                "b39f27a8b8c64d52b05eac6a62ebad85__",
                "Ubuntu-14_04_1-LTS-amd64-server-20150123-en-us-30GB"
            )
            .to_string(),
            hardware_id: "BASIC_A2".to_string(),
            display_name: "Azure".to_string(),
            vm_name_max_length: 45,
            operation_timeout_ms: 120_000,
            console_user: "admin".to_string(),
        }
    }
}

/// What a provider connection is opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub endpoint: String,
    pub identity: PathBuf,
    pub credential: String,
}

/// Opens a compute service for a set of credentials
#[async_trait]
pub trait ComputeServiceFactory: Send + Sync {
    async fn connect(
        &self,
        credentials: &ProviderCredentials,
    ) -> Result<Arc<dyn ComputeService>, ProvisionError>;
}

/// Called with the properties path after it is written
pub type ReloadHook = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("could not connect to provider: {0}")]
    Provider(ProvisionError),

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reload after setup failed: {0:#}")]
    Reload(anyhow::Error),
}

impl SetupError {
    fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| SetupError::Io { action, path, source }
    }
}

/// Files a successful setup left in the home directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    pub properties: PathBuf,
    pub certificate: PathBuf,
    pub console_access: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStatus {
    pub has_apps: bool,
    pub location_configured: bool,
}

pub struct LocationSetup {
    home: PathBuf,
    defaults: LocationDefaults,
    factory: Arc<dyn ComputeServiceFactory>,
    reload: Option<ReloadHook>,
}

impl LocationSetup {
    pub fn new(home: impl Into<PathBuf>, factory: Arc<dyn ComputeServiceFactory>) -> Self {
        Self {
            home: home.into(),
            defaults: LocationDefaults::default(),
            factory,
            reload: None,
        }
    }

    pub fn with_defaults(mut self, defaults: LocationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn on_reload(
        mut self,
        hook: impl Fn(&Path) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.reload = Some(Arc::new(hook));
        self
    }

    pub fn properties_path(&self) -> PathBuf {
        self.home.join(PROPERTIES_FILE)
    }

    /// Validate credentials with the provider, then install the certificate
    /// and the location definition.
    ///
    /// Nothing is written before the provider accepts the credentials. If a
    /// later step fails the certificate is moved back to where it came from.
    pub async fn setup(&self, request: SetupRequest) -> Result<SetupOutcome, SetupError> {
        let subscription = request
            .subscription_id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingRequired("subscriptionId".to_string()))?;
        let certificate = request
            .certificate
            .ok_or_else(|| ValidationError::MissingRequired("certificate".to_string()))?;
        if !certificate.is_file() {
            return Err(ValidationError::invalid_value(
                "certificate",
                format!("{} is not a file", certificate.display()),
            )
            .into());
        }

        let credentials = ProviderCredentials {
            endpoint: format!("{}{}", self.defaults.endpoint_base, subscription),
            identity: certificate.clone(),
            credential: request.certificate_password.unwrap_or_default(),
        };
        self.check_credentials(&credentials).await?;

        fs::create_dir_all(&self.home).map_err(SetupError::io("create", &self.home))?;
        let installed = self.home.join(CERTIFICATE_FILE);
        move_file(&certificate, &installed)
            .map_err(SetupError::io("move certificate to", &installed))?;

        let console_password = request.console_password.filter(|p| !p.is_empty());
        let properties = self.location_properties(
            &credentials.endpoint,
            &installed,
            &credentials.credential,
            console_password.as_deref(),
        );

        match self.install(&properties) {
            Ok(path) => {
                info!(
                    location = %self.defaults.name,
                    properties = %path.display(),
                    console_access = console_password.is_some(),
                    "Location configured"
                );
                Ok(SetupOutcome {
                    properties: path,
                    certificate: installed,
                    console_access: console_password.is_some(),
                })
            }
            Err(e) => {
                if let Err(restore) = move_file(&installed, &certificate) {
                    warn!(
                        certificate = %certificate.display(),
                        error = %restore,
                        "Could not move certificate back after failed setup"
                    );
                }
                Err(e)
            }
        }
    }

    /// Whether applications exist and whether the location has an identity
    pub fn status(&self, mgmt: &ManagementContext) -> LocationStatus {
        LocationStatus {
            has_apps: !mgmt.applications().is_empty(),
            location_configured: self.location_configured(),
        }
    }

    fn location_configured(&self) -> bool {
        let path = self.properties_path();
        let Ok(text) = fs::read_to_string(&path) else {
            debug!(path = %path.display(), "Location properties not found");
            return false;
        };
        match Properties::parse(&text).get(&self.key("identity")) {
            Some(identity) if !identity.is_empty() => true,
            _ => {
                debug!(location = %self.defaults.name, "Location identity not set");
                false
            }
        }
    }

    async fn check_credentials(&self, credentials: &ProviderCredentials) -> Result<(), SetupError> {
        let service = self.factory.connect(credentials).await.map_err(|e| match e {
            ProvisionError::Credential(e) => SetupError::Credential(e),
            other => SetupError::Provider(other),
        })?;
        let locations = validate_credentials(service.as_ref()).await?;
        info!(
            endpoint = %credentials.endpoint,
            locations = locations.len(),
            "Provider credentials accepted"
        );
        Ok(())
    }

    fn key(&self, suffix: &str) -> String {
        format!("topo.location.named.{}.{}", self.defaults.name, suffix)
    }

    fn location_properties(
        &self,
        endpoint: &str,
        certificate: &Path,
        credential: &str,
        console_password: Option<&str>,
    ) -> Properties {
        let d = &self.defaults;
        let mut props = Properties::new();
        props.set(format!("topo.location.named.{}", d.name), d.spec.as_str());
        props.set(self.key("identity"), certificate.display().to_string());
        props.set(self.key("credential"), credential);
        props.set(self.key("endpoint"), endpoint);
        props.set(self.key("imageId"), d.image_id.as_str());
        props.set(self.key("hardwareId"), d.hardware_id.as_str());
        props.set(self.key("displayName"), d.display_name.as_str());
        props.set(self.key("vmNameMaxLength"), d.vm_name_max_length.to_string());
        props.set(self.key("operation.timeout"), d.operation_timeout_ms.to_string());

        if let Some(password) = console_password {
            props.set(CONSOLE_USERS, d.console_user.as_str());
            props.set(format!("topo.console.security.user.{}.password", d.console_user), password);
        }
        props
    }

    /// Write the properties file, then run the reload hook. A failed reload
    /// puts the previous file back.
    fn install(&self, properties: &Properties) -> Result<PathBuf, SetupError> {
        let path = self.properties_path();
        let previous = fs::read(&path).ok();

        let text = properties.render(&format!("{} minimal config", self.defaults.display_name));
        write_private(&path, text.as_bytes()).map_err(SetupError::io("write", &path))?;

        if let Some(reload) = &self.reload {
            if let Err(e) = reload(&path) {
                let restored = match previous {
                    Some(bytes) => write_private(&path, &bytes),
                    None => fs::remove_file(&path),
                };
                if let Err(restore) = restored {
                    warn!(
                        path = %path.display(),
                        error = %restore,
                        "Could not restore properties after failed reload"
                    );
                }
                return Err(SetupError::Reload(e));
            }
        }
        Ok(path)
    }
}

/// Write to a sibling temp file created owner-only, fsync, rename into place
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let _ = fs::remove_file(&tmp_path);

    let result = (|| {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
