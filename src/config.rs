//! Process-wide configuration.
//!
//! The plugin cannot create or repair volumes without the maya API
//! service, so both environment variables and the Service lookup are
//! startup-fatal: the container exits and the restart policy takes over.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),

    #[error("failed to read service account credentials: {0}")]
    ServiceAccount(#[from] std::io::Error),

    #[error("kubernetes API request failed: {0}")]
    Kube(#[from] reqwest::Error),

    #[error("service {namespace}/{name} lookup failed: {reason}")]
    ServiceLookup {
        namespace: String,
        name: String,
        reason: String,
    },
}

/// Settings read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Namespace the maya API service lives in.
    pub namespace: String,
    /// Name of the maya API service.
    pub mapi_service: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let namespace = std::env::var("OPENEBS_NAMESPACE")
            .map_err(|_| ConfigError::MissingEnv("OPENEBS_NAMESPACE"))?;
        let mapi_service = std::env::var("OPENEBS_MAPI_SVC")
            .map_err(|_| ConfigError::MissingEnv("OPENEBS_MAPI_SVC"))?;
        if namespace.is_empty() {
            return Err(ConfigError::MissingEnv("OPENEBS_NAMESPACE"));
        }
        if mapi_service.is_empty() {
            return Err(ConfigError::MissingEnv("OPENEBS_MAPI_SVC"));
        }
        Ok(Settings {
            namespace,
            mapi_service,
        })
    }
}

/// Minimal slice of the Kubernetes Service object.
#[derive(Debug, Deserialize)]
struct Service {
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize)]
struct ServiceSpec {
    #[serde(rename = "clusterIP", default)]
    cluster_ip: String,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct ServicePort {
    port: i32,
}

/// Build the maya API base URL from a Service's cluster IP and first port.
fn endpoint_from_service(
    service: &Service,
    namespace: &str,
    name: &str,
) -> Result<String, ConfigError> {
    if service.spec.cluster_ip.is_empty() {
        return Err(ConfigError::ServiceLookup {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: "service has no cluster IP".to_string(),
        });
    }
    let port = service
        .spec
        .ports
        .first()
        .ok_or_else(|| ConfigError::ServiceLookup {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: "service has no ports".to_string(),
        })?;
    Ok(format!("http://{}:{}", service.spec.cluster_ip, port.port))
}

/// Resolve the maya API service to `http://<clusterIP>:<firstPort>`.
///
/// Talks to the in-cluster Kubernetes API using the pod's service account.
/// A failure here means either the service was never created or the API
/// server is unreachable; in both cases the plugin cannot run.
pub async fn resolve_mapi_endpoint(settings: &Settings) -> Result<String, ConfigError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| ConfigError::MissingEnv("KUBERNETES_SERVICE_HOST"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| ConfigError::MissingEnv("KUBERNETES_SERVICE_PORT"))?;

    let sa = Path::new(SERVICE_ACCOUNT_DIR);
    let token = std::fs::read_to_string(sa.join("token"))?;
    let ca = std::fs::read(sa.join("ca.crt"))?;

    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
        .build()?;

    let url = format!(
        "https://{host}:{port}/api/v1/namespaces/{}/services/{}",
        settings.namespace, settings.mapi_service
    );
    let response = client.get(&url).bearer_auth(token.trim()).send().await?;
    if !response.status().is_success() {
        return Err(ConfigError::ServiceLookup {
            namespace: settings.namespace.clone(),
            name: settings.mapi_service.clone(),
            reason: format!("kubernetes API returned {}", response.status()),
        });
    }
    let service: Service = response.json().await?;

    let endpoint = endpoint_from_service(&service, &settings.namespace, &settings.mapi_service)?;
    info!(endpoint = %endpoint, "resolved maya API endpoint");
    Ok(endpoint)
}
