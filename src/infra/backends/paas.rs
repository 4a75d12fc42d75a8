//! Self-hosted PaaS backend over its REST API.
//!
//! Services are created under `/api/v1/services` with the slot's idempotency
//! key as the service name, so a retried create returns the existing service
//! instead of a second one. A slot that already has a service is redeployed
//! in place with `PUT /services/{id}`, keeping its service id.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::core::backend::{DeployConfig, InstanceStatus, PlatformBackend};
use crate::core::model::InstanceRef;
use crate::core::SchedulerError;
use crate::util::serde::BackendKind;

const SERVICE_LABEL: &str = "prometheus-bot-pool";

#[derive(Debug, Serialize)]
struct CreateService<'a> {
    name: String,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
    labels: BTreeMap<&'static str, &'a str>,
}

#[derive(Debug, Serialize)]
struct UpdateService<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    args: &'a [String],
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServiceView {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

/// Map a non-success HTTP status onto the scheduler taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> SchedulerError {
    let detail = format!("{status}: {}", body.trim());
    match status.as_u16() {
        404 => SchedulerError::NotFound(detail),
        402 | 429 => SchedulerError::QuotaExceeded(detail),
        400 | 422 => SchedulerError::ConfigInvalid(detail),
        500..=599 => SchedulerError::BackendUnavailable(detail),
        _ => SchedulerError::Backend(detail),
    }
}

fn parse_status(raw: Option<&str>) -> InstanceStatus {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("running" | "healthy") => InstanceStatus::Running,
        Some("stopped" | "exited" | "paused") => InstanceStatus::Stopped,
        Some("terminated" | "removed" | "failed") => InstanceStatus::Terminated,
        _ => InstanceStatus::Provisioning,
    }
}

fn transport(err: &reqwest::Error) -> SchedulerError {
    SchedulerError::BackendUnavailable(err.to_string())
}

/// Client for one PaaS endpoint.
pub struct HttpPaasBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPaasBackend {
    /// Backend talking to `base_url` (e.g. `http://paas.internal:3000`).
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, SchedulerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::ConfigInvalid(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}/api/v1{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> Result<Response, SchedulerError> {
        let response = builder.send().await.map_err(|e| transport(&e))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    fn tolerate_missing(result: Result<Response, SchedulerError>) -> Result<(), SchedulerError> {
        match result {
            Ok(_) | Err(SchedulerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PlatformBackend for HttpPaasBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Paas
    }

    async fn pull_image(&self, image: &str) -> Result<(), SchedulerError> {
        let body = serde_json::json!({ "image": image });
        Self::send(self.request(Method::POST, "/images/pull").json(&body)).await?;
        tracing::info!(image, "image pulled on paas");
        Ok(())
    }

    async fn deploy(&self, config: &DeployConfig) -> Result<InstanceRef, SchedulerError> {
        if let Some(instance) = &config.instance {
            let payload = UpdateService {
                image: &config.image,
                command: config.command.as_deref(),
                args: &config.args,
                env: &config.env,
            };
            let path = format!("/services/{instance}");
            Self::send(self.request(Method::PUT, &path).json(&payload)).await?;
            tracing::info!(slot = %config.slot_name, service = %instance, "paas service redeployed");
            return Ok(instance.clone());
        }

        let payload = CreateService {
            name: config.idempotency_key(),
            image: &config.image,
            command: config.command.as_deref(),
            args: &config.args,
            env: &config.env,
            labels: BTreeMap::from([("managed-by", SERVICE_LABEL), ("slot", config.slot_name.as_str())]),
        };
        let response = Self::send(self.request(Method::POST, "/services").json(&payload)).await?;
        let view: ServiceView = response.json().await.map_err(|e| transport(&e))?;
        tracing::info!(slot = %config.slot_name, service = %view.id, "paas service deployed");
        Ok(InstanceRef::new(view.id))
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<(), SchedulerError> {
        let path = format!("/services/{instance}/stop");
        Self::tolerate_missing(Self::send(self.request(Method::POST, &path)).await)
    }

    async fn delete(&self, instance: &InstanceRef) -> Result<(), SchedulerError> {
        let path = format!("/services/{instance}");
        Self::tolerate_missing(Self::send(self.request(Method::DELETE, &path)).await)
    }

    async fn describe(&self, instance: &InstanceRef) -> Result<InstanceStatus, SchedulerError> {
        let path = format!("/services/{instance}");
        match Self::send(self.request(Method::GET, &path)).await {
            Ok(response) => {
                let view: ServiceView = response.json().await.map_err(|e| transport(&e))?;
                Ok(parse_status(view.status.as_deref()))
            }
            Err(SchedulerError::NotFound(_)) => Ok(InstanceStatus::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn list_all(&self) -> Result<Vec<InstanceRef>, SchedulerError> {
        let builder = self
            .request(Method::GET, "/services")
            .query(&[("label", format!("managed-by={SERVICE_LABEL}"))]);
        let views: Vec<ServiceView> = Self::send(builder).await?.json().await.map_err(|e| transport(&e))?;
        Ok(views.into_iter().map(|v| InstanceRef::new(v.id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, ""), SchedulerError::NotFound(_)));
        assert!(matches!(
            classify_status(StatusCode::PAYMENT_REQUIRED, "plan limit"),
            SchedulerError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SchedulerError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad image"),
            SchedulerError::ConfigInvalid(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(classify_status(StatusCode::CONFLICT, ""), SchedulerError::Backend(_)));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(Some("Running")), InstanceStatus::Running);
        assert_eq!(parse_status(Some("exited")), InstanceStatus::Stopped);
        assert_eq!(parse_status(Some("removed")), InstanceStatus::Terminated);
        assert_eq!(parse_status(None), InstanceStatus::Provisioning);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let backend = HttpPaasBackend::new("http://127.0.0.1:9", None, Duration::from_millis(200)).unwrap();
        let err = backend.describe(&InstanceRef::new("svc-1")).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
