use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::ServiceBroker;
use crate::osb::types::*;

pub const API_VERSION_HEADER: &str = "X-Broker-API-Version";

#[derive(Debug, Clone, Error)]
pub enum OsbError {
    /// The broker answered with a status the operation does not accept.
    #[error("broker responded with status {status}: {}", describe(.error, .description))]
    Http {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },
    /// The status was acceptable but the body could not be used.
    #[error("invalid broker response (status {status}): {message}")]
    InvalidResponse { status: u16, message: String },
    #[error("could not reach broker: {message}")]
    Transport { message: String, timeout: bool },
}

fn describe(error: &Option<String>, description: &Option<String>) -> String {
    description
        .as_deref()
        .or(error.as_deref())
        .unwrap_or("no description provided")
        .to_string()
}

impl OsbError {
    pub fn status(&self) -> Option<u16> {
        match self {
            OsbError::Http { status, .. } | OsbError::InvalidResponse { status, .. } => {
                Some(*status)
            }
            OsbError::Transport { .. } => None,
        }
    }

    pub fn is_gone(&self) -> bool {
        self.status() == Some(StatusCode::GONE.as_u16())
    }

    pub fn http(status: u16, description: impl Into<String>) -> Self {
        OsbError::Http {
            status,
            error: None,
            description: Some(description.into()),
        }
    }
}

/// OSB endpoints of one broker.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_catalog(&self) -> Result<Value, OsbError>;
    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError>;
    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, OsbError>;
    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeleteResponse, OsbError>;
    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError>;
    async fn unbind(&self, request: &UnbindRequest) -> Result<DeleteResponse, OsbError>;
    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;
    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError>;
    async fn get_binding(&self, request: &GetBindingRequest) -> Result<BindingDetails, OsbError>;
}

/// Builds a client for a broker from its URL and credentials.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, broker: &ServiceBroker) -> Result<Arc<dyn BrokerClient>, OsbError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    api_version: String,
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(api_version: &str, timeout: Duration) -> Self {
        Self {
            api_version: api_version.to_string(),
            timeout,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, broker: &ServiceBroker) -> Result<Arc<dyn BrokerClient>, OsbError> {
        Ok(Arc::new(HttpBrokerClient::new(
            broker,
            &self.api_version,
            self.timeout,
        )?))
    }
}

fn transport(err: reqwest::Error) -> OsbError {
    OsbError::Transport {
        timeout: err.is_timeout(),
        message: err.to_string(),
    }
}

/// Raw status and body of a broker response.
struct RawResponse {
    status: u16,
    body: String,
}

impl RawResponse {
    fn json<T: DeserializeOwned>(&self) -> Result<T, OsbError> {
        let body = if self.body.trim().is_empty() {
            "{}"
        } else {
            self.body.as_str()
        };
        // A success status with an unusable body is reported as an HTTP error so the
        // orphan mitigation policy can look at the status.
        serde_json::from_str(body).map_err(|e| OsbError::Http {
            status: self.status,
            error: None,
            description: Some(format!("malformed response body: {}", e)),
        })
    }

    fn into_error(self) -> OsbError {
        let parsed: BrokerErrorBody = serde_json::from_str(&self.body).unwrap_or_default();
        OsbError::Http {
            status: self.status,
            error: parsed.error,
            description: parsed.description,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AsyncBody {
    #[serde(default)]
    dashboard_url: Option<String>,
    #[serde(default)]
    operation: Option<String>,
}

/// OSB client over HTTP.
pub struct HttpBrokerClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpBrokerClient {
    pub fn new(
        broker: &ServiceBroker,
        api_version: &str,
        timeout: Duration,
    ) -> Result<Self, OsbError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(tls) = &broker.credentials.tls {
            let pem = format!("{}\n{}", tls.key, tls.certificate);
            let identity = reqwest::Identity::from_pem(pem.as_bytes()).map_err(|e| {
                OsbError::Transport {
                    message: format!("invalid TLS credentials for broker {}: {}", broker.name, e),
                    timeout: false,
                }
            })?;
            builder = builder.identity(identity);
        }
        let http = builder.build().map_err(transport)?;

        let basic = broker.credentials.basic.as_ref();
        Ok(Self {
            http,
            base_url: broker.broker_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            username: basic.map(|b| b.username.clone()),
            password: basic.map(|b| b.password.clone()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(API_VERSION_HEADER, &self.api_version);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<RawResponse, OsbError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        Ok(RawResponse { status, body })
    }

    async fn async_capable(
        &self,
        request: RequestBuilder,
        sync_statuses: &[u16],
    ) -> Result<(bool, AsyncBody, RawResponse), OsbError> {
        let raw = self.send(request).await?;
        match raw.status {
            202 => {
                let body: AsyncBody = raw.json()?;
                Ok((true, body, raw))
            }
            status if sync_statuses.contains(&status) => {
                let body: AsyncBody = raw.json()?;
                Ok((false, body, raw))
            }
            _ => Err(raw.into_error()),
        }
    }

    async fn last_operation(
        &self,
        path: String,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let mut query = vec![
            ("service_id", request.service_id.clone()),
            ("plan_id", request.plan_id.clone()),
        ];
        if let Some(key) = &request.operation_key {
            query.push(("operation", key.clone()));
        }
        let raw = self.send(self.request(Method::GET, &path).query(&query)).await?;
        match raw.status {
            200 => raw.json().map_err(|_| OsbError::InvalidResponse {
                status: raw.status,
                message: "last operation response has no valid state".to_string(),
            }),
            _ => Err(raw.into_error()),
        }
    }
}

fn instance_path(instance_id: &str) -> String {
    format!("/v2/service_instances/{}", instance_id)
}

fn binding_path(instance_id: &str, binding_id: &str) -> String {
    format!(
        "/v2/service_instances/{}/service_bindings/{}",
        instance_id, binding_id
    )
}

#[async_trait::async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn get_catalog(&self) -> Result<Value, OsbError> {
        let raw = self.send(self.request(Method::GET, "/v2/catalog")).await?;
        match raw.status {
            200 => raw.json(),
            _ => Err(raw.into_error()),
        }
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, OsbError> {
        let http = self
            .request(Method::PUT, &instance_path(&request.instance_id))
            .query(&[("accepts_incomplete", "true")])
            .json(request);
        let (is_async, body, _) = self.async_capable(http, &[200, 201]).await?;
        Ok(ProvisionResponse {
            is_async,
            dashboard_url: body.dashboard_url,
            operation_key: body.operation,
        })
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, OsbError> {
        let http = self
            .request(Method::PATCH, &instance_path(&request.instance_id))
            .query(&[("accepts_incomplete", "true")])
            .json(request);
        let (is_async, body, _) = self.async_capable(http, &[200]).await?;
        Ok(UpdateInstanceResponse {
            is_async,
            dashboard_url: body.dashboard_url,
            operation_key: body.operation,
        })
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeleteResponse, OsbError> {
        let http = self
            .request(Method::DELETE, &instance_path(&request.instance_id))
            .query(&[
                ("accepts_incomplete", "true"),
                ("service_id", request.service_id.as_str()),
                ("plan_id", request.plan_id.as_str()),
            ]);
        let (is_async, body, _) = self.async_capable(http, &[200]).await?;
        Ok(DeleteResponse {
            is_async,
            operation_key: body.operation,
        })
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        let http = self
            .request(
                Method::PUT,
                &binding_path(&request.instance_id, &request.binding_id),
            )
            .query(&[("accepts_incomplete", "true")])
            .json(request);
        let (is_async, body, raw) = self.async_capable(http, &[200, 201]).await?;
        let details = if is_async {
            BindingDetails::default()
        } else {
            raw.json()?
        };
        Ok(BindResponse {
            is_async,
            operation_key: body.operation,
            details,
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<DeleteResponse, OsbError> {
        let http = self
            .request(
                Method::DELETE,
                &binding_path(&request.instance_id, &request.binding_id),
            )
            .query(&[
                ("accepts_incomplete", "true"),
                ("service_id", request.service_id.as_str()),
                ("plan_id", request.plan_id.as_str()),
            ]);
        let (is_async, body, _) = self.async_capable(http, &[200]).await?;
        Ok(DeleteResponse {
            is_async,
            operation_key: body.operation,
        })
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let path = format!("{}/last_operation", instance_path(&request.instance_id));
        self.last_operation(path, request).await
    }

    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let binding_id = request.binding_id.as_deref().unwrap_or_default();
        let path = format!(
            "{}/last_operation",
            binding_path(&request.instance_id, binding_id)
        );
        self.last_operation(path, request).await
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<BindingDetails, OsbError> {
        let raw = self
            .send(self.request(
                Method::GET,
                &binding_path(&request.instance_id, &request.binding_id),
            ))
            .await?;
        match raw.status {
            200 => raw.json(),
            _ => Err(raw.into_error()),
        }
    }
}
