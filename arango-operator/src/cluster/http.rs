use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::cluster::{ClientFactory, ClientKey, ClusterClient, NumberOfServers};
use crate::k8s;
use crate::resources::{ResourceNames, ARANGO_PORT};
use arango_core::crd::{ArangoDeployment, ServerGroup};
use arango_core::{AppError, AppResult};

/// The key of the JWT secret within its K8s secret.
const SECRET_KEY_TOKEN: &str = "token";
/// The agency key which holds the supervision maintenance flag.
const AGENCY_KEY_MAINTENANCE: &str = "/arango/Supervision/Maintenance";
/// The duration for which maintenance mode stays on unless renewed.
const MAINTENANCE_TTL_SECONDS: u64 = 3600;

/// The claims of the JWT used by the operator against database servers.
#[derive(Debug, Serialize)]
struct ServerClaims {
    iss: &'static str,
    server_id: &'static str,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CleanedServersResponse {
    #[serde(rename = "cleanedServers", default)]
    cleaned_servers: Vec<String>,
}

/// A client of the administrative HTTP API of one endpoint.
pub struct HttpClusterClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpClusterClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.endpoint, path));
        match self.token.as_ref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send the given request, decoding its JSON response body.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder, op: &'static str) -> AppResult<T> {
        let res = self.execute(req, op).await?;
        timeout(self.timeout, res.json::<T>())
            .await
            .map_err(|_| AppError::Timeout(op))?
            .map_err(|err| AppError::Ise(anyhow::Error::from(err).context(op)))
    }

    /// Send the given request, discarding its response body.
    async fn send_empty(&self, req: RequestBuilder, op: &'static str) -> AppResult<()> {
        self.execute(req, op).await.map(|_| ())
    }

    async fn execute(&self, req: RequestBuilder, op: &'static str) -> AppResult<reqwest::Response> {
        let res = timeout(self.timeout, req.send())
            .await
            .map_err(|_| AppError::Timeout(op))?
            .map_err(|err| {
                if err.is_timeout() {
                    AppError::Timeout(op)
                } else {
                    AppError::Ise(anyhow::Error::from(err).context(op))
                }
            })?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Unauthorized,
            StatusCode::NOT_FOUND => AppError::ResourceNotFound,
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => AppError::Conflict,
            _ => AppError::Ise(anyhow::anyhow!("error {}, got status {}", op, status)),
        })
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn version(&self) -> AppResult<String> {
        let req = self.request(Method::GET, "/_api/version");
        let res: VersionResponse = self.send(req, "fetching server version").await?;
        Ok(res.version)
    }

    async fn get_server_counts(&self) -> AppResult<NumberOfServers> {
        let req = self.request(Method::GET, "/_admin/cluster/numberOfServers");
        self.send(req, "fetching number of servers").await
    }

    async fn set_server_counts(&self, counts: NumberOfServers) -> AppResult<()> {
        let req = self.request(Method::PUT, "/_admin/cluster/numberOfServers").json(&counts);
        self.send_empty(req, "setting number of servers").await
    }

    async fn get_maintenance_mode(&self) -> AppResult<bool> {
        let req = self.request(Method::POST, "/_api/agency/read").json(&json!([[AGENCY_KEY_MAINTENANCE]]));
        let res: Value = self.send(req, "reading agency maintenance mode").await?;
        Ok(res
            .pointer("/0/arango/Supervision/Maintenance")
            .map(|val| !val.is_null())
            .unwrap_or(false))
    }

    async fn set_maintenance_mode(&self, enabled: bool) -> AppResult<()> {
        let op = if enabled {
            json!({"op": "set", "new": true, "ttl": MAINTENANCE_TTL_SECONDS})
        } else {
            json!({"op": "delete"})
        };
        let req = self.request(Method::POST, "/_api/agency/write").json(&json!([[{ AGENCY_KEY_MAINTENANCE: op }]]));
        self.send_empty(req, "writing agency maintenance mode").await
    }

    async fn clean_out_server(&self, server_id: &str) -> AppResult<String> {
        let req = self
            .request(Method::POST, "/_admin/cluster/cleanOutServer")
            .json(&json!({ "server": server_id }));
        let res: JobResponse = self.send(req, "starting clean out of server").await?;
        Ok(res.id)
    }

    async fn is_cleaned_out(&self, server_id: &str) -> AppResult<bool> {
        let req = self.request(Method::GET, "/_admin/cluster/numberOfServers");
        let res: CleanedServersResponse = self.send(req, "fetching cleaned out servers").await?;
        Ok(res.cleaned_servers.iter().any(|id| id == server_id))
    }

    async fn create_user(&self, user: &str, password: &str) -> AppResult<()> {
        let req = self.request(Method::POST, "/_api/user").json(&json!({ "user": user, "passwd": password }));
        self.send_empty(req, "creating user").await
    }

    async fn update_user(&self, user: &str, password: &str) -> AppResult<()> {
        let path = format!("/_api/user/{}", user);
        let req = self.request(Method::PATCH, &path).json(&json!({ "passwd": password }));
        self.send_empty(req, "updating user").await
    }

    async fn shutdown(&self, remove_from_cluster: bool) -> AppResult<()> {
        let path = if remove_from_cluster {
            "/_admin/shutdown?remove_from_cluster=1"
        } else {
            "/_admin/shutdown"
        };
        let req = self.request(Method::DELETE, path);
        self.send_empty(req, "shutting down server").await
    }
}

/// A factory of HTTP clients for the endpoints of one deployment.
///
/// Endpoints and credentials are derived from the latest deployment record published by the
/// deployment's control loop.
pub struct HttpClientFactory {
    client: kube::Client,
    names: ResourceNames,
    deployment: watch::Receiver<Arc<ArangoDeployment>>,
    timeout: Duration,
}

impl HttpClientFactory {
    /// Create a new instance.
    pub fn new(client: kube::Client, names: ResourceNames, deployment: watch::Receiver<Arc<ArangoDeployment>>, timeout: Duration) -> Self {
        Self {
            client,
            names,
            deployment,
            timeout,
        }
    }

    /// Build a JWT signed with the named secret.
    async fn create_token(&self, secret_name: &str) -> AppResult<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.names.namespace);
        let secret = k8s::call("fetching JWT secret", api.get(secret_name)).await?;
        let key = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SECRET_KEY_TOKEN))
            .ok_or_else(|| AppError::InvalidInput(format!("secret {} has no {} key", secret_name, SECRET_KEY_TOKEN)))?;
        let claims = ServerClaims {
            iss: "arangodb",
            server_id: "arango-operator",
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(&key.0))
            .map_err(|err| AppError::Ise(anyhow::Error::from(err).context("error encoding JWT")))
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn create(&self, key: &ClientKey) -> AppResult<Arc<dyn ClusterClient>> {
        let depl = self.deployment.borrow().clone();
        let spec = depl.accepted_spec();
        let host = match key {
            ClientKey::Database => self.names.client_dns_name(),
            ClientKey::Agency => {
                let agent = depl
                    .status
                    .as_ref()
                    .and_then(|status| status.members.group(ServerGroup::Agents).first())
                    .ok_or(AppError::ResourceNotFound)?;
                self.names.member_dns_name(ServerGroup::Agents, &agent.id)
            }
            ClientKey::Member(group, id) => self.names.member_dns_name(*group, id),
        };
        let scheme = if spec.tls.is_secure() { "https" } else { "http" };
        let token = match spec.jwt_secret_name() {
            Some(secret_name) => Some(self.create_token(secret_name).await?),
            None => None,
        };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .build()
            .map_err(|err| AppError::Ise(anyhow::Error::from(err).context("error building HTTP client")))?;
        tracing::debug!(%key, %host, "created database client");
        Ok(Arc::new(HttpClusterClient {
            http,
            endpoint: format!("{}://{}:{}", scheme, host, ARANGO_PORT),
            token,
            timeout: self.timeout,
        }))
    }
}
