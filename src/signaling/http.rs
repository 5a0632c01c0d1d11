//! HTTP signaling control plane
//!
//! JSON request/response bodies follow the Kinesis Video Streams signaling
//! API. Request signing is expected to happen in front of `control_plane_url`;
//! an optional bearer token is attached when configured.

use super::websocket::WsSignalingClient;
use super::{
    ChannelInfo, ChannelRole, Endpoints, MediaStorageClient, MediaStorageConfig, Protocol, SignalingBackend,
    SignalingClient, SignalingClientConfig, SignalingError,
};
use crate::config::BackendConfig;
use crate::peer::IceServer;
use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// STUN relay operated by the signaling service in `region`
pub fn kvs_stun_url(region: &str) -> String {
    format!("stun:stun.kinesisvideo.{}.amazonaws.com:443", region)
}

/// Map a failed response body to a signaling error
fn classify_error(status: reqwest::StatusCode, body: &str) -> SignalingError {
    if body.contains("ResourceInUseException") {
        SignalingError::AlreadyExists
    } else if body.contains("ResourceNotFoundException") {
        SignalingError::NotFound
    } else {
        SignalingError::RequestFailed(format!("{}: {}", status, body))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateChannelRequest<'a> {
    channel_name: &'a str,
    channel_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ChannelNameRequest<'a> {
    channel_name: &'a str,
}

#[derive(Serialize)]
struct ChannelArnRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeChannelResponse {
    channel_info: ChannelInfoBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChannelInfoBody {
    #[serde(rename = "ChannelARN")]
    channel_arn: String,
    channel_name: String,
    #[serde(default)]
    channel_status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StorageConfigResponse {
    media_storage_configuration: StorageConfigBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StorageConfigBody {
    status: String,
    #[serde(rename = "StreamARN", default)]
    stream_arn: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    single_master_channel_endpoint_configuration: EndpointConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointConfiguration<'a> {
    protocols: Vec<&'a str>,
    role: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointResponse {
    resource_endpoint_list: Vec<ResourceEndpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceEndpoint {
    protocol: String,
    resource_endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct IceConfigRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IceConfigResponse {
    #[serde(default)]
    ice_server_list: Vec<IceServerBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IceServerBody {
    uris: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Clone)]
struct HttpTransport {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpTransport {
    async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<String, SignalingError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SignalingError::RequestFailed(format!("POST {} failed: {}", url, e)))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_error(status, &text));
        }
        debug!("POST {} -> {}", url, status);
        Ok(text)
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(&self, url: &str, body: &B) -> Result<R, SignalingError> {
        let text = self.post(url, body).await?;
        serde_json::from_str(&text)
            .map_err(|e| SignalingError::ProtocolError(format!("Invalid response from {}: {}", url, e)))
    }
}

/// Signaling backend over the HTTP control plane
pub struct HttpBackend {
    transport: HttpTransport,
    control_plane_url: String,
    region: String,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, SignalingError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SignalingError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            transport: HttpTransport {
                client,
                auth_token: config.auth_token.clone(),
            },
            control_plane_url: config.control_plane_url.trim_end_matches('/').to_string(),
            region: config.region.clone(),
        })
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/{}", self.control_plane_url, operation)
    }
}

#[async_trait]
impl SignalingBackend for HttpBackend {
    fn region(&self) -> &str {
        &self.region
    }

    async fn create_signaling_channel(&self, name: &str) -> Result<(), SignalingError> {
        let body = CreateChannelRequest {
            channel_name: name,
            channel_type: "SINGLE_MASTER",
        };
        self.transport.post(&self.url("createSignalingChannel"), &body).await?;
        info!("Created signaling channel {}", name);
        Ok(())
    }

    async fn describe_signaling_channel(&self, name: &str) -> Result<ChannelInfo, SignalingError> {
        let response: DescribeChannelResponse = self
            .transport
            .post_json(&self.url("describeSignalingChannel"), &ChannelNameRequest { channel_name: name })
            .await?;
        let info = response.channel_info;
        Ok(ChannelInfo {
            channel_id: info.channel_arn,
            name: info.channel_name,
            status: info.channel_status,
        })
    }

    async fn describe_media_storage_configuration(&self, channel_id: &str) -> Result<MediaStorageConfig, SignalingError> {
        let response: StorageConfigResponse = self
            .transport
            .post_json(
                &self.url("describeMediaStorageConfiguration"),
                &ChannelArnRequest { channel_arn: channel_id },
            )
            .await?;
        let config = response.media_storage_configuration;
        Ok(MediaStorageConfig {
            enabled: config.status == "ENABLED",
            stream_id: config.stream_arn.filter(|arn| !arn.is_empty()),
        })
    }

    async fn get_signaling_channel_endpoints(
        &self,
        channel_id: &str,
        role: ChannelRole,
        protocols: &[Protocol],
    ) -> Result<Endpoints, SignalingError> {
        let body = EndpointRequest {
            channel_arn: channel_id,
            single_master_channel_endpoint_configuration: EndpointConfiguration {
                protocols: protocols.iter().map(Protocol::as_str).collect(),
                role: role.as_str(),
            },
        };
        let response: EndpointResponse = self
            .transport
            .post_json(&self.url("getSignalingChannelEndpoint"), &body)
            .await?;

        let endpoints: Endpoints = response
            .resource_endpoint_list
            .into_iter()
            .filter_map(|e| Protocol::parse(&e.protocol).map(|p| (p, e.resource_endpoint)))
            .collect();

        for protocol in protocols {
            endpoints.get(*protocol)?;
        }
        Ok(endpoints)
    }

    async fn get_ice_server_config(&self, channel_id: &str, https_endpoint: &str) -> Result<Vec<IceServer>, SignalingError> {
        let url = format!("{}/v1/get-ice-server-config", https_endpoint.trim_end_matches('/'));
        let body = IceConfigRequest {
            channel_arn: channel_id,
            client_id: None,
        };
        let response: IceConfigResponse = self.transport.post_json(&url, &body).await?;

        Ok(response
            .ice_server_list
            .into_iter()
            .map(|s| IceServer {
                urls: s.uris,
                username: s.username,
                credential: s.password,
            })
            .collect())
    }

    async fn connect(&self, config: SignalingClientConfig) -> Result<Box<dyn SignalingClient>, SignalingError> {
        Ok(Box::new(WsSignalingClient::new(config)))
    }

    async fn storage_client(&self, webrtc_endpoint: &str) -> Result<Arc<dyn MediaStorageClient>, SignalingError> {
        Ok(Arc::new(HttpStorageClient {
            transport: self.transport.clone(),
            endpoint: webrtc_endpoint.trim_end_matches('/').to_string(),
        }))
    }
}

/// Joins the ingestion session at the WEBRTC endpoint
pub struct HttpStorageClient {
    transport: HttpTransport,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinSessionRequest<'a> {
    channel_arn: &'a str,
}

#[async_trait]
impl MediaStorageClient for HttpStorageClient {
    async fn join_storage_session(&self, channel_id: &str) -> Result<(), SignalingError> {
        let url = format!("{}/joinStorageSession", self.endpoint);
        self.transport.post(&url, &JoinSessionRequest { channel_arn: channel_id }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kvs_stun_url() {
        assert_eq!(kvs_stun_url("eu-west-1"), "stun:stun.kinesisvideo.eu-west-1.amazonaws.com:443");
    }

    #[test]
    fn test_classify_error() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        assert!(matches!(
            classify_error(status, r#"{"__type":"ResourceInUseException","message":"in use"}"#),
            SignalingError::AlreadyExists
        ));
        assert!(matches!(
            classify_error(status, r#"{"__type":"ResourceNotFoundException"}"#),
            SignalingError::NotFound
        ));
        assert!(matches!(
            classify_error(reqwest::StatusCode::FORBIDDEN, "denied"),
            SignalingError::RequestFailed(_)
        ));
    }

    #[test]
    fn test_endpoint_request_shape() {
        let body = EndpointRequest {
            channel_arn: "arn:channel",
            single_master_channel_endpoint_configuration: EndpointConfiguration {
                protocols: Protocol::for_session(true).iter().map(Protocol::as_str).collect(),
                role: ChannelRole::Master.as_str(),
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["ChannelARN"], "arn:channel");
        assert_eq!(
            value["SingleMasterChannelEndpointConfiguration"]["Protocols"],
            serde_json::json!(["WSS", "HTTPS", "WEBRTC"])
        );
        assert_eq!(value["SingleMasterChannelEndpointConfiguration"]["Role"], "MASTER");
    }

    #[test]
    fn test_parse_storage_and_ice_responses() {
        let storage: StorageConfigResponse = serde_json::from_str(
            r#"{"MediaStorageConfiguration":{"Status":"ENABLED","StreamARN":"arn:stream"}}"#,
        )
        .unwrap();
        assert_eq!(storage.media_storage_configuration.status, "ENABLED");
        assert_eq!(storage.media_storage_configuration.stream_arn.as_deref(), Some("arn:stream"));

        let ice: IceConfigResponse = serde_json::from_str(
            r#"{"IceServerList":[{"Uris":["turn:1.2.3.4:443"],"Username":"u","Password":"p","Ttl":300}]}"#,
        )
        .unwrap();
        assert_eq!(ice.ice_server_list.len(), 1);
        assert_eq!(ice.ice_server_list[0].password.as_deref(), Some("p"));
    }

    #[test]
    fn test_backend_trims_control_plane_url() {
        let config = BackendConfig {
            control_plane_url: "https://kinesisvideo.us-west-2.amazonaws.com/".to_string(),
            ..Default::default()
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(
            backend.url("describeSignalingChannel"),
            "https://kinesisvideo.us-west-2.amazonaws.com/describeSignalingChannel"
        );
        assert_eq!(backend.region(), "us-west-2");
    }
}
