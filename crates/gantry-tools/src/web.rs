use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use url::Url;

use crate::config::WebConfig;
use crate::definition::{RiskLevel, ToolDefinition, ToolRisk, schema_of};
use crate::executor::{
    ToolCallRequest, ToolError, ToolExecutor, ToolOutput, deserialize_params, truncate_tool_output,
};
use crate::provider::{BUILTIN, is_builtin};
use crate::tool_id::ToolId;

#[derive(Debug, Deserialize, JsonSchema)]
struct FetchParams {
    /// HTTPS URL to fetch
    url: String,
    /// Cap on returned bytes, below the configured maximum
    max_bytes: Option<usize>,
}

/// `web_fetch`: GET a public HTTPS URL and return the body as text.
#[derive(Debug)]
pub struct WebExecutor {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl WebExecutor {
    #[must_use]
    pub fn new(config: &WebConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .unwrap_or_default();

        Self {
            client,
            max_body_bytes: config.max_body_bytes,
        }
    }

    async fn fetch(&self, params: &FetchParams) -> Result<ToolOutput, ToolError> {
        validate_url(&params.url)?;
        let limit = params
            .max_bytes
            .map_or(self.max_body_bytes, |m| m.min(self.max_body_bytes));

        let resp = self
            .client
            .get(&params.url)
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_owned();

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        if bytes.len() > self.max_body_bytes {
            return Err(ToolError::Http(format!(
                "response too large: {} bytes (max: {})",
                bytes.len(),
                self.max_body_bytes,
            )));
        }
        let shown = &bytes[..bytes.len().min(limit)];
        let body = String::from_utf8_lossy(shown);

        tracing::debug!(url = %params.url, status = status.as_u16(), bytes = bytes.len(), "web fetch");
        Ok(ToolOutput {
            summary: truncate_tool_output(&format!(
                "HTTP {status} ({content_type}, {} bytes)\n\n{body}",
                bytes.len()
            )),
            success: status.is_success(),
            ..ToolOutput::default()
        })
    }
}

impl ToolExecutor for WebExecutor {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                ToolId::new(BUILTIN, "web_fetch"),
                "Fetch a public HTTPS URL and return the response body",
                ToolRisk::Declared(RiskLevel::Read),
            )
            .network()
            .schema(schema_of::<FetchParams>()),
        ]
    }

    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
    ) -> Result<Option<ToolOutput>, ToolError> {
        if !is_builtin(&call.tool_id) || call.tool_id.name() != "web_fetch" {
            return Ok(None);
        }
        let params: FetchParams = deserialize_params(&call.arguments)?;
        self.fetch(&params).await.map(Some)
    }
}

fn validate_url(raw: &str) -> Result<(), ToolError> {
    let parsed = Url::parse(raw).map_err(|_| ToolError::InvalidParams {
        message: format!("invalid URL: {raw}"),
    })?;

    if parsed.scheme() != "https" {
        return Err(ToolError::InvalidParams {
            message: format!("scheme not allowed: {}", parsed.scheme()),
        });
    }

    if let Some(host) = parsed.host()
        && is_private_host(&host)
    {
        return Err(ToolError::InvalidParams {
            message: format!(
                "private/local host blocked: {}",
                parsed.host_str().unwrap_or("")
            ),
        });
    }

    Ok(())
}

fn is_private_v4(v4: std::net::Ipv4Addr) -> bool {
    v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()
}

fn is_private_host(host: &url::Host<&str>) -> bool {
    match host {
        url::Host::Domain(d) => *d == "localhost" || d.ends_with(".localhost"),
        url::Host::Ipv4(v4) => is_private_v4(*v4),
        url::Host::Ipv6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let seg = v6.segments();
            // fe80::/10 link-local
            if seg[0] & 0xffc0 == 0xfe80 {
                return true;
            }
            // fc00::/7 unique local
            if seg[0] & 0xfe00 == 0xfc00 {
                return true;
            }
            v6.to_ipv4_mapped().is_some_and(is_private_v4)
        }
    }
}
