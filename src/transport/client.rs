//! reqwest implementation of the OpenRosa transport

use super::{
    plan_chunks, ChunkLimits, Credentials, FormDefinition, FormSummary, Manifest,
    OpenRosaTransport, TokenRouting, UploadRequest, UploadResult, FORM_STATUS_HEADER,
    INCOMPLETE_PART, XML_SUBMISSION_PART,
};
use crate::error::{Error, Result};
use crate::storage::md5_bytes;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;

const OPENROSA_VERSION_HEADER: &str = "X-OpenRosa-Version";
const OPENROSA_VERSION: &str = "1.0";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Applies to every request, body included
    pub timeout: Duration,
    pub user_agent: String,
    pub limits: ChunkLimits,
    pub token_routing: TokenRouting,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("{}/{}", crate::APP_NAME, crate::VERSION),
            limits: ChunkLimits::default(),
            token_routing: TokenRouting::default(),
        }
    }
}

/// Transport talking to a real server
pub struct HttpTransport {
    config: TransportConfig,
    credentials: Option<Credentials>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: TransportConfig, credentials: Option<Credentials>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            credentials,
            client,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// URL actually requested for a logical server URL
    pub fn physical_url(&self, url: &str) -> Result<String> {
        match &self.credentials {
            Some(credentials) if credentials.uses_token() => {
                self.config.token_routing.physical_url(url)
            }
            _ => Ok(url.to_string()),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(OPENROSA_VERSION_HEADER, OPENROSA_VERSION);
        match &self.credentials {
            Some(Credentials::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credentials::Token { token }) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GET that succeeds only on 200 with the expected content type
    async fn get(&self, url: &str, expected_type: Option<&str>) -> Result<(String, Response)> {
        let physical = self.physical_url(url)?;
        tracing::debug!(url = %physical, "GET");

        let response = self
            .authorize(self.client.get(&physical))
            .send()
            .await
            .map_err(|e| Error::network(&physical, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            discard_body(response).await;
            return Err(Error::Authentication { url: physical });
        }
        if status != StatusCode::OK {
            let message = body_text(response).await;
            tracing::info!(url = %physical, status = status.as_u16(), "GET failed");
            return Err(Error::Server {
                url: physical,
                status: status.as_u16(),
                message,
            });
        }

        if let Some(expected) = expected_type {
            let actual = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(actual) = actual.filter(|a| !a.is_empty()) {
                if !actual.to_ascii_lowercase().contains(expected) {
                    discard_body(response).await;
                    return Err(Error::UnexpectedContentType {
                        url: physical,
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }

        Ok((physical, response))
    }

    async fn get_bytes(&self, url: &str, expected_type: Option<&str>) -> Result<Vec<u8>> {
        let (physical, response) = self.get(url, expected_type).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::network(&physical, e))?;
        Ok(bytes.to_vec())
    }

    async fn build_chunk(
        &self,
        request: &UploadRequest,
        xml: &[u8],
        xml_name: &str,
        attachments: std::ops::Range<usize>,
        incomplete: bool,
    ) -> Result<Form> {
        let mut form = Form::new().part(
            XML_SUBMISSION_PART,
            file_part(xml.to_vec(), xml_name, "text/xml")?,
        );

        for index in attachments {
            let path = &request.attachments[index];
            let name = file_name(path)?;
            let bytes = tokio::fs::read(path).await?;
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            tracing::debug!(file = %name, content_type = %mime, "added attachment");
            form = form.part(name.clone(), file_part(bytes, &name, mime.essence_str())?);
        }

        if incomplete {
            form = form.text(INCOMPLETE_PART, "yes");
        }
        if let Some(notes) = &request.survey_notes {
            form = form.text("survey_notes", notes.clone());
        }
        if let Some(trigger) = &request.location_trigger {
            form = form.text("location_trigger", trigger.clone());
        }
        if let Some(assignment) = &request.assignment_id {
            form = form.text("assignment_id", assignment.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl OpenRosaTransport for HttpTransport {
    async fn fetch_form_list(&self, url: &str) -> Result<Vec<FormSummary>> {
        let bytes = self.get_bytes(url, Some(JSON_CONTENT_TYPE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch_form_manifest(&self, url: &str) -> Result<Manifest> {
        let bytes = self.get_bytes(url, Some(JSON_CONTENT_TYPE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch_form_definition(&self, url: &str) -> Result<FormDefinition> {
        let bytes = self.get_bytes(url, None).await?;
        let md5 = md5_bytes(&bytes);
        Ok(FormDefinition { bytes, md5 })
    }

    async fn fetch_media_file(&self, url: &str) -> Result<Vec<u8>> {
        self.get_bytes(url, None).await
    }

    async fn upload_instance(&self, request: &UploadRequest) -> Result<UploadResult> {
        let physical = self.physical_url(&request.endpoint)?;
        let xml_name = file_name(&request.instance_xml)?;
        let xml = tokio::fs::read(&request.instance_xml).await?;

        let mut lens = Vec::with_capacity(request.attachments.len());
        for attachment in &request.attachments {
            lens.push(tokio::fs::metadata(attachment).await?.len());
        }
        let plan = plan_chunks(xml.len() as u64, &lens, &self.config.limits);
        if plan.len() > 1 {
            tracing::info!(requests = plan.len(), url = %physical, "splitting submission");
        }
        let form_status = request.form_status.as_deref().unwrap_or("complete");

        let mut result = None;
        for (n, chunk) in plan.iter().enumerate() {
            let form = self
                .build_chunk(
                    request,
                    &xml,
                    &xml_name,
                    chunk.attachments.clone(),
                    chunk.incomplete,
                )
                .await?;

            let response = self
                .authorize(self.client.post(&physical))
                .header(FORM_STATUS_HEADER, form_status)
                .multipart(form)
                .send()
                .await
                .map_err(|e| Error::network(&physical, e))?;

            let status = response.status();
            match status {
                StatusCode::CREATED | StatusCode::ACCEPTED => {
                    let message = response
                        .text()
                        .await
                        .map_err(|e| Error::network(&physical, e))?;
                    result = Some(UploadResult {
                        requests: n + 1,
                        status: status.as_u16(),
                        message,
                    });
                }
                StatusCode::UNAUTHORIZED => {
                    discard_body(response).await;
                    return Err(Error::Authentication { url: physical });
                }
                StatusCode::NO_CONTENT => {
                    discard_body(response).await;
                    return Err(Error::Server {
                        url: physical,
                        status: status.as_u16(),
                        message: "server accepted the request without content".to_string(),
                    });
                }
                _ => {
                    let message = body_text(response).await;
                    tracing::warn!(url = %physical, status = status.as_u16(), request = n + 1, "submission rejected");
                    return Err(Error::Server {
                        url: physical,
                        status: status.as_u16(),
                        message,
                    });
                }
            }
        }

        result.ok_or_else(|| Error::Server {
            url: physical,
            status: 0,
            message: "no request was sent".to_string(),
        })
    }
}

/// Read the rest of a body so the connection can go back to the pool
async fn discard_body(response: Response) {
    let _ = response.bytes().await;
}

/// Body text for error messages; the body is consumed either way
async fn body_text(response: Response) -> String {
    let reason = response
        .status()
        .canonical_reason()
        .unwrap_or_default()
        .to_string();
    match response.text().await {
        Ok(text) if !text.trim().is_empty() => text,
        _ => reason,
    }
}

fn file_part(bytes: Vec<u8>, name: &str, mime: &str) -> Result<Part> {
    Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str(mime)
        .map_err(|e| Error::validation(format!("invalid content type {}: {}", mime, e)))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::validation(format!("{} has no file name", path.display())))
}
