//! Big Local News project storage over its GraphQL API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_BLN_API_URL: &str = "https://api.biglocalnews.org/graphql";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("storage api error: {0}")]
    Api(String),
    #[error("unexpected storage response: {0}")]
    Shape(String),
    #[error("local file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Remote file store holding the published snapshots.
#[async_trait]
pub trait ProjectStorage: Send + Sync {
    async fn list_files(&self, project_id: &str) -> Result<Vec<RemoteFile>, StorageError>;

    /// Downloads `file_name` into `output_dir`, returning the local path.
    async fn download_file(
        &self,
        project_id: &str,
        file_name: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, StorageError>;

    async fn upload_file(&self, project_id: &str, local_path: &Path) -> Result<(), StorageError>;
}

const PROJECT_FILES_QUERY: &str = r#"
query ProjectFiles($id: ID!) {
  node(id: $id) {
    ... on Project {
      id
      name
      files { name updatedAt }
    }
  }
}"#;

const DOWNLOAD_URI_MUTATION: &str = r#"
mutation CreateFileDownloadUri($input: FileURIInput!) {
  createFileDownloadUri(input: $input) {
    ok { name uri }
    err
  }
}"#;

const UPLOAD_URI_MUTATION: &str = r#"
mutation CreateFileUploadUri($input: FileURIInput!) {
  createFileUploadUri(input: $input) {
    ok { name uri }
    err
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct FileUriPayload {
    ok: Option<FileUri>,
    err: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileUri {
    #[allow(dead_code)]
    name: String,
    uri: String,
}

/// GraphQL client for a Big Local News account.
pub struct BlnClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl BlnClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            token: token.into(),
        })
    }

    async fn graphql(&self, query: &str, variables: JsonValue) -> Result<JsonValue, StorageError> {
        let resp = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("JWT {}", self.token))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let payload: GraphQlResponse = resp.json().await?;
        if let Some(first) = payload.errors.first() {
            return Err(StorageError::Api(first.message.clone()));
        }
        payload
            .data
            .ok_or_else(|| StorageError::Shape("missing data".to_string()))
    }

    async fn file_uri(
        &self,
        mutation: &str,
        field: &str,
        project_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError> {
        let data = self
            .graphql(
                mutation,
                json!({ "input": { "projectId": project_id, "fileName": file_name } }),
            )
            .await?;
        let payload: FileUriPayload = data
            .get(field)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StorageError::Shape(e.to_string()))?
            .ok_or_else(|| StorageError::Shape(format!("missing {field}")))?;
        match (payload.ok, payload.err) {
            (Some(uri), _) => Ok(uri.uri),
            (None, Some(err)) => Err(StorageError::Api(err)),
            (None, None) => Err(StorageError::Shape(format!("{field} returned neither ok nor err"))),
        }
    }
}

#[async_trait]
impl ProjectStorage for BlnClient {
    async fn list_files(&self, project_id: &str) -> Result<Vec<RemoteFile>, StorageError> {
        let data = self
            .graphql(PROJECT_FILES_QUERY, json!({ "id": project_id }))
            .await?;
        files_from_project_node(&data)
    }

    async fn download_file(
        &self,
        project_id: &str,
        file_name: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, StorageError> {
        let uri = self
            .file_uri(DOWNLOAD_URI_MUTATION, "createFileDownloadUri", project_id, file_name)
            .await?;
        let resp = self.client.get(&uri).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::Server {
                status: status.as_u16(),
                body: format!("downloading {file_name}"),
            });
        }
        let bytes = resp.bytes().await?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: output_dir.to_path_buf(),
                source,
            })?;
        let local_path = output_dir.join(file_name);
        tokio::fs::write(&local_path, &bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: local_path.clone(),
                source,
            })?;
        info!(file_name, bytes = bytes.len(), "downloaded project file");
        Ok(local_path)
    }

    async fn upload_file(&self, project_id: &str, local_path: &Path) -> Result<(), StorageError> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::Shape(format!("{} has no file name", local_path.display())))?;
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|source| StorageError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;

        let uri = self
            .file_uri(UPLOAD_URI_MUTATION, "createFileUploadUri", project_id, &file_name)
            .await?;
        let size = bytes.len();
        let resp = self.client.put(&uri).body(bytes).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Server {
                status: status.as_u16(),
                body,
            });
        }
        info!(file_name = %file_name, bytes = size, "uploaded project file");
        Ok(())
    }
}

fn files_from_project_node(data: &JsonValue) -> Result<Vec<RemoteFile>, StorageError> {
    let node = data
        .get("node")
        .filter(|n| !n.is_null())
        .ok_or_else(|| StorageError::Shape("project not found".to_string()))?;
    let files = match node.get("files") {
        Some(files) if !files.is_null() => files.clone(),
        _ => return Ok(Vec::new()),
    };
    serde_json::from_value(files).map_err(|e| StorageError::Shape(e.to_string()))
}
