// Client for the external blob store ("droopy"): one operation, upload a
// local file and hand back its retrieval URL.

use std::path::Path;

use reqwest::Client;
use tracing::{info, warn};

use crate::config::Endpoints;
use crate::error::{ArenaError, TransientError};

pub struct BlobClient {
    base_url: String,
    creds: Option<(String, String)>,
    http: Client,
}

impl BlobClient {
    pub fn new(endpoints: &Endpoints) -> Self {
        BlobClient {
            base_url: endpoints.droopy_url.clone(),
            creds: endpoints.droopy_creds.clone(),
            http: Client::new(),
        }
    }

    /// Upload `local_path` under `remote_name`, returning the retrieval URL
    /// (the base URL concatenated with the remote name).
    pub async fn upload_file(&self, local_path: &Path, remote_name: &str) -> Result<String, ArenaError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| ArenaError::Transient(TransientError::from(e)))?;

        let part = reqwest::multipart::Part::bytes(bytes).file_name(remote_name.to_string());
        let form = reqwest::multipart::Form::new().part("upfile", part);

        let mut request = self.http.post(&self.base_url).multipart(form);
        if let Some((user, pass)) = &self.creds {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(TransientError::from)?;
        if !response.status().is_success() {
            warn!(remote_name, status = %response.status(), "blob upload failed");
            return Err(ArenaError::Transient(TransientError::Http(
                response.error_for_status().unwrap_err(),
            )));
        }

        let url = format!("{}{}", self.base_url, remote_name);
        info!(remote_name, url, "uploaded blob");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_client_constructs_from_endpoints() {
        let endpoints = Endpoints {
            database_url: "sqlite::memory:".to_string(),
            gameserver_host: "localhost".to_string(),
            gameserver_tcpport: 1,
            gameserver_webport: 2,
            droopy_url: "http://droopy.example/".to_string(),
            droopy_creds: Some(("u".to_string(), "p".to_string())),
        };
        let client = BlobClient::new(&endpoints);
        assert_eq!(client.base_url, "http://droopy.example/");
        assert!(client.creds.is_some());
    }
}
