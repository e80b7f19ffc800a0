//! HTTP client for the fleetsync daemon

use reqwest::{Client, Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use fleetsync_api::{
    requests::{TransactionPostRequest, TransferPostRequest, TransferPutRequest},
    responses::{
        HealthResponse, RecordSummary, StatusResponse, TransactionPostResponse, TransactionView,
        TransferPostResponse, TransferView,
    },
};

use crate::error::{ClientError, Result};

/// HTTP client for communicating with a fleetsync daemon
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: Url,
}

/// Turn a non-success response into [`ClientError::Api`]
///
/// The daemon answers errors with a `{code, message}` envelope; other
/// servers' bodies are kept verbatim.
async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StatusResponse>(&text)
        .map(|envelope| envelope.message)
        .unwrap_or(text);
    Err(ClientError::Api { status, message })
}

impl HttpClient {
    /// Create a new HTTP client
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    ///
    /// # Example
    /// ```no_run
    /// use fleetsync_client::HttpClient;
    ///
    /// let client = HttpClient::new("http://localhost:9014")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            client: Client::new(),
            base_url,
        })
    }

    /// Create a new HTTP client with custom `reqwest::Client`
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn with_client(base_url: impl AsRef<str>, client: Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a full URL from a path
    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(ClientError::Url)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<T> {
        debug!(method = %method, url = %url, "sending request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, self.url(path)?, None::<&Value>)
            .await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &(impl Serialize + Sync)) -> Result<T> {
        self.request(Method::POST, self.url(path)?, Some(body)).await
    }

    async fn put<T: DeserializeOwned>(&self, path: &str, body: &(impl Serialize + Sync)) -> Result<T> {
        self.request(Method::PUT, self.url(path)?, Some(body)).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::DELETE, self.url(path)?, None::<&Value>)
            .await
    }

    /// POST a JSON body to an absolute URL and return the JSON reply
    ///
    /// Used for agent commands and archive notifications, which live outside
    /// the daemon's route table. An empty reply body reads as `null`.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid, the request fails or the
    /// server answers with an error status.
    pub async fn send_json(&self, url: &str, body: &Value) -> Result<Value> {
        let url = Url::parse(url)?;
        debug!(url = %url, "sending json");
        let response = check(self.client.post(url).json(body).send().await?).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    // System endpoints

    /// Get daemon health status
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/health").await
    }

    // Sync endpoints

    /// Create a transaction, or join the live one doing the same work
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn create_transaction(
        &self,
        request: &TransactionPostRequest,
    ) -> Result<TransactionPostResponse> {
        self.post("/sync/transaction", request).await
    }

    /// Fetch the aggregated view of a transaction
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn get_transaction(&self, id: &str) -> Result<TransactionView> {
        self.get(&format!("/sync/transaction/{id}")).await
    }

    /// Report one transfer of a transaction as ended
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn end_transfer(&self, transaction_id: &str, transfer_id: &str) -> Result<StatusResponse> {
        self.put(
            &format!("/sync/transaction/{transaction_id}/transfer/{transfer_id}"),
            &Value::Null,
        )
        .await
    }

    /// List stored transactions, optionally only those with `code`
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn list_transactions(&self, code: Option<i32>) -> Result<Vec<RecordSummary>> {
        self.list("/sync/transaction", code).await
    }

    /// # Errors
    /// Always rejected by the daemon; kept for route completeness.
    pub async fn delete_transaction(&self, id: &str) -> Result<StatusResponse> {
        self.delete(&format!("/sync/transaction/{id}")).await
    }

    // Tunnel endpoints

    /// Create a transfer, or join the live one doing the same work
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn create_transfer(&self, request: &TransferPostRequest) -> Result<TransferPostResponse> {
        self.post("/tunnel/transfer", request).await
    }

    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn get_transfer(&self, id: &str) -> Result<TransferView> {
        self.get(&format!("/tunnel/transfer/{id}")).await
    }

    /// Deliver an agent's completion report
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn report_task(&self, report: &TransferPutRequest) -> Result<StatusResponse> {
        self.put(&format!("/tunnel/transfer/{}", report.transfer_id), report)
            .await
    }

    /// List stored transfers, optionally only those with `code`
    ///
    /// # Errors
    /// Returns an error if the request fails or the daemon returns an error.
    pub async fn list_transfers(&self, code: Option<i32>) -> Result<Vec<RecordSummary>> {
        self.list("/tunnel/transfer", code).await
    }

    /// # Errors
    /// Always rejected by the daemon; kept for route completeness.
    pub async fn delete_transfer(&self, id: &str) -> Result<StatusResponse> {
        self.delete(&format!("/tunnel/transfer/{id}")).await
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, code: Option<i32>) -> Result<T> {
        let mut url = self.url(path)?;
        if let Some(code) = code {
            url.query_pairs_mut().append_pair("code", &code.to_string());
        }
        self.request(Method::GET, url, None::<&Value>).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = HttpClient::new("http://localhost:9014");
        assert!(client.is_ok());
    }

    #[test]
    fn test_invalid_url() {
        let client = HttpClient::new("not a url");
        assert!(client.is_err());
    }

    #[test]
    fn test_url_building() {
        let client = HttpClient::new("http://localhost:9014").unwrap();
        let url = client.url("/tunnel/transfer/abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9014/tunnel/transfer/abc");
    }

    #[test]
    fn test_base_path_is_replaced_by_absolute_routes() {
        let client = HttpClient::new("http://tunnel-3:9014/prefix/").unwrap();
        let url = client.url("/sync/transaction").unwrap();
        assert_eq!(url.as_str(), "http://tunnel-3:9014/sync/transaction");
    }

    #[tokio::test]
    async fn test_send_json_rejects_relative_urls() {
        let client = HttpClient::new("http://localhost:9014").unwrap();
        let result = client.send_json("agent/task", &Value::Null).await;
        assert!(matches!(result, Err(ClientError::Url(_))));
    }
}
