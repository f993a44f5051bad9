use std::time::Duration;

use super::client::HttpClient;
use async_trait::async_trait;

/// Plain `reqwest` client with generous timeouts for large downloads.
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
