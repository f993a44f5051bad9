use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes prepared HTTP requests. Lets tests stand in for the network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
