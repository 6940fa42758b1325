use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::ApiConfig;

use super::api_types::{ApiPost, PostRequest};
use super::cache::PostsQuery;
use super::transport::{Transport, TransportError, TransportFuture};

/// REST transport for a JSONPlaceholder-shaped posts API
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    // `Url::join` replaces the last path segment unless the base ends with '/'
    let mut base_url = config.base_url.trim().to_string();
    if !base_url.ends_with('/') {
      base_url.push('/');
    }
    let base = Url::parse(&base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  fn url(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base
      .join(path)
      .map_err(|e| TransportError::new(format!("Invalid request path {}: {}", path, e)))
  }

  /// Fetch the posts matching a query
  pub async fn get_posts(&self, query: &PostsQuery) -> Result<Vec<ApiPost>, TransportError> {
    match query {
      PostsQuery::All => self.request_json(Method::GET, self.url("posts")?, None::<&()>).await,
      PostsQuery::ById(id) => {
        let url = self.url(&format!("posts/{}", id))?;
        let post: ApiPost = self.request_json(Method::GET, url, None::<&()>).await?;
        Ok(vec![post])
      }
      PostsQuery::ByUser(user_id) => {
        let mut url = self.url("posts")?;
        url
          .query_pairs_mut()
          .append_pair("userId", &user_id.to_string());
        self.request_json(Method::GET, url, None::<&()>).await
      }
    }
  }

  /// Execute a write request
  pub async fn execute(&self, request: &PostRequest) -> Result<Option<ApiPost>, TransportError> {
    match request {
      PostRequest::Create(post) => {
        let created = self
          .request_json(Method::POST, self.url("posts")?, Some(post))
          .await?;
        Ok(Some(created))
      }
      PostRequest::Patch { id, fields } => {
        let url = self.url(&format!("posts/{}", id))?;
        let updated = self.request_json(Method::PATCH, url, Some(fields)).await?;
        Ok(Some(updated))
      }
      PostRequest::Delete(id) => {
        let url = self.url(&format!("posts/{}", id))?;
        self
          .client
          .delete(url.clone())
          .send()
          .await
          .and_then(|response| response.error_for_status())
          .map_err(|e| TransportError::new(format!("Failed to delete {}: {}", url, e)))?;
        Ok(None)
      }
    }
  }

  async fn request_json<T, B>(
    &self,
    method: Method,
    url: Url,
    body: Option<&B>,
  ) -> Result<T, TransportError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    let mut builder = self.client.request(method.clone(), url.clone());
    if let Some(body) = body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .and_then(|response| response.error_for_status())
      .map_err(|e| TransportError::new(format!("{} {} failed: {}", method, url, e)))?;

    response
      .json::<T>()
      .await
      .map_err(|e| TransportError::new(format!("Failed to parse response from {}: {}", url, e)))
  }
}

impl Transport for HttpTransport {
  fn fetch(&self, query: &PostsQuery) -> TransportFuture<Vec<ApiPost>> {
    let this = self.clone();
    let query = query.clone();
    async move { this.get_posts(&query).await }.boxed()
  }

  fn send(&self, request: &PostRequest) -> TransportFuture<Option<ApiPost>> {
    let this = self.clone();
    let request = request.clone();
    async move { this.execute(&request).await }.boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transport(base_url: &str) -> HttpTransport {
    HttpTransport::new(&ApiConfig {
      base_url: base_url.to_string(),
      timeout_secs: 5,
    })
    .unwrap()
  }

  #[test]
  fn test_urls_join_under_base_path() {
    let http = transport("https://example.test/api/v1");
    assert_eq!(
      http.url("posts/3").unwrap().as_str(),
      "https://example.test/api/v1/posts/3"
    );
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    assert!(HttpTransport::new(&ApiConfig {
      base_url: "not a url".to_string(),
      timeout_secs: 5,
    })
    .is_err());
  }
}
