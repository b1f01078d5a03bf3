//! HTTP transport for the registry API.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::lifecycle::ReservationId;

use super::types::{Node, ReservationEnvelope, ReservationResult};
use super::{RegistryApi, RegistryError, RegistryFuture};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry transport backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base: Url,
}

pub(super) fn build_client(builder: reqwest::ClientBuilder) -> Result<reqwest::Client, RegistryError> {
    builder.build().map_err(|err| RegistryError::Transport {
        message: err.to_string(),
    })
}

impl HttpRegistry {
    /// Creates a transport for the registry rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidBaseUrl`] when the URL cannot be
    /// parsed or cannot carry a path, and [`RegistryError::Transport`] when
    /// the HTTP client cannot be initialised.
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        let base = Url::parse(base_url).map_err(|err| RegistryError::InvalidBaseUrl {
            url: base_url.to_owned(),
            message: err.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(RegistryError::InvalidBaseUrl {
                url: base_url.to_owned(),
                message: String::from("url cannot carry a path"),
            });
        }

        let client = build_client(reqwest::Client::builder().timeout(HTTP_TIMEOUT))?;
        Ok(Self { client, base })
    }

    /// Returns the URL of the endpoint made of `segments` under the base.
    #[must_use]
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RegistryError> {
        let endpoint = url.to_string();
        let unavailable = |message: String| RegistryError::Unavailable {
            endpoint: endpoint.clone(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| unavailable(err.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(unavailable(format!("unexpected status {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| unavailable(format!("failed to decode response: {err}")))
    }
}

impl RegistryApi for HttpRegistry {
    fn fetch_nodes(&self) -> RegistryFuture<'_, Vec<Node>> {
        Box::pin(async move { self.get_json(self.endpoint(&["nodes"])).await })
    }

    fn fetch_reservation<'a>(
        &'a self,
        id: &'a ReservationId,
    ) -> RegistryFuture<'a, ReservationResult> {
        Box::pin(async move {
            let url = self.endpoint(&["reservations", id.as_str()]);
            let envelope: ReservationEnvelope = self.get_json(url).await?;
            Ok(envelope.result)
        })
    }
}
