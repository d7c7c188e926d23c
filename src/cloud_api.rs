use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{
    Aggregation, ConsumptionResult, MeteringApi, MeteringConfiguration, RecordsResult,
    ServiceLocationInfo, ServiceLocations, TimeRange, TokenSource,
};
use crate::appliance::ApplianceEvent;
use crate::error::{Error, Result};
use crate::settings::Settings;
use crate::{EntityId, LocationId};

/// `reqwest` client for the public service-location API
pub struct CloudApi {
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    client: reqwest::Client,
}

impl CloudApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_settings(settings: &Settings, tokens: Arc<dyn TokenSource>) -> Self {
        Self::new(settings.endpoints.service_location_url.clone(), tokens)
    }

    fn url(&self, location: LocationId, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, location, path)
    }

    /// Sends the request, refreshing the token and retrying once on 401
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.access_token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        warn!("Access token rejected, refreshing");
        let token = self.tokens.refresh().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        debug!(url, "GET");
        let response = self
            .send(|client| client.get(url).query(query))
            .await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        debug!(url, "GET");
        let response = self.send(|client| client.get(url)).await?;
        Ok(response.text().await?)
    }

    async fn get_records(
        &self,
        url: &str,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<RecordsResult> {
        self.get_json(url, &consumption_query(range, aggregation))
            .await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

fn consumption_query(range: TimeRange, aggregation: Aggregation) -> Vec<(&'static str, String)> {
    vec![
        ("aggregation", aggregation.as_param().to_string()),
        ("from", range.from_ms().to_string()),
        ("to", range.to_ms().to_string()),
    ]
}

#[async_trait]
impl MeteringApi for CloudApi {
    async fn get_service_locations(&self) -> Result<ServiceLocations> {
        self.get_json(&self.base_url, &[]).await
    }

    async fn get_metering_configuration(&self, location: LocationId) -> Result<MeteringConfiguration> {
        self.get_json(&self.url(location, "meteringconfiguration"), &[])
            .await
    }

    async fn get_service_location_info(&self, location: LocationId) -> Result<ServiceLocationInfo> {
        self.get_json(&self.url(location, "info"), &[]).await
    }

    async fn get_actuator_state(&self, location: LocationId, actuator: EntityId) -> Result<String> {
        self.get_text(&self.url(location, &format!("actuator/{actuator}/state")))
            .await
    }

    async fn get_actuator_connection_state(
        &self,
        location: LocationId,
        actuator: EntityId,
    ) -> Result<String> {
        let raw = self
            .get_text(&self.url(location, &format!("actuator/{actuator}/connectionstate")))
            .await?;
        Ok(raw.replace('"', ""))
    }

    async fn set_actuator_state(
        &self,
        location: LocationId,
        actuator: EntityId,
        state: &str,
        duration: Option<u32>,
    ) -> Result<()> {
        let url = self.url(location, &format!("actuator/{actuator}/{state}"));
        let body = match duration {
            Some(duration) => json!({ "duration": duration }),
            None => json!({}),
        };
        debug!(url, "POST");
        self.send(|client| client.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn get_consumption(
        &self,
        location: LocationId,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<ConsumptionResult> {
        self.get_json(
            &self.url(location, "consumption"),
            &consumption_query(range, aggregation),
        )
        .await
    }

    async fn get_sensor_consumption(
        &self,
        location: LocationId,
        sensor: EntityId,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<RecordsResult> {
        self.get_records(
            &self.url(location, &format!("sensor/{sensor}/consumption")),
            range,
            aggregation,
        )
        .await
    }

    async fn get_switch_consumption(
        &self,
        location: LocationId,
        switch: EntityId,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<RecordsResult> {
        self.get_records(
            &self.url(location, &format!("switch/{switch}/consumption")),
            range,
            aggregation,
        )
        .await
    }

    async fn get_events(
        &self,
        location: LocationId,
        appliance: EntityId,
        range: TimeRange,
        max_number: Option<u32>,
    ) -> Result<Vec<ApplianceEvent>> {
        let mut query = vec![
            ("from", range.from_ms().to_string()),
            ("to", range.to_ms().to_string()),
            ("applianceId", appliance.to_string()),
        ];
        if let Some(max_number) = max_number {
            query.push(("maxNumber", max_number.to_string()));
        }
        self.get_json(&self.url(location, "events"), &query).await
    }
}
