//! Fleet API over HTTP/JSON.

use std::time::Duration;

use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::{
    DetailResponse, FleetApi, FleetError, FleetFuture, MissionDetail, MissionRequest,
    SubmitOutcome, SubmitResponse, VehicleCommand,
};
use crate::dispatch::core::config::FleetConfig;

#[derive(Clone, Debug)]
pub struct HttpFleetApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpFleetApi {
    pub fn new(config: &FleetConfig) -> Result<Self, FleetError> {
        let mut builder = Client::builder();
        if let Some(timeout_ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let client = builder.build().map_err(|e| FleetError::Transport {
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(reqwest::header::AUTHORIZATION, format!("Basic {key}")),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, FleetError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| FleetError::Transport {
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Http {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, FleetError> {
        response.json::<T>().await.map_err(|e| FleetError::Decode {
            message: e.to_string(),
        })
    }

    pub async fn submit(&self, request: &MissionRequest) -> Result<SubmitOutcome, FleetError> {
        debug!(
            "[agv][fleet] submit type={} from={} to={} linked={:?}",
            request.mission_type,
            request.from_node,
            request.to_node,
            request.parameters.linked_mission
        );
        let response = self
            .send(self.client.post(self.url("missions")).json(request))
            .await?;
        let body: SubmitResponse = Self::json(response).await?;
        Ok(body.into_outcome())
    }

    pub async fn detail(&self, mission_id: &str) -> Result<Option<MissionDetail>, FleetError> {
        let response = self
            .send(self.client.get(self.url(&format!("missions/{mission_id}"))))
            .await?;
        let body: DetailResponse = Self::json(response).await?;
        Ok(body.into_detail(mission_id))
    }

    pub async fn command(&self, vehicle: &str, command: &VehicleCommand) -> Result<(), FleetError> {
        let body = serde_json::json!({ "command": command });
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("vehicles/{vehicle}/command")))
                    .json(&body),
            )
            .await?;
        let reply: serde_json::Value = Self::json(response).await?;
        match reply.get("retcode").and_then(|v| v.as_i64()) {
            Some(0) | None => Ok(()),
            Some(retcode) => Err(FleetError::Retcode {
                retcode,
                message: format!("vehicle command {} on {vehicle}", command.name),
            }),
        }
    }
}

impl FleetApi for HttpFleetApi {
    fn submit_mission<'a>(&'a self, request: &'a MissionRequest) -> FleetFuture<'a, SubmitOutcome> {
        Box::pin(self.submit(request))
    }

    fn mission_detail<'a>(&'a self, mission_id: &'a str) -> FleetFuture<'a, Option<MissionDetail>> {
        Box::pin(self.detail(mission_id))
    }

    fn vehicle_command<'a>(
        &'a self,
        vehicle: &'a str,
        command: &'a VehicleCommand,
    ) -> FleetFuture<'a, ()> {
        Box::pin(self.command(vehicle, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::dispatch::adapters::fleet::MissionParameters;

    fn api(server: &MockServer, api_key: Option<&str>) -> HttpFleetApi {
        HttpFleetApi::new(&FleetConfig {
            base_url: format!("{}/wms/rest/", server.uri()),
            api_key: api_key.map(str::to_string),
            timeout_ms: Some(2000),
        })
        .unwrap()
    }

    fn request(linked: Option<&str>) -> MissionRequest {
        MissionRequest {
            requestor: "wms".to_string(),
            mission_type: "8".to_string(),
            from_node: "P01".to_string(),
            to_node: "D07".to_string(),
            cardinality: "1".to_string(),
            priority: 1,
            deadline: Utc::now(),
            dispatch_time: Utc::now(),
            parameters: MissionParameters {
                payload: "AGV02".to_string(),
                is_linkable: true,
                linked_mission: linked.map(str::to_string),
                link_wait_timeout: 30,
            },
        }
    }

    #[tokio::test]
    async fn submit_posts_mission_and_reads_accepted_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wms/rest/missions"))
            .and(header("authorization", "Basic c2VjcmV0"))
            .and(body_partial_json(serde_json::json!({
                "missiontype": "8",
                "parameters": { "linkedMission": "41", "isLinkable": true }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "retcode": 0,
                "payload": { "acceptedmissions": ["42"], "rejectedmissions": [], "pendingmissions": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = api(&server, Some("c2VjcmV0"))
            .submit(&request(Some("41")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Accepted {
                mission_id: "42".to_string()
            }
        );
    }

    #[tokio::test]
    async fn detail_maps_navigation_state_and_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wms/rest/missions/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "retcode": 0,
                "payload": { "missions": [{ "missionid": 42, "navigationstate": 4 }] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/wms/rest/missions/43"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "retcode": 0,
                "payload": { "missions": [] }
            })))
            .mount(&server)
            .await;

        let api = api(&server, None);
        let detail = api.detail("42").await.unwrap().unwrap();
        assert_eq!(detail.mission_id, "42");
        assert_eq!(
            detail.status(),
            Some(crate::dispatch::core::model::MissionStatus::Completed)
        );
        assert_eq!(api.detail("43").await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = api(&server, None).detail("1").await.unwrap_err();
        assert_eq!(err, FleetError::Http { status: 503 });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn vehicle_extract_posts_command() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/wms/rest/vehicles/AGV02/command"))
            .and(body_partial_json(serde_json::json!({
                "command": { "name": "extract" }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "retcode": 0 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        api(&server, None)
            .command("AGV02", &VehicleCommand::extract())
            .await
            .unwrap();
    }
}
