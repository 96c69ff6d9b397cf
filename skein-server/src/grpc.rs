use std::collections::BTreeMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use skein_core::engine::Engine;
use skein_core::error::EngineError;
use skein_core::types::{InterruptOptions, JobState, StartOptions};

pub mod proto {
    tonic::include_proto!("skein.v1");
}

use proto::skein_server::Skein;
use proto::*;

pub struct SkeinService {
    pub engine: Arc<Engine>,
}

fn engine_err(e: EngineError) -> Status {
    match &e {
        EngineError::DuplicateJob(id) => Status::already_exists(format!("duplicate job: {id}")),
        EngineError::JobNotFound(_)
        | EngineError::GraphNotFound(_)
        | EngineError::ActivityNotFound(_) => Status::not_found(e.to_string()),
        EngineError::InactiveJob(_) | EngineError::StaleGeneration { .. } => {
            Status::failed_precondition(e.to_string())
        }
        _ => Status::internal(e.to_string()),
    }
}

fn parse_json(field: &str, raw: &str) -> Result<serde_json::Value, Status> {
    if raw.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw)
        .map_err(|e| Status::invalid_argument(format!("invalid JSON in {field}: {e}")))
}

fn state_name(state: &JobState) -> &'static str {
    match state {
        JobState::Running => "Running",
        JobState::Completed => "Completed",
        JobState::Interrupted => "Interrupted",
        JobState::Errored => "Errored",
    }
}

#[tonic::async_trait]
impl Skein for SkeinService {
    async fn register_graph(
        &self,
        request: Request<RegisterGraphRequest>,
    ) -> Result<Response<RegisterGraphResponse>, Status> {
        let req = request.into_inner();
        let graph = self
            .engine
            .register_graph_yaml(&req.manifest_yaml)
            .await
            .map_err(|e| Status::invalid_argument(format!("{e:#}")))?;
        Ok(Response::new(RegisterGraphResponse {
            topic: graph.subscribes.clone(),
            version: graph.version.to_vec(),
        }))
    }

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        let data = parse_json("data_json", &req.data_json)?;
        let search: BTreeMap<String, serde_json::Value> = match req.search_json.as_str() {
            "" => BTreeMap::new(),
            raw => serde_json::from_str(raw)
                .map_err(|e| Status::invalid_argument(format!("invalid search_json: {e}")))?,
        };
        let options = StartOptions {
            job_id: (!req.job_id.is_empty()).then(|| req.job_id.clone()),
            pending: req.pending,
            expire: (req.expire_ms > 0).then_some(req.expire_ms),
            search,
            parent: None,
        };
        let job_id = self
            .engine
            .start(&req.topic, data, options)
            .await
            .map_err(engine_err)?;
        Ok(Response::new(StartResponse { job_id }))
    }

    async fn signal(
        &self,
        request: Request<SignalRequest>,
    ) -> Result<Response<SignalResponse>, Status> {
        let req = request.into_inner();
        let payload = parse_json("payload_json", &req.payload_json)?;
        self.engine
            .signal(&req.topic, payload)
            .await
            .map_err(engine_err)?;
        Ok(Response::new(SignalResponse {}))
    }

    async fn interrupt(
        &self,
        request: Request<InterruptRequest>,
    ) -> Result<Response<InterruptResponse>, Status> {
        let req = request.into_inner();
        self.engine
            .interrupt(
                &req.job_id,
                InterruptOptions {
                    reason: (!req.reason.is_empty()).then(|| req.reason.clone()),
                    descend: req.descend,
                },
            )
            .await
            .map_err(engine_err)?;
        Ok(Response::new(InterruptResponse {}))
    }

    async fn get_state(
        &self,
        request: Request<GetStateRequest>,
    ) -> Result<Response<GetStateResponse>, Status> {
        let req = request.into_inner();
        let state = self.engine.get_state(&req.job_id).await.map_err(engine_err)?;
        Ok(Response::new(GetStateResponse {
            state_json: state.to_string(),
        }))
    }

    async fn get_status(
        &self,
        request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let req = request.into_inner();
        let status = self
            .engine
            .get_status(&req.job_id)
            .await
            .map_err(engine_err)?;
        let (error_code, error_message) = status
            .error
            .map(|e| (e.code as u32, e.message))
            .unwrap_or((0, String::new()));
        Ok(Response::new(GetStatusResponse {
            job_id: status.job_id,
            state: state_name(&status.state).to_string(),
            semaphore: status.semaphore,
            error_code,
            error_message,
        }))
    }

    async fn export(
        &self,
        request: Request<ExportRequest>,
    ) -> Result<Response<ExportResponse>, Status> {
        let req = request.into_inner();
        let timeline = self.engine.export(&req.job_id).await.map_err(engine_err)?;
        let entries = timeline
            .into_iter()
            .filter(|(seq, _)| *seq >= req.from_seq)
            .map(|(seq, event)| {
                Ok(TimelineEntry {
                    seq,
                    event_json: serde_json::to_string(&event)
                        .map_err(|e| Status::internal(e.to_string()))?,
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;
        Ok(Response::new(ExportResponse { entries }))
    }
}
