//! Named pipelines and the table that holds them.
//!
//! A pipeline builds one [`crate::Flow`] per request and runs it. The
//! registry is an explicit value constructed at startup and handed to
//! whatever serves requests.

use std::collections::BTreeMap;
use std::fmt::{Display, Write};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{FlowError, Result, RunContext, RunOptions};

/// Incoming request for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub shipment_id: String,
    /// Step names to mark done without running them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_steps: Vec<String>,
}

impl PipelineRequest {
    pub fn new(shipment_id: impl Into<String>) -> Self {
        Self {
            shipment_id: shipment_id.into(),
            skip_steps: Vec::new(),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::new().skip(self.skip_steps.iter().cloned())
    }
}

/// Outcome of a pipeline run as returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default)]
    pub email_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn succeeded(record_id: Option<String>, file_id: Option<String>, email_sent: bool) -> Self {
        Self {
            success: true,
            record_id,
            file_id,
            email_sent,
            error: None,
        }
    }

    /// A non-success result carrying only the error text.
    pub fn failed(error: impl Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Step (task) names in registration order.
    fn steps(&self) -> Vec<String>;

    /// Runs one request. Flow failures come back as a non-success
    /// [`PipelineResult`]; `Err` is reserved for requests that could not be
    /// started at all.
    async fn run(&self, ctx: RunContext, request: PipelineRequest) -> Result<PipelineResult>;
}

/// Listing entry for a registered pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineDescriptor {
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
}

#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipeline: Arc<dyn Pipeline>) -> Result<()> {
        let name = pipeline.name().to_string();
        if self.pipelines.contains_key(&name) {
            return Err(FlowError::DuplicatePipeline(name));
        }
        self.pipelines.insert(name, pipeline);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn descriptors(&self) -> Vec<PipelineDescriptor> {
        self.pipelines
            .values()
            .map(|p| PipelineDescriptor {
                name: p.name().to_string(),
                description: p.description().to_string(),
                steps: p.steps(),
            })
            .collect()
    }

    pub fn list_with_descriptions(&self) -> String {
        if self.pipelines.is_empty() {
            return "No pipelines registered".to_string();
        }

        let mut out = String::from("Available pipelines:\n");
        for d in self.descriptors() {
            let _ = writeln!(out, "  {} - {} ({} steps)", d.name, d.description, d.steps.len());
        }
        out
    }

    pub async fn run(
        &self,
        name: &str,
        ctx: RunContext,
        request: PipelineRequest,
    ) -> Result<PipelineResult> {
        let pipeline = self
            .get(name)
            .ok_or_else(|| FlowError::UnknownPipeline(name.to_string()))?;

        info!(
            pipeline = name,
            shipment_id = %request.shipment_id,
            skip_steps = ?request.skip_steps,
            "pipeline requested"
        );
        pipeline.run(ctx, request).await
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_round_trip_defaults_skip_steps() {
        let req: PipelineRequest = serde_json::from_str(r#"{"shipment_id":"00123"}"#).unwrap();
        assert_eq!(req, PipelineRequest::new("00123"));
        assert!(req.run_options().skip.is_empty());
    }

    #[test]
    fn request_skip_steps_become_run_options() {
        let req: PipelineRequest =
            serde_json::from_str(r#"{"shipment_id":"1","skip_steps":["send_email"]}"#).unwrap();
        assert!(req.run_options().skip.contains("send_email"));
    }

    #[test]
    fn failed_result_omits_ids() {
        let json = serde_json::to_value(PipelineResult::failed("boom")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"success": false, "email_sent": false, "error": "boom"})
        );
    }

    #[test]
    fn succeeded_result_carries_ids() {
        let result = PipelineResult::succeeded(Some("rec-1".into()), Some("file-9".into()), true);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["record_id"], "rec-1");
        assert_eq!(json["file_id"], "file-9");
        assert_eq!(json["email_sent"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn empty_registry_listing() {
        let registry = PipelineRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.list_with_descriptions(), "No pipelines registered");
    }
}
