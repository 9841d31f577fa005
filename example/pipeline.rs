//! Certificate-of-conformance pipeline wired onto the scheduler.
//!
//! The task bodies only simulate the external calls (shipment lookup, PDF
//! rendering, CMS writes, email); what matters here is the graph:
//!
//! ```text
//! fetch_shipment ─> prepare_record ─> create_record ─┐
//! render_pdf ────────────────────────────────────────┴─> upload_pdf ─> send_email
//! ```
//!
//! Run with `cargo run --example pipeline -- <shipment-id> [skip-step...]`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use taskflow::logging::{LogFormat, init_logging};
use taskflow::{
    Flow, FlowConfig, FlowError, Pipeline, PipelineRegistry, PipelineRequest, PipelineResult,
    RunContext,
};

const STEPS: [&str; 6] = [
    "fetch_shipment",
    "render_pdf",
    "prepare_record",
    "create_record",
    "upload_pdf",
    "send_email",
];

#[derive(Debug, Clone)]
struct ShipmentItem {
    serial: String,
    product_id: String,
    document_id: String,
}

#[derive(Debug, Clone)]
struct CertificationRecord {
    identification: String,
    shipment_id: String,
    covered_serials: String,
    product_id: String,
}

/// Everything the steps hand to each other, one named field per output.
#[derive(Debug, Default)]
struct CertificateState {
    items: Vec<ShipmentItem>,
    pdf: Option<(String, Vec<u8>)>,
    record: Option<CertificationRecord>,
    record_id: Option<String>,
    file_id: Option<String>,
    email_sent: bool,
}

type SharedState = Arc<Mutex<CertificateState>>;

struct CertificatePipeline {
    config: FlowConfig,
}

impl CertificatePipeline {
    fn build_flow(&self, shipment_id: &str, state: &SharedState) -> taskflow::Result<Flow> {
        let mut flow = Flow::new("certificate").with_retry_policy(self.config.retry_policy());

        let (s, id) = (state.clone(), shipment_id.to_string());
        flow.add_task(
            "fetch_shipment",
            move || {
                let (s, id) = (s.clone(), id.clone());
                async move {
                    let items = fetch_shipment(&id).await.context("fetch shipment data")?;
                    s.lock().await.items = items;
                    Ok(())
                }
            },
            &[],
        )?;

        let (s, id) = (state.clone(), shipment_id.to_string());
        flow.add_task(
            "render_pdf",
            move || {
                let (s, id) = (s.clone(), id.clone());
                async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    let filename = format!("certificate-{id}.pdf");
                    s.lock().await.pdf = Some((filename, b"%PDF-1.7".to_vec()));
                    Ok(())
                }
            },
            &[],
        )?;

        let (s, id) = (state.clone(), shipment_id.to_string());
        flow.add_task(
            "prepare_record",
            move || {
                let (s, id) = (s.clone(), id.clone());
                async move {
                    let mut st = s.lock().await;
                    let record = prepare_record(&id, &st.items)?;
                    st.record = Some(record);
                    Ok(())
                }
            },
            &["fetch_shipment"],
        )?;

        let s = state.clone();
        flow.add_task(
            "create_record",
            move || {
                let s = s.clone();
                async move {
                    let mut st = s.lock().await;
                    let record = st.record.as_ref().context("no record prepared")?;
                    info!(
                        shipment = %record.shipment_id,
                        product = %record.product_id,
                        serials = record.covered_serials.lines().count(),
                        "creating certification record"
                    );
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let id = format!("cert-{}", record.identification);
                    st.record_id = Some(id);
                    Ok(())
                }
            },
            &["prepare_record"],
        )?;

        let s = state.clone();
        flow.add_task(
            "upload_pdf",
            move || {
                let s = s.clone();
                async move {
                    let mut st = s.lock().await;
                    let (filename, content) = st.pdf.as_ref().context("no rendered PDF")?;
                    let record_id = st.record_id.as_ref().context("no record to attach to")?;
                    info!(%filename, bytes = content.len(), %record_id, "uploading attachment");
                    let file_id = format!("file-{}", content.len());
                    st.file_id = Some(file_id);
                    Ok(())
                }
            },
            &["create_record", "render_pdf"],
        )?;

        let s = state.clone();
        flow.add_task(
            "send_email",
            move || {
                let s = s.clone();
                async move {
                    let mut st = s.lock().await;
                    if st.file_id.is_none() {
                        bail!("nothing to attach");
                    }
                    st.email_sent = true;
                    Ok(())
                }
            },
            &["upload_pdf"],
        )?;

        Ok(flow)
    }
}

#[async_trait]
impl Pipeline for CertificatePipeline {
    fn name(&self) -> &str {
        "certificate"
    }

    fn description(&self) -> &str {
        "Generate, store and email a certificate of conformance for a shipment"
    }

    fn steps(&self) -> Vec<String> {
        STEPS.iter().map(|s| s.to_string()).collect()
    }

    async fn run(
        &self,
        ctx: RunContext,
        request: PipelineRequest,
    ) -> taskflow::Result<PipelineResult> {
        if request.shipment_id.trim().is_empty() {
            return Err(FlowError::Pipeline {
                pipeline: self.name().to_string(),
                message: "shipment_id is required".into(),
            });
        }

        let state = SharedState::default();
        let mut flow = self.build_flow(&request.shipment_id, &state)?;
        flow.validate()?;
        debug!("certificate flow:\n{}", flow.render_graph());
        if let Err(err) = flow.run_with_options(&ctx, &request.run_options()).await {
            return Ok(PipelineResult::failed(err));
        }

        let st = state.lock().await;
        Ok(PipelineResult::succeeded(
            st.record_id.clone(),
            st.file_id.clone(),
            st.email_sent,
        ))
    }
}

async fn fetch_shipment(shipment_id: &str) -> anyhow::Result<Vec<ShipmentItem>> {
    tokio::time::sleep(Duration::from_millis(20)).await;
    if shipment_id.starts_with('x') {
        bail!("shipment {shipment_id} not found");
    }
    Ok((1..=3)
        .map(|n| ShipmentItem {
            serial: format!("{shipment_id}-{n:03}"),
            product_id: "bearing-6204".to_string(),
            document_id: format!("COC-{shipment_id}"),
        })
        .collect())
}

fn prepare_record(
    shipment_id: &str,
    items: &[ShipmentItem],
) -> anyhow::Result<CertificationRecord> {
    let first = items.first().context("no shipment items available")?;
    let serials: Vec<&str> = items
        .iter()
        .map(|i| i.serial.as_str())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(CertificationRecord {
        identification: first.document_id.clone(),
        shipment_id: shipment_id.to_string(),
        covered_serials: serials.join("\n"),
        product_id: first.product_id.clone(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LogFormat::Text, None)?;

    let mut args = std::env::args().skip(1);
    let shipment_id = args.next().unwrap_or_else(|| "00340123450000000017".to_string());
    let request = PipelineRequest {
        shipment_id,
        skip_steps: args.collect(),
    };

    let config = FlowConfig::from_env()?;
    let mut registry = PipelineRegistry::new();
    registry.register(Arc::new(CertificatePipeline { config }))?;
    println!("{}", registry.list_with_descriptions());

    let ctx = config.context().timeout(Duration::from_secs(30));
    let result = registry.run("certificate", ctx, request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
