//! Registry of running pipelines and live graph mutation.
//!
//! A `LivePipeline` keeps its own metadata graph (user stages and the
//! edges between them) next to the actual stage links. Auto-inserted
//! converters never appear in the metadata; splicing a user stage in or
//! out re-runs `connect` so bridging stays correct. Every mutation is
//! synchronous and leaves the pipeline unchanged on failure.

use crate::builder::{BuiltPipeline, PipelineBuilder, PipelineRun};
use crate::error::{PipelineError, Result};
use crate::format::AudioFormat;
use crate::stage::{StageRef, connect, lock};
use crate::stages::Control;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Created,
    Running,
    Stopped,
}

/// Metadata for one user stage in a live pipeline.
pub struct StageEntry {
    pub stage: StageRef,
    pub kind: String,
    pub params: Vec<(String, String)>,
    pub control: Option<Control>,
}

struct Graph {
    stages: HashMap<String, StageEntry>,
    // Invariant: both endpoints of every edge exist in `stages`.
    edges: Vec<(String, String)>,
}

#[derive(Serialize)]
pub struct PipelineSummary {
    pub id: String,
    pub dsl: String,
    pub state: PipelineState,
    pub stage_count: usize,
}

#[derive(Serialize)]
pub struct StageDetail {
    pub id: String,
    pub kind: String,
    pub params: BTreeMap<String, String>,
    pub input_format: Option<AudioFormat>,
    pub output_format: Option<AudioFormat>,
    pub cancelled: bool,
    pub mutable_param: Option<MutableParam>,
}

#[derive(Serialize)]
pub struct MutableParam {
    pub name: &'static str,
    pub value: f64,
}

#[derive(Serialize)]
pub struct PipelineDetail {
    pub id: String,
    pub dsl: String,
    pub state: PipelineState,
    pub stages: Vec<StageDetail>,
    pub edges: Vec<(String, String)>,
}

/// A registered pipeline with a mutable stage graph.
pub struct LivePipeline {
    id: String,
    dsl: String,
    created_at: SystemTime,
    state: Mutex<PipelineState>,
    run: Arc<PipelineRun>,
    graph: Mutex<Graph>,
}

impl LivePipeline {
    pub fn new(id: impl Into<String>, dsl: impl Into<String>, built: BuiltPipeline) -> Arc<Self> {
        let mut stages = HashMap::new();
        let mut edges = Vec::new();
        let mut prev: Option<String> = None;
        for element in built.elements {
            let stage_id = element.stage.id().to_string();
            if let Some(up) = prev.take() {
                edges.push((up, stage_id.clone()));
            }
            prev = Some(stage_id.clone());
            stages.insert(
                stage_id,
                StageEntry {
                    stage: element.stage,
                    kind: element.kind,
                    params: element.params,
                    control: element.control,
                },
            );
        }
        Arc::new(Self {
            id: id.into(),
            dsl: dsl.into(),
            created_at: SystemTime::now(),
            state: Mutex::new(PipelineState::Created),
            run: built.run,
            graph: Mutex::new(Graph { stages, edges }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dsl(&self) -> &str {
        &self.dsl
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    pub fn run(&self) -> &Arc<PipelineRun> {
        &self.run
    }

    /// Drives the pipeline on a worker thread until exhaustion.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        *lock(&self.state) = PipelineState::Running;
        let this = self.clone();
        thread::spawn(move || {
            this.run.run();
            *lock(&this.state) = PipelineState::Stopped;
            info!(pipeline = %this.id, "pipeline finished");
        })
    }

    /// Cancels the run and marks the pipeline stopped.
    pub fn stop(&self) {
        self.run.cancel();
        *lock(&self.state) = PipelineState::Stopped;
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            id: self.id.clone(),
            dsl: self.dsl.clone(),
            state: self.state(),
            stage_count: lock(&self.graph).stages.len(),
        }
    }

    pub fn detail(&self) -> PipelineDetail {
        let graph = lock(&self.graph);
        // Walk the edges so stages come out in chain order.
        let mut order: Vec<String> = Vec::with_capacity(graph.stages.len());
        let mut cur = graph
            .stages
            .keys()
            .find(|id| !graph.edges.iter().any(|(_, down)| down == *id))
            .cloned();
        while let Some(id) = cur {
            cur = graph
                .edges
                .iter()
                .find(|(up, _)| *up == id)
                .map(|(_, down)| down.clone());
            order.push(id);
        }
        let stages = order
            .iter()
            .filter_map(|id| graph.stages.get(id))
            .map(|entry| StageDetail {
                id: entry.stage.id().to_string(),
                kind: entry.kind.clone(),
                params: entry.params.iter().cloned().collect(),
                input_format: entry.stage.input_format(),
                output_format: entry.stage.output_format(),
                cancelled: entry.stage.is_cancelled(),
                mutable_param: entry.control.as_ref().map(|c| {
                    let (name, value) = c.current();
                    MutableParam { name, value }
                }),
            })
            .collect();
        PipelineDetail {
            id: self.id.clone(),
            dsl: self.dsl.clone(),
            state: self.state(),
            stages,
            edges: graph.edges.clone(),
        }
    }

    /// Updates a hot-updatable parameter on a running stage.
    pub fn patch_stage(&self, stage_id: &str, param: &str, value: f64) -> Result<()> {
        let graph = lock(&self.graph);
        let entry = graph
            .stages
            .get(stage_id)
            .ok_or_else(|| PipelineError::StageNotFound {
                id: stage_id.to_string(),
            })?;
        let applied = entry
            .control
            .as_ref()
            .is_some_and(|c| c.apply(param, value));
        if !applied {
            return Err(PipelineError::UnsupportedPatch {
                kind: entry.kind.clone(),
            });
        }
        debug!(pipeline = %self.id, stage = stage_id, param, value, "stage patched");
        Ok(())
    }

    /// Removes a mid-chain stage, splicing its neighbors together.
    ///
    /// The stream continues through the splice on the next chunk; the
    /// removed stage is flagged cancelled without propagating.
    pub fn delete_stage(&self, stage_id: &str) -> Result<()> {
        let mut graph = lock(&self.graph);
        let (up_id, down_id) = neighbors(&graph, stage_id)?;
        let up = graph.stages[&up_id].stage.clone();
        let down = graph.stages[&down_id].stage.clone();
        let victim = graph.stages[stage_id].stage.clone();

        connect(&up, &down);
        victim.mark_cancelled();
        victim.clear_links();

        graph
            .edges
            .retain(|(a, b)| a != stage_id && b != stage_id);
        graph.edges.push((up_id, down_id));
        graph.stages.remove(stage_id);
        info!(pipeline = %self.id, stage = stage_id, "stage deleted");
        Ok(())
    }

    /// Replaces a mid-chain stage with a freshly built element.
    pub fn replace_stage(
        &self,
        stage_id: &str,
        element_dsl: &str,
        builder: &PipelineBuilder,
    ) -> Result<()> {
        let mut graph = lock(&self.graph);
        let (up_id, down_id) = neighbors(&graph, stage_id)?;
        let up = graph.stages[&up_id].stage.clone();
        let down = graph.stages[&down_id].stage.clone();
        let upstream_format = up
            .output_format()
            .ok_or_else(|| PipelineError::build("upstream stage declares no format"))?;

        // Build before touching anything so a bad element changes nothing.
        let element = builder.build_element(element_dsl, upstream_format)?;
        let new_id = element.stage.id().to_string();

        connect(&up, &element.stage);
        connect(&element.stage, &down);
        let victim = graph.stages[stage_id].stage.clone();
        victim.mark_cancelled();
        victim.clear_links();

        graph
            .edges
            .retain(|(a, b)| a != stage_id && b != stage_id);
        graph.edges.push((up_id, new_id.clone()));
        graph.edges.push((new_id.clone(), down_id));
        graph.stages.remove(stage_id);
        graph.stages.insert(
            new_id.clone(),
            StageEntry {
                stage: element.stage,
                kind: element.kind,
                params: element.params,
                control: element.control,
            },
        );
        info!(pipeline = %self.id, old = stage_id, new = %new_id, "stage replaced");
        Ok(())
    }
}

/// Finds the single upstream and downstream user-stage ids; errors if
/// the stage is missing or sits at an end of the chain.
fn neighbors(graph: &Graph, stage_id: &str) -> Result<(String, String)> {
    if !graph.stages.contains_key(stage_id) {
        return Err(PipelineError::StageNotFound {
            id: stage_id.to_string(),
        });
    }
    let up = graph
        .edges
        .iter()
        .find(|(_, down)| down == stage_id)
        .map(|(up, _)| up.clone());
    let down = graph
        .edges
        .iter()
        .find(|(up, _)| up == stage_id)
        .map(|(_, down)| down.clone());
    match (up, down) {
        (Some(up), Some(down)) => Ok((up, down)),
        _ => Err(PipelineError::StageNotRemovable {
            id: stage_id.to_string(),
        }),
    }
}

/// Explicit, injected registry of live pipelines. No ambient global.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: Mutex<HashMap<String, Arc<LivePipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline under its id, replacing (and cancelling)
    /// any previous pipeline with the same id.
    pub fn register(&self, pipeline: Arc<LivePipeline>) {
        let previous = lock(&self.pipelines).insert(pipeline.id().to_string(), pipeline);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<LivePipeline>> {
        lock(&self.pipelines)
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::PipelineNotFound { id: id.to_string() })
    }

    /// Removes and cancels a pipeline.
    pub fn remove(&self, id: &str) -> Result<()> {
        let pipeline = lock(&self.pipelines)
            .remove(id)
            .ok_or_else(|| PipelineError::PipelineNotFound { id: id.to_string() })?;
        pipeline.stop();
        Ok(())
    }

    pub fn list(&self) -> Vec<PipelineSummary> {
        let mut summaries: Vec<PipelineSummary> = lock(&self.pipelines)
            .values()
            .map(|p| p.summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}
