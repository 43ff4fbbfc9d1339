//! Pipeline registration
//!
//! Source kinds map to constructors through a static table; the registry
//! holds one pipeline per configured source, built when a job starts.

use kgdb_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ClassificationSourcePipeline, CountSourcePipeline, PipelineContext, SourcePipeline};
use crate::config::SourceKind;

pub type PipelineConstructor = fn(PipelineContext) -> Result<Arc<dyn SourcePipeline>>;

fn build_count(ctx: PipelineContext) -> Result<Arc<dyn SourcePipeline>> {
    Ok(Arc::new(CountSourcePipeline::new(ctx)))
}

fn build_classification(ctx: PipelineContext) -> Result<Arc<dyn SourcePipeline>> {
    Ok(Arc::new(ClassificationSourcePipeline::new(ctx)?))
}

const CONSTRUCTORS: &[(SourceKind, PipelineConstructor)] = &[
    (SourceKind::Count, build_count),
    (SourceKind::Classification, build_classification),
];

pub fn constructor_for(kind: SourceKind) -> Option<PipelineConstructor> {
    CONSTRUCTORS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, constructor)| *constructor)
}

#[derive(Clone, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<dyn SourcePipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one pipeline per context using the constructor of its source kind
    pub fn from_contexts(contexts: impl IntoIterator<Item = PipelineContext>) -> Result<Self> {
        let mut registry = Self::new();
        for ctx in contexts {
            let kind = ctx.source.kind;
            let constructor = constructor_for(kind).ok_or_else(|| {
                Error::Config(format!("No pipeline for source kind {:?}", kind))
            })?;
            registry.register(constructor(ctx)?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, pipeline: Arc<dyn SourcePipeline>) -> Result<()> {
        let name = pipeline.name().to_string();
        if self.pipelines.contains_key(&name) {
            return Err(Error::Config(format!("Source {} registered twice", name)));
        }
        self.pipelines.insert(name, pipeline);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourcePipeline>> {
        self.pipelines.get(name).cloned()
    }

    /// Registered source names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<dyn SourcePipeline>> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
