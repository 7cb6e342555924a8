//! Shared fixtures for integration tests.

// Each test binary uses a different subset of the fixtures.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use annopipe::prelude::*;

/// Shared handles onto an embedding component's stage call counters.
#[derive(Clone, Default)]
pub struct StageCounters {
    pub preprocess: Arc<AtomicUsize>,
    pub collate: Arc<AtomicUsize>,
    pub forward: Arc<AtomicUsize>,
}

impl StageCounters {
    pub fn preprocess_calls(&self) -> usize {
        self.preprocess.load(Ordering::Relaxed)
    }

    pub fn forward_calls(&self) -> usize {
        self.forward.load(Ordering::Relaxed)
    }
}

/// A counting embedding component with one learnable weight.
pub struct CountingEmbedding {
    pub counters: StageCounters,
    pub weight: Parameter,
}

impl CountingEmbedding {
    pub fn new() -> Self {
        Self {
            counters: StageCounters::default(),
            weight: Parameter::new(Tensor::zeros(vec![4])),
        }
    }
}

impl TrainableOps for CountingEmbedding {
    fn preprocess(&self, doc: &Document) -> Result<Feature> {
        self.counters.preprocess.fetch_add(1, Ordering::Relaxed);
        let mut payload = Feature::map();
        payload.insert(
            "tokens",
            Feature::Ints(doc.text.split_whitespace().map(|t| t.len() as i64).collect()),
        );
        Ok(payload)
    }

    fn collate(&self, column: &[Feature]) -> Result<TensorMap> {
        self.counters.collate.fetch_add(1, Ordering::Relaxed);
        let lens: Vec<f32> = column
            .iter()
            .map(|payload| match payload.get("tokens") {
                Some(Feature::Ints(tokens)) => tokens.len() as f32,
                _ => 0.0,
            })
            .collect();
        let mut out = TensorMap::new();
        out.insert("lens", Tensor::from_vec(vec![lens.len()], lens)?);
        Ok(out)
    }

    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        self.counters.forward.fetch_add(1, Ordering::Relaxed);
        Ok(inputs.clone())
    }

    fn named_parameters(&self) -> Vec<(String, Parameter)> {
        vec![("weight".to_string(), self.weight.clone())]
    }
}

/// A head component that delegates feature extraction to a shared
/// embedding pipe and writes one annotation per document.
pub struct Head {
    pub label: &'static str,
    pub embedding: Arc<TrainablePipe>,
    pub bias: Parameter,
}

impl Head {
    pub fn new(label: &'static str, embedding: Arc<TrainablePipe>) -> Self {
        Self {
            label,
            embedding,
            bias: Parameter::new(Tensor::zeros(vec![1])),
        }
    }
}

impl TrainableOps for Head {
    fn preprocess(&self, doc: &Document) -> Result<Feature> {
        // Goes through the shared pipe, so the embedding cache applies.
        let mut payload = Feature::map();
        payload.insert("embedding", self.embedding.preprocess(doc)?);
        Ok(payload)
    }

    fn collate(&self, column: &[Feature]) -> Result<TensorMap> {
        let embedded: Vec<Feature> = column
            .iter()
            .map(|payload| payload.get("embedding").cloned().unwrap_or(Feature::Null))
            .collect();
        self.embedding.collate(&embedded)
    }

    fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
        self.embedding.forward(inputs)
    }

    fn postprocess(&self, docs: Vec<Document>, _outputs: &TensorMap) -> Result<Vec<Document>> {
        Ok(docs
            .into_iter()
            .map(|mut doc| {
                doc.annotate(self.label, serde_json::json!(true));
                doc
            })
            .collect())
    }

    fn named_parameters(&self) -> Vec<(String, Parameter)> {
        vec![("bias".to_string(), self.bias.clone())]
    }

    fn subcomponents(&self) -> Vec<Arc<TrainablePipe>> {
        vec![self.embedding.clone()]
    }
}

/// A rule component appending a marker to the text.
pub fn marker_rule(marker: &'static str) -> Component {
    Component::Rule(Box::new(move |mut doc: Document| {
        doc.text.push_str(marker);
        Ok(doc)
    }))
}

/// Documents `d0..dn` with distinct texts.
pub fn docs(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document::new(format!("d{i}"), format!("text number {i}")))
        .collect()
}
