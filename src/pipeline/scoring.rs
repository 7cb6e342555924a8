//! Pipeline evaluation.
//!
//! Scoring runs the pipeline over gold documents in eval mode, strips from
//! each document the annotations a component is about to predict,
//! times the components, and hands (prediction, gold) pairs to each
//! component's scorer. The traversal order is explicit configuration:
//! reverse order (the default) lets every component run on gold upstream
//! annotations rather than on upstream predictions.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;

use crate::component::cached::CacheScope;
use crate::component::Component;
use crate::core::document::Document;
use crate::core::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, TrainRestore};

/// Traversal order used during scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreOrder {
    /// Pipeline order; downstream components see upstream predictions.
    Forward,
    /// Reversed pipeline order; every component sees gold upstream
    /// annotations.
    #[default]
    Reverse,
}

/// The outcome of an evaluation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    /// Documents per second, counting component time only.
    pub speed: f64,
    /// Per-component metrics, keyed by component name.
    pub metrics: IndexMap<String, serde_json::Value>,
}

impl Pipeline {
    /// Evaluate the pipeline on gold documents.
    ///
    /// The input documents are never mutated; components run on deep
    /// copies. Training flags are forced off for the duration and restored
    /// afterwards, and each batch runs under its own cache scope.
    pub fn score(&self, docs: &[Document], order: ScoreOrder) -> Result<ScoreReport> {
        let pipes = self.trainable_pipes();
        let _restore = TrainRestore::eval(&pipes);

        let enabled: Vec<&(String, Component)> = self.enabled_components().collect();
        let ordered: Vec<&(String, Component)> = match order {
            ScoreOrder::Forward => enabled,
            ScoreOrder::Reverse => enabled.into_iter().rev().collect(),
        };

        let mut total = Duration::ZERO;
        let mut pairs: IndexMap<String, Vec<(Document, Document)>> = IndexMap::new();

        for chunk in docs.chunks(self.batch_size()) {
            let _scope = CacheScope::enter(&pipes);
            let golds: Vec<Document> = chunk.to_vec();
            let mut batch: Vec<Document> = chunk.to_vec();

            for (name, component) in &ordered {
                batch = batch
                    .into_iter()
                    .map(|doc| component.clean_gold_for_evaluation(doc))
                    .collect();
                let start = Instant::now();
                batch = Pipeline::run_component(name, component, batch)?;
                total += start.elapsed();

                if component.scorer().is_some() {
                    let entry = pairs.entry(name.clone()).or_default();
                    for (pred, gold) in batch.iter().zip(&golds) {
                        entry.push((pred.clone(), gold.clone()));
                    }
                }
            }
        }

        let mut metrics = IndexMap::new();
        for (name, component) in &ordered {
            let Some(scorer) = component.scorer() else {
                continue;
            };
            let component_pairs = pairs.get(name.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let value = scorer
                .score(component_pairs)
                .map_err(|err| PipelineError::Scoring {
                    message: format!("scorer for '{name}' failed: {err}"),
                })?;
            metrics.insert(name.clone(), value);
        }

        let speed = docs.len() as f64 / total.as_secs_f64().max(1e-9);
        Ok(ScoreReport { speed, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Feature;
    use crate::component::cached::TrainablePipe;
    use crate::component::trainable::{Scorer, TensorMap, TrainableOps};
    use std::sync::Arc;

    /// Trainable ops that append their tag to each document's text and
    /// score by reporting the text of the first prediction.
    struct Tagger {
        tag: &'static str,
        strip: Option<&'static str>,
    }

    struct FirstTextScorer;

    impl Scorer for FirstTextScorer {
        fn score(&self, pairs: &[(Document, Document)]) -> Result<serde_json::Value> {
            Ok(serde_json::json!({
                "pairs": pairs.len(),
                "first_pred": pairs.first().map(|(pred, _)| pred.text.clone()),
                "first_gold": pairs.first().map(|(_, gold)| gold.text.clone()),
            }))
        }
    }

    impl TrainableOps for Tagger {
        fn preprocess(&self, doc: &Document) -> Result<Feature> {
            Ok(Feature::Str(doc.text.clone()))
        }

        fn collate(&self, _column: &[Feature]) -> Result<TensorMap> {
            Ok(TensorMap::new())
        }

        fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
            Ok(inputs.clone())
        }

        fn postprocess(&self, docs: Vec<Document>, _outputs: &TensorMap) -> Result<Vec<Document>> {
            Ok(docs
                .into_iter()
                .map(|mut doc| {
                    doc.text.push_str(self.tag);
                    doc
                })
                .collect())
        }

        fn clean_gold_for_evaluation(&self, mut doc: Document) -> Document {
            if let Some(key) = self.strip {
                doc.remove_annotation(key);
            }
            doc
        }

        fn scorer(&self) -> Option<&dyn Scorer> {
            Some(&FirstTextScorer)
        }
    }

    fn tagger(name: &str, tag: &'static str) -> Component {
        Component::Trainable(Arc::new(TrainablePipe::new(
            name,
            Box::new(Tagger { tag, strip: None }),
        )))
    }

    #[test]
    fn test_reverse_order_runs_last_component_first() {
        let mut nlp = Pipeline::new("en");
        nlp.add_pipe("a", tagger("a", "a")).unwrap();
        nlp.add_pipe("b", tagger("b", "b")).unwrap();

        let docs = vec![Document::new("d0", "")];
        let report = nlp.score(&docs, ScoreOrder::Reverse).unwrap();
        // b ran first, so its prediction predates a's tag.
        assert_eq!(report.metrics["b"]["first_pred"], "b");
        assert_eq!(report.metrics["a"]["first_pred"], "ba");
    }

    #[test]
    fn test_forward_order_sees_upstream_predictions() {
        let mut nlp = Pipeline::new("en");
        nlp.add_pipe("a", tagger("a", "a")).unwrap();
        nlp.add_pipe("b", tagger("b", "b")).unwrap();

        let docs = vec![Document::new("d0", "")];
        let report = nlp.score(&docs, ScoreOrder::Forward).unwrap();
        assert_eq!(report.metrics["a"]["first_pred"], "a");
        assert_eq!(report.metrics["b"]["first_pred"], "ab");
    }

    #[test]
    fn test_golds_are_untouched() {
        let mut nlp = Pipeline::new("en");
        nlp.add_pipe("a", tagger("a", "a")).unwrap();

        let docs = vec![Document::new("d0", "gold")];
        let report = nlp.score(&docs, ScoreOrder::default()).unwrap();
        assert_eq!(report.metrics["a"]["first_gold"], "gold");
        assert_eq!(docs[0].text, "gold");
    }

    #[test]
    fn test_gold_annotations_cleaned_before_prediction() {
        let pipe = Arc::new(TrainablePipe::new(
            "a",
            Box::new(Tagger {
                tag: "a",
                strip: Some("label"),
            }),
        ));
        let mut nlp = Pipeline::new("en");
        nlp.add_pipe("a", Component::Trainable(pipe)).unwrap();

        let mut doc = Document::new("d0", "x");
        doc.annotate("label", serde_json::json!("PER"));
        let report = nlp.score(&[doc], ScoreOrder::default()).unwrap();
        assert_eq!(report.metrics["a"]["pairs"], 1);
    }

    #[test]
    fn test_training_flags_restored() {
        let pipe = Arc::new(TrainablePipe::new(
            "a",
            Box::new(Tagger {
                tag: "a",
                strip: None,
            }),
        ));
        pipe.set_training(true);
        let mut nlp = Pipeline::new("en");
        nlp.add_pipe("a", Component::Trainable(pipe.clone())).unwrap();

        nlp.score(&[Document::new("d0", "x")], ScoreOrder::default())
            .unwrap();
        assert!(pipe.is_training());
    }

    #[test]
    fn test_rule_component_with_scorer_is_evaluated() {
        use crate::component::RuleComponent;

        struct LabelScorer;

        impl Scorer for LabelScorer {
            fn score(&self, pairs: &[(Document, Document)]) -> Result<serde_json::Value> {
                Ok(serde_json::json!({
                    "pairs": pairs.len(),
                    "first_pred_label": pairs.first().and_then(|(pred, _)| pred.annotation("label").cloned()),
                    "first_gold_label": pairs.first().and_then(|(_, gold)| gold.annotation("label").cloned()),
                }))
            }
        }

        struct LabelRule;

        impl RuleComponent for LabelRule {
            fn apply(&self, mut doc: Document) -> Result<Document> {
                doc.annotate("label", serde_json::json!("RULE"));
                Ok(doc)
            }

            fn scorer(&self) -> Option<&dyn Scorer> {
                Some(&LabelScorer)
            }

            fn clean_gold_for_evaluation(&self, mut doc: Document) -> Document {
                doc.remove_annotation("label");
                doc
            }
        }

        let mut nlp = Pipeline::new("en");
        nlp.add_pipe("labeler", Component::Rule(Box::new(LabelRule)))
            .unwrap();

        let mut doc = Document::new("d0", "x");
        doc.annotate("label", serde_json::json!("GOLD"));
        let report = nlp.score(&[doc], ScoreOrder::default()).unwrap();

        // The rule predicted on a cleaned copy; the gold kept its label.
        assert_eq!(report.metrics["labeler"]["pairs"], 1);
        assert_eq!(report.metrics["labeler"]["first_pred_label"], "RULE");
        assert_eq!(report.metrics["labeler"]["first_gold_label"], "GOLD");
    }

    #[test]
    fn test_batched_scoring_collects_all_pairs() {
        let mut nlp = Pipeline::new("en");
        nlp.set_batch_size(2).unwrap();
        nlp.add_pipe("a", tagger("a", "a")).unwrap();

        let docs: Vec<Document> = (0..5)
            .map(|i| Document::new(format!("d{i}"), "x"))
            .collect();
        let report = nlp.score(&docs, ScoreOrder::default()).unwrap();
        assert_eq!(report.metrics["a"]["pairs"], 5);
        assert!(report.speed > 0.0);
    }
}
