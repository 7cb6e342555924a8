//! Shared-tensor records.
//!
//! A parameter shared by reference across components must land on disk
//! exactly once and come back as one allocation. Parameters are grouped by
//! allocation: each allocation carries every dotted path (alias) that
//! reaches it, and allocations are bucketed into one file per owner set,
//! named by the sorted component names joined with `+`. Inside a file, each
//! record is keyed by its sorted aliases joined with `+` and holds a single
//! tensor.
//!
//! Loading is the inverse and deliberately non-strict: a record is loaded
//! through the first alias that resolves to a live parameter, and records
//! resolving to nothing are logged and skipped so that architecture drift
//! degrades to a warning instead of a failure.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use crate::component::cached::TrainablePipe;
use crate::core::error::Result;
use crate::core::tensor::{Parameter, Tensor};

fn all_aliases(pipes: &[(String, Arc<TrainablePipe>)]) -> Vec<(String, Parameter)> {
    let mut aliases = Vec::new();
    for (name, pipe) in pipes {
        for (path, param) in pipe.named_parameters() {
            aliases.push((format!("{name}.{path}"), param));
        }
    }
    aliases
}

fn owner_of(alias: &str) -> &str {
    alias.split('.').next().unwrap_or(alias)
}

/// Write one record per parameter allocation, bucketed into one file per
/// owner set.
pub fn save(dir: &Path, pipes: &[(String, Arc<TrainablePipe>)]) -> Result<()> {
    // allocation -> (sorted aliases, value)
    let mut groups: IndexMap<usize, (BTreeSet<String>, Parameter)> = IndexMap::new();
    for (alias, param) in all_aliases(pipes) {
        groups
            .entry(param.allocation_id())
            .or_insert_with(|| (BTreeSet::new(), param.clone()))
            .0
            .insert(alias);
    }

    // owner set -> record key -> tensor
    let mut files: BTreeMap<BTreeSet<String>, IndexMap<String, Tensor>> = BTreeMap::new();
    for (aliases, param) in groups.values() {
        let owners: BTreeSet<String> = aliases
            .iter()
            .map(|alias| owner_of(alias).to_string())
            .collect();
        let key = aliases.iter().cloned().collect::<Vec<_>>().join("+");
        files.entry(owners).or_default().insert(key, param.tensor());
    }

    for (owners, records) in &files {
        let name = owners.iter().cloned().collect::<Vec<_>>().join("+");
        let path = dir.join(format!("{name}.json"));
        std::fs::write(path, serde_json::to_string(records)?)?;
    }
    Ok(())
}

/// Load every record found in the directory into the matching parameters,
/// in place, preserving sharing.
pub fn load(dir: &Path, pipes: &[(String, Arc<TrainablePipe>)]) -> Result<()> {
    let params: HashMap<String, Parameter> = all_aliases(pipes).into_iter().collect();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        let records: IndexMap<String, Tensor> = serde_json::from_str(&text)?;

        for (key, tensor) in records {
            let target = key.split('+').find_map(|alias| params.get(alias));
            match target {
                // One load per record suffices: every other alias of the
                // record points at the same allocation.
                Some(param) => param.load(tensor)?,
                None => warn!(record = %key, "tensor record matches no parameter, skipping"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Feature;
    use crate::component::trainable::{TensorMap, TrainableOps};
    use crate::core::document::Document;

    struct Linear {
        weight: Parameter,
    }

    impl TrainableOps for Linear {
        fn preprocess(&self, _doc: &Document) -> Result<Feature> {
            Ok(Feature::Null)
        }

        fn collate(&self, _column: &[Feature]) -> Result<TensorMap> {
            Ok(TensorMap::new())
        }

        fn forward(&self, inputs: &TensorMap) -> Result<TensorMap> {
            Ok(inputs.clone())
        }

        fn named_parameters(&self) -> Vec<(String, Parameter)> {
            vec![("weight".to_string(), self.weight.clone())]
        }
    }

    fn pipe_with(name: &str, weight: Parameter) -> (String, Arc<TrainablePipe>) {
        (
            name.to_string(),
            Arc::new(TrainablePipe::new(name, Box::new(Linear { weight }))),
        )
    }

    #[test]
    fn test_shared_allocation_saved_once() {
        let shared = Parameter::new(Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap());
        let pipes = vec![pipe_with("a", shared.clone()), pipe_with("b", shared)];

        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &pipes).unwrap();

        let files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["a+b.json".to_string()]);

        let text = std::fs::read_to_string(dir.path().join("a+b.json")).unwrap();
        let records: IndexMap<String, Tensor> = serde_json::from_str(&text).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records.contains_key("a.weight+b.weight"));
    }

    #[test]
    fn test_unshared_allocations_saved_separately() {
        let pipes = vec![
            pipe_with("a", Parameter::new(Tensor::zeros(vec![2]))),
            pipe_with("b", Parameter::new(Tensor::zeros(vec![2]))),
        ];

        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &pipes).unwrap();

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["a.json".to_string(), "b.json".to_string()]);
    }

    #[test]
    fn test_load_restores_sharing() {
        let shared = Parameter::new(Tensor::from_vec(vec![2], vec![3.0, 4.0]).unwrap());
        let saved = vec![pipe_with("a", shared.clone()), pipe_with("b", shared)];

        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &saved).unwrap();

        // A fresh pipeline with its own shared allocation, zeroed.
        let fresh_shared = Parameter::new(Tensor::zeros(vec![2]));
        let fresh = vec![
            pipe_with("a", fresh_shared.clone()),
            pipe_with("b", fresh_shared.clone()),
        ];
        load(dir.path(), &fresh).unwrap();

        assert_eq!(fresh_shared.tensor().data, vec![3.0, 4.0]);
        // Still one allocation after loading.
        let a_params = fresh[0].1.named_parameters();
        let b_params = fresh[1].1.named_parameters();
        assert!(a_params[0].1.shares_allocation_with(&b_params[0].1));
    }

    #[test]
    fn test_pipe_level_load_reports_unexpected_keys() {
        let (_, pipe) = pipe_with("a", Parameter::new(Tensor::zeros(vec![2])));
        let mut entries = IndexMap::new();
        entries.insert(
            "weight".to_string(),
            Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap(),
        );
        entries.insert("ghost".to_string(), Tensor::zeros(vec![2]));

        let unexpected = pipe.load_named_parameters(&entries).unwrap();
        assert_eq!(unexpected, vec!["ghost".to_string()]);
        assert_eq!(pipe.named_parameters()[0].1.tensor().data, vec![1.0, 2.0]);
    }

    #[test]
    fn test_unknown_record_skipped() {
        let saved = vec![pipe_with("a", Parameter::new(Tensor::zeros(vec![2])))];
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &saved).unwrap();

        // Loading into a pipeline without 'a' warns and succeeds.
        let other = vec![pipe_with("b", Parameter::new(Tensor::zeros(vec![2])))];
        load(dir.path(), &other).unwrap();
        assert_eq!(other[0].1.named_parameters()[0].1.tensor().data, vec![0.0, 0.0]);
    }
}
