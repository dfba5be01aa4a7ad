use crate::engine::Experiment;
use crate::error::{Result, SweepError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an experiment from the extra command-line arguments.
pub type ExperimentFactory =
    Box<dyn Fn(&[String]) -> anyhow::Result<Arc<dyn Experiment>> + Send + Sync>;

struct Entry {
    summary: String,
    factory: ExperimentFactory,
}

pub struct ExperimentRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        ExperimentRegistry {
            entries: BTreeMap::new(),
        }
    }

    /// Registers `factory` under `id`, replacing any earlier registration.
    pub fn register<F>(&mut self, id: &str, summary: &str, factory: F)
    where
        F: Fn(&[String]) -> anyhow::Result<Arc<dyn Experiment>> + Send + Sync + 'static,
    {
        self.entries.insert(
            id.to_string(),
            Entry {
                summary: summary.to_string(),
                factory: Box::new(factory),
            },
        );
    }

    pub fn register_instance(&mut self, id: &str, summary: &str, experiment: Arc<dyn Experiment>) {
        self.register(id, summary, move |_| Ok(experiment.clone()));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.summary.clone()))
            .collect()
    }

    pub fn build(&self, id: &str, args: &[String]) -> Result<Arc<dyn Experiment>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| SweepError::UnregisteredExperiment {
                id: id.to_string(),
                registered: self.entries.keys().cloned().collect::<Vec<_>>().join(", "),
            })?;
        (entry.factory)(args).map_err(|e| SweepError::ExperimentSetup {
            id: id.to_string(),
            message: format!("{:#}", e),
        })
    }
}

impl Default for ExperimentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
