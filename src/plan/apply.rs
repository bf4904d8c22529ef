//! Resource application through the dispatcher
//!
//! Targets without the `agent` feature first run the configured install task.
//! Those that fail it are reported as-is; the rest receive the catalog. Both
//! halves come back as one ResultSet.

use super::interpreter::ResourceApplier;
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::Result;
use crate::models::Action;
use crate::result::ResultSet;
use crate::target::Target;
use crate::tasks::TaskLoader;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub const AGENT_FEATURE: &str = "agent";

pub struct DispatchApplier {
    dispatcher: Arc<Dispatcher>,
    tasks: TaskLoader,
    install_task: Option<String>,
}

impl DispatchApplier {
    pub fn new(dispatcher: Arc<Dispatcher>, tasks: TaskLoader, install_task: Option<String>) -> Self {
        Self {
            dispatcher,
            tasks,
            install_task,
        }
    }

    /// Run the install task on targets missing the agent
    ///
    /// Returns the targets ready for apply, in input order, and the failed
    /// part of the install batch.
    async fn prepare(
        &self,
        targets: &[Target],
        options: &DispatchOptions,
    ) -> Result<(Vec<Target>, ResultSet)> {
        let missing: Vec<Target> = targets
            .iter()
            .filter(|t| !t.has_feature(AGENT_FEATURE))
            .cloned()
            .collect();

        let Some(install_task) = &self.install_task else {
            debug!("No install task configured; applying to all targets as-is");
            return Ok((targets.to_vec(), ResultSet::empty()));
        };
        if missing.is_empty() {
            return Ok((targets.to_vec(), ResultSet::empty()));
        }

        info!(
            "Installing the agent on {} targets with {}",
            missing.len(),
            install_task
        );
        let task = self.tasks.load(install_task)?;
        // Installation is preparation, not the change being previewed
        let install_options = DispatchOptions {
            noop: false,
            interpolate: false,
            save_rerun: false,
            description: Some(format!("install agent ({})", install_task)),
            ..options.clone()
        };
        let installed = self
            .dispatcher
            .dispatch(
                &Action::Task {
                    task,
                    params: Map::new(),
                },
                &missing,
                &install_options,
            )
            .await?;

        let failed = installed.error_set();
        let failed_names: HashSet<String> = failed.names().into_iter().collect();
        let ready = targets
            .iter()
            .filter(|t| !failed_names.contains(&t.name))
            .cloned()
            .collect();
        Ok((ready, failed))
    }
}

#[async_trait]
impl ResourceApplier for DispatchApplier {
    async fn apply(
        &self,
        resources: &[Value],
        targets: &[Target],
        options: &DispatchOptions,
    ) -> Result<ResultSet> {
        let (ready, install_failures) = self.prepare(targets, options).await?;
        let applied = if ready.is_empty() {
            ResultSet::empty()
        } else {
            self.dispatcher
                .dispatch(
                    &Action::Apply {
                        catalog: resources.to_vec(),
                    },
                    &ready,
                    options,
                )
                .await?
        };
        install_failures.concat(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::target::TransportKind;
    use crate::transports::TransportRegistry;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_task(root: &Path, name: &str, body: &str) {
        let dir = root.join("tasks");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.sh", name)), body).unwrap();
    }

    fn local_target(name: &str, agent: bool) -> Target {
        let mut target = Target::parse(&format!("local://{}", name), TransportKind::Ssh).unwrap();
        if agent {
            target.features.insert(AGENT_FEATURE.to_string());
        }
        target
    }

    fn applier(dir: &Path, install_task: Option<&str>) -> DispatchApplier {
        let mut project = ProjectConfig::default();
        // `echo` stands in for the apply agent
        project
            .local
            .insert("apply-command".to_string(), json!("echo"));
        let registry = TransportRegistry::new(&project, dir);
        DispatchApplier::new(
            Arc::new(Dispatcher::new(registry)),
            TaskLoader::new(dir),
            install_task.map(str::to_string),
        )
    }

    fn options() -> DispatchOptions {
        DispatchOptions {
            concurrency: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failed_install_is_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        write_task(dir.path(), "install_agent", "#!/bin/sh\nexit 1\n");
        let applier = applier(dir.path(), Some("install_agent"));

        let targets = vec![local_target("a", true), local_target("b", false)];
        let set = applier
            .apply(&[json!({"type": "file"})], &targets, &options())
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.names(), vec!["local://b", "local://a"]);
        assert!(!set.get("local://b").unwrap().ok());
        assert!(set.get("local://a").unwrap().ok());
    }

    #[tokio::test]
    async fn test_without_install_task_applies_everywhere() {
        let dir = TempDir::new().unwrap();
        let applier = applier(dir.path(), None);
        let targets = vec![local_target("a", false)];
        let set = applier.apply(&[], &targets, &options()).await.unwrap();
        assert!(set.ok());
        assert_eq!(set.names(), vec!["local://a"]);
    }
}
