//! Memory-model lookup — a fixed-interface external collaborator.
//!
//! The on-disk memory stores live outside this system; routing only needs
//! to walk matched models for their attached agents and to mirror agent
//! status transitions back (fire-and-forget). Models and agents reference
//! each other by value (slugs and agent ids), never by in-process pointer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hb_domain::error::Result;
use hb_domain::AgentId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRef {
    pub agent_id: AgentId,
    pub status: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryModel {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentRef>,
}

#[async_trait::async_trait]
pub trait MemoryModels: Send + Sync {
    /// Fetch models whose names match (case-insensitive).
    async fn models_by_name(&self, names: &[String]) -> Result<Vec<MemoryModel>>;

    /// Attach an agent reference to a model.
    async fn attach_agent(&self, slug: &str, agent: AgentRef) -> Result<()>;

    /// Mirror an agent status change onto every model that references it.
    async fn set_agent_status(&self, agent_id: &AgentId, status: &str) -> Result<()>;
}

/// File-backed implementation: one JSON file per model under
/// `{state_dir}/memory-models/`.
pub struct FileMemoryModels {
    dir: PathBuf,
}

impl FileMemoryModels {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            dir: state_dir.join("memory-models"),
        }
    }

    fn load_all(&self) -> Vec<(PathBuf, MemoryModel)> {
        let mut models = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return models;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<MemoryModel>(&raw).ok())
            {
                Some(model) => models.push((path, model)),
                None => tracing::warn!(path = %path.display(), "skipping unreadable memory model"),
            }
        }
        models
    }

    fn save(&self, path: &std::path::Path, model: &MemoryModel) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(path, serde_json::to_string_pretty(model)?)?;
        Ok(())
    }

    fn path_for(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{slug}.json"))
    }
}

#[async_trait::async_trait]
impl MemoryModels for FileMemoryModels {
    async fn models_by_name(&self, names: &[String]) -> Result<Vec<MemoryModel>> {
        let wanted: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        Ok(self
            .load_all()
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| {
                wanted
                    .iter()
                    .any(|w| m.name.to_lowercase() == *w || m.slug.to_lowercase() == *w)
            })
            .collect())
    }

    async fn attach_agent(&self, slug: &str, agent: AgentRef) -> Result<()> {
        let path = self.path_for(slug);
        let mut model = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<MemoryModel>(&raw).ok())
            .unwrap_or_else(|| MemoryModel {
                slug: slug.to_string(),
                name: slug.to_string(),
                agents: Vec::new(),
            });
        model.agents.retain(|a| a.agent_id != agent.agent_id);
        model.agents.push(agent);
        self.save(&path, &model)
    }

    async fn set_agent_status(&self, agent_id: &AgentId, status: &str) -> Result<()> {
        for (path, mut model) in self.load_all() {
            let mut touched = false;
            for agent in &mut model.agents {
                if &agent.agent_id == agent_id {
                    agent.status = status.to_string();
                    touched = true;
                }
            }
            if touched {
                self.save(&path, &model)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_ref(id: &AgentId, status: &str) -> AgentRef {
        AgentRef {
            agent_id: id.clone(),
            status: status.into(),
            workspace: None,
            device_id: Some("dev-1".into()),
        }
    }

    #[tokio::test]
    async fn attach_and_lookup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryModels::new(dir.path());
        let agent = AgentId::generate();

        store
            .attach_agent("household", agent_ref(&agent, "running"))
            .await
            .unwrap();

        let models = store
            .models_by_name(&["Household".to_string()])
            .await
            .unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].agents.len(), 1);
        assert_eq!(models[0].agents[0].status, "running");

        let none = store.models_by_name(&["garage".to_string()]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn attach_replaces_existing_agent_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryModels::new(dir.path());
        let agent = AgentId::generate();

        store
            .attach_agent("work", agent_ref(&agent, "queued"))
            .await
            .unwrap();
        store
            .attach_agent("work", agent_ref(&agent, "running"))
            .await
            .unwrap();

        let models = store.models_by_name(&["work".to_string()]).await.unwrap();
        assert_eq!(models[0].agents.len(), 1);
        assert_eq!(models[0].agents[0].status, "running");
    }

    #[tokio::test]
    async fn status_mirrors_across_models() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryModels::new(dir.path());
        let agent = AgentId::generate();

        store
            .attach_agent("home", agent_ref(&agent, "running"))
            .await
            .unwrap();
        store
            .attach_agent("travel", agent_ref(&agent, "running"))
            .await
            .unwrap();

        store.set_agent_status(&agent, "completed").await.unwrap();

        for name in ["home", "travel"] {
            let models = store.models_by_name(&[name.to_string()]).await.unwrap();
            assert_eq!(models[0].agents[0].status, "completed");
        }
    }
}
