use std::path::{Component, Path, PathBuf};

use am_core::config::{AgentsConfig, Config};
use am_core::types::{AgentKind, WorkKey};

use crate::pty::default_shell;

/// Command line for one agent kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// Decides where a session runs and what it runs. This is the seam to the
/// worktree lifecycle: the session core only consumes its answers.
pub trait LaunchResolver: Send + Sync {
    fn working_directory(&self, work_key: &WorkKey, agent_kind: AgentKind) -> PathBuf;
    fn command(&self, agent_kind: AgentKind) -> LaunchSpec;
}

/// Resolves work keys under a worktree root and commands from `[agents]`.
#[derive(Debug, Clone)]
pub struct ConfigLaunchResolver {
    root: PathBuf,
    agents: AgentsConfig,
}

impl ConfigLaunchResolver {
    pub fn new(root: impl Into<PathBuf>, agents: AgentsConfig) -> Self {
        Self {
            root: root.into(),
            agents,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let root = config
            .worktrees
            .root
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(root, config.agents.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LaunchResolver for ConfigLaunchResolver {
    fn working_directory(&self, work_key: &WorkKey, _agent_kind: AgentKind) -> PathBuf {
        let relative = Path::new(work_key.as_str());
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return self.root.clone();
        }
        let candidate = self.root.join(relative);
        if candidate.is_dir() {
            candidate
        } else {
            self.root.clone()
        }
    }

    fn command(&self, agent_kind: AgentKind) -> LaunchSpec {
        let configured = self.agents.command_for(agent_kind);
        let command = if configured.command.trim().is_empty() {
            default_shell()
        } else {
            configured.command.clone()
        };
        LaunchSpec {
            command,
            args: configured.args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> WorkKey {
        WorkKey::new(s).unwrap()
    }

    #[test]
    fn existing_worktree_directory_is_used() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("feature-login")).unwrap();
        let resolver = ConfigLaunchResolver::new(root.path(), AgentsConfig::default());

        assert_eq!(
            resolver.working_directory(&key("feature-login"), AgentKind::Claude),
            root.path().join("feature-login")
        );
    }

    #[test]
    fn missing_worktree_falls_back_to_root() {
        let root = tempfile::tempdir().unwrap();
        let resolver = ConfigLaunchResolver::new(root.path(), AgentsConfig::default());
        assert_eq!(
            resolver.working_directory(&key("nope"), AgentKind::Shell),
            root.path()
        );
    }

    #[test]
    fn escaping_work_key_stays_in_root() {
        let root = tempfile::tempdir().unwrap();
        let resolver = ConfigLaunchResolver::new(root.path(), AgentsConfig::default());
        assert_eq!(
            resolver.working_directory(&key("../etc"), AgentKind::Shell),
            root.path()
        );
        assert_eq!(
            resolver.working_directory(&key("/etc"), AgentKind::Shell),
            root.path()
        );
    }

    #[test]
    fn agent_commands_come_from_config() {
        let mut agents = AgentsConfig::default();
        agents.codex.args = vec!["--full-auto".into()];
        let resolver = ConfigLaunchResolver::new("/tmp", agents);

        let spec = resolver.command(AgentKind::Codex);
        assert_eq!(spec.command, "codex");
        assert_eq!(spec.args, vec!["--full-auto".to_string()]);
    }

    #[test]
    fn empty_command_means_login_shell() {
        let resolver = ConfigLaunchResolver::new("/tmp", AgentsConfig::default());
        let spec = resolver.command(AgentKind::Shell);
        assert_eq!(spec.command, default_shell());
        assert_eq!(spec.args, vec!["-l".to_string()]);
    }
}
