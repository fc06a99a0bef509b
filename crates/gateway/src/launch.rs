//! Builds agent options and the transport factory for a turn.

use std::sync::Arc;

use serde_json::json;

use sc_domain::config::{SandboxBackend, Settings};
use sc_domain::options::AgentOptions;
use sc_sandbox::docker::{DockerConfig, DockerSandboxTransport};
use sc_sandbox::k8s::K8sSandboxTransport;
use sc_sandbox::SandboxTransport;

use crate::registry::TransportFactory;

/// Options for a chat session: API credentials forwarded into the sandbox,
/// the preset system prompt, and conversation continuation.
pub fn build_options(settings: &Settings, continue_conversation: bool) -> AgentOptions {
    let mut options = AgentOptions {
        system_prompt: json!({ "type": "preset", "name": "claude_code" }),
        continue_conversation,
        ..AgentOptions::default()
    };

    if !settings.anthropic_api_key.is_empty() {
        options
            .env
            .insert("ANTHROPIC_API_KEY".into(), settings.anthropic_api_key.clone());
    }
    if !settings.anthropic_base_url.is_empty() {
        options
            .env
            .insert("ANTHROPIC_BASE_URL".into(), settings.anthropic_base_url.clone());
    }
    if !settings.model.is_empty() {
        options.model = Some(settings.model.clone());
    }

    options
}

/// A factory building the configured backend's transport against the
/// container or pod named `sandbox_name`.
pub fn transport_factory(
    settings: &Settings,
    sandbox_name: &str,
    options: AgentOptions,
) -> TransportFactory {
    let backend = settings.sandbox_backend;
    let sandbox = sandbox_name.to_string();
    Box::new(move || -> Arc<dyn SandboxTransport> {
        match backend {
            SandboxBackend::K8s => {
                Arc::new(K8sSandboxTransport::new(sandbox.clone(), options.clone(), None))
            }
            SandboxBackend::Docker => Arc::new(DockerSandboxTransport::new(
                sandbox.clone(),
                DockerConfig::default(),
                options.clone(),
                None,
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_forward_credentials_and_model() {
        let settings = Settings {
            anthropic_api_key: "sk-test".into(),
            anthropic_base_url: "https://proxy.internal".into(),
            model: "opus".into(),
            ..Settings::default()
        };
        let options = build_options(&settings, true);
        assert_eq!(options.env.get("ANTHROPIC_API_KEY").unwrap(), "sk-test");
        assert_eq!(options.env.get("ANTHROPIC_BASE_URL").unwrap(), "https://proxy.internal");
        assert_eq!(options.model.as_deref(), Some("opus"));
        assert!(options.continue_conversation);
        assert_eq!(options.system_prompt["name"], "claude_code");
    }

    #[test]
    fn options_skip_empty_settings() {
        let options = build_options(&Settings::default(), false);
        assert!(options.env.is_empty());
        assert!(options.model.is_none());
        assert!(!options.continue_conversation);
    }
}
