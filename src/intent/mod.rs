//! Intent hooks
//!
//! A static registry populated at startup. Hooks can claim a transcript
//! outright (text match) or be invoked by the LLM through function calling;
//! either way they return the reply text to synthesise and may mutate the
//! session's system prompt and voice. Function schemas are plain data in
//! the OpenAI tools shape.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::roles::RoleStore;
use crate::session::Session;

pub trait IntentHook: Send + Sync {
    fn name(&self) -> &str;

    /// OpenAI-style tool schema handed to the LLM in function-calling mode
    fn schema(&self) -> Value;

    /// Claim a raw transcript before the LLM sees it. Returns parsed
    /// arguments when this hook wants the text.
    fn claim(&self, _text: &str) -> Option<Value> {
        None
    }

    /// Run the hook. Returns the reply text to speak.
    fn execute(&self, session: &Session, args: &Value) -> anyhow::Result<String>;
}

#[derive(Default)]
pub struct IntentRegistry {
    hooks: Vec<Arc<dyn IntentHook>>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard hook set for a server with a role store
    pub fn with_builtins(roles: Arc<RoleStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ChangeRoleHook { roles }));
        registry
    }

    pub fn register(&mut self, hook: Arc<dyn IntentHook>) {
        info!("registered intent hook {:?}", hook.name());
        self.hooks.push(hook);
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.hooks.iter().map(|h| h.schema()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IntentHook>> {
        self.hooks.iter().find(|h| h.name() == name).cloned()
    }

    /// First hook that claims the transcript, with its parsed arguments
    pub fn claim(&self, text: &str) -> Option<(Arc<dyn IntentHook>, Value)> {
        for hook in &self.hooks {
            if let Some(args) = hook.claim(text) {
                return Some((hook.clone(), args));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Switch persona: replaces the session's system prompt and, when the role
/// specifies one, its TTS voice, before the acknowledgement is synthesised.
pub struct ChangeRoleHook {
    roles: Arc<RoleStore>,
}

const CHANGE_ROLE_MARKERS: &[&str] = &["切换角色", "换个角色", "change role", "switch role"];

impl IntentHook for ChangeRoleHook {
    fn name(&self) -> &str {
        "change_role"
    }

    fn schema(&self) -> Value {
        let available: Vec<String> = self
            .roles
            .all()
            .into_values()
            .map(|role| role.name)
            .collect();
        json!({
            "type": "function",
            "function": {
                "name": "change_role",
                "description": format!(
                    "Switch the assistant persona. Available roles: [{}]",
                    available.join(", ")
                ),
                "parameters": {
                    "type": "object",
                    "properties": {
                        "role": {
                            "type": "string",
                            "description": "name of the role to switch to"
                        },
                        "role_name": {
                            "type": "string",
                            "description": "name the assistant should call itself"
                        }
                    },
                    "required": ["role", "role_name"]
                }
            }
        })
    }

    fn claim(&self, text: &str) -> Option<Value> {
        if !CHANGE_ROLE_MARKERS.iter().any(|m| text.contains(m)) {
            return None;
        }
        // the transcript must actually name a known role
        let target = self
            .roles
            .all()
            .into_values()
            .find(|role| text.contains(&role.name))?;
        Some(json!({ "role": target.name, "role_name": target.name }))
    }

    fn execute(&self, session: &Session, args: &Value) -> anyhow::Result<String> {
        let role_name = args
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("change_role missing 'role' argument"))?;
        let assistant_name = args
            .get("role_name")
            .and_then(|v| v.as_str())
            .unwrap_or(role_name);

        let Some((_, role)) = self.roles.get_by_name(role_name) else {
            return Ok(format!("抱歉，我不认识角色{role_name}"));
        };

        let prompt = role.prompt.replace("{{assistant_name}}", assistant_name);
        session.set_system_prompt(&prompt);
        if !role.voice.is_empty() {
            session.set_voice_id(&role.voice);
        }
        info!(session = %session.session_id, "role switched to {:?}", role.name);
        Ok(format!("切换角色成功，我是{assistant_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::roles::Role;
    use crate::transport::test_support::CapturingTransport;
    use tempfile::tempdir;

    fn registry_with_roles(dir: &tempfile::TempDir) -> (IntentRegistry, Arc<RoleStore>) {
        let store = Arc::new(RoleStore::load(
            &dir.path().join("roles.json"),
            "be helpful",
            "voice-a",
        ));
        store.add(
            "teacher",
            Role {
                name: "英语老师".to_string(),
                description: String::new(),
                prompt: "我是{{assistant_name}}，你的英语老师".to_string(),
                voice: "en-US-Jenny".to_string(),
                is_default: false,
            },
        );
        (IntentRegistry::with_builtins(store.clone()), store)
    }

    fn test_session() -> Arc<Session> {
        let (transport, _tx) = CapturingTransport::new();
        Session::new("dev-1", transport, &Config::default())
    }

    #[test]
    fn test_claim_requires_marker_and_known_role() {
        let dir = tempdir().unwrap();
        let (registry, _) = registry_with_roles(&dir);

        assert!(registry.claim("今天天气怎么样").is_none());
        assert!(registry.claim("切换角色到不存在的人").is_none());

        let (hook, args) = registry.claim("切换角色到英语老师").unwrap();
        assert_eq!(hook.name(), "change_role");
        assert_eq!(args["role"], "英语老师");
    }

    #[test]
    fn test_execute_updates_prompt_and_voice_before_reply() {
        let dir = tempdir().unwrap();
        let (registry, _) = registry_with_roles(&dir);
        let session = test_session();

        let (hook, args) = registry.claim("切换角色到英语老师").unwrap();
        let reply = hook.execute(&session, &args).unwrap();

        assert!(session.system_prompt().contains("英语老师"));
        assert!(!session.system_prompt().contains("{{assistant_name}}"));
        assert_eq!(session.voice_id(), "en-US-Jenny");
        assert!(reply.contains("切换角色成功"));
    }

    #[test]
    fn test_unknown_role_execute_is_graceful() {
        let dir = tempdir().unwrap();
        let (registry, _) = registry_with_roles(&dir);
        let session = test_session();
        let hook = registry.get("change_role").unwrap();
        let reply = hook
            .execute(&session, &json!({ "role": "法语老师", "role_name": "法语老师" }))
            .unwrap();
        assert!(reply.contains("法语老师"));
        // prompt untouched
        assert_eq!(session.system_prompt(), Config::default().prompt);
    }

    #[test]
    fn test_schema_lists_roles() {
        let dir = tempdir().unwrap();
        let (registry, _) = registry_with_roles(&dir);
        let schemas = registry.schemas();
        assert_eq!(schemas.len(), 1);
        let desc = schemas[0]["function"]["description"].as_str().unwrap();
        assert!(desc.contains("英语老师"));
    }
}
