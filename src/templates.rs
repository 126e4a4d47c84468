use std::collections::HashMap;

use thiserror::Error;

pub const BIRTHDAY_ALERT: &str = "birthday_alert";
pub const BIRTHDAY_ALERT_ARG: &str = "birthday_alert_arg";
pub const WELCOME: &str = "welcome";
pub const GROUP_CONFIRMATION: &str = "group_confirmation";

/// A pre-approved provider template and what it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSpec {
    pub provider_id: String,
    pub language: String,
    pub parameter_count: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("template {0} is already registered")]
    Duplicate(String),

    #[error("template {0} has an empty provider id")]
    EmptyProviderId(String),
}

#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, TemplateSpec>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The templates approved for the production WhatsApp account.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(BIRTHDAY_ALERT, "birthday_alert", "en", 2)?;
        registry.register(BIRTHDAY_ALERT_ARG, "birthday_alert_arg", "es_AR", 2)?;
        registry.register(WELCOME, "welcome_member", "en", 2)?;
        registry.register(GROUP_CONFIRMATION, "group_confirmation", "en", 1)?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: &str,
        provider_id: &str,
        language: &str,
        parameter_count: usize,
    ) -> Result<(), RegistryError> {
        if provider_id.trim().is_empty() {
            return Err(RegistryError::EmptyProviderId(name.to_owned()));
        }
        if self.templates.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }

        self.templates.insert(
            name.to_owned(),
            TemplateSpec {
                provider_id: provider_id.to_owned(),
                language: language.to_owned(),
                parameter_count,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&TemplateSpec> {
        self.templates.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates() {
        let registry = TemplateRegistry::builtin().unwrap();

        let alert = registry.resolve(BIRTHDAY_ALERT).unwrap();
        assert_eq!(alert.parameter_count, 2);
        assert_eq!(registry.resolve(BIRTHDAY_ALERT_ARG).unwrap().language, "es_AR");
        assert_eq!(registry.resolve(WELCOME).unwrap().provider_id, "welcome_member");
        assert_eq!(registry.resolve(GROUP_CONFIRMATION).unwrap().parameter_count, 1);
        assert!(registry.resolve("birthday").is_none());
    }

    #[test]
    fn test_register_rejects_bad_entries() {
        let mut registry = TemplateRegistry::new();
        registry.register("welcome", "welcome_member", "en", 2).unwrap();

        assert_eq!(
            registry.register("welcome", "welcome_v2", "en", 2),
            Err(RegistryError::Duplicate("welcome".to_owned()))
        );
        assert_eq!(
            registry.register("reminder", "  ", "en", 0),
            Err(RegistryError::EmptyProviderId("reminder".to_owned()))
        );
        assert_eq!(registry.resolve("welcome").unwrap().provider_id, "welcome_member");
    }
}
