use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_yaml::Value;
use tracing::debug;

use super::error::{ComponentError, ComponentResult};
use super::model::Component;

/// Resolves a component by platform and name, with `{{key}}` placeholders
/// already substituted from `params`.
#[async_trait]
pub trait ComponentStore: Send + Sync {
    async fn load(
        &self,
        platform: &str,
        name: &str,
        params: &BTreeMap<String, String>,
        version: Option<&str>,
    ) -> ComponentResult<Component>;
}

/// Reads `<root>/<platform>/<name>.yaml`, or `<name>@<version>.yaml` when a
/// version is requested.
#[derive(Debug, Clone)]
pub struct YamlComponentStore {
    root: PathBuf,
}

impl YamlComponentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, platform: &str, name: &str, version: Option<&str>) -> PathBuf {
        let file = match version {
            Some(version) => format!("{name}@{version}.yaml"),
            None => format!("{name}.yaml"),
        };
        self.root.join(platform).join(file)
    }
}

#[async_trait]
impl ComponentStore for YamlComponentStore {
    async fn load(
        &self,
        platform: &str,
        name: &str,
        params: &BTreeMap<String, String>,
        version: Option<&str>,
    ) -> ComponentResult<Component> {
        let path = self.file_for(platform, name, version);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ComponentError::NotFound {
                    platform: platform.to_string(),
                    name: name.to_string(),
                })
            }
            Err(source) => return Err(ComponentError::Io { source, path }),
        };
        let component = parse_component(&raw, params).map_err(|source| ComponentError::Parse {
            source,
            path: path.clone(),
        })?;
        component.validate()?;
        debug!(
            platform,
            component = %component.name,
            version = component.version.as_deref().unwrap_or("-"),
            "component loaded"
        );
        Ok(component)
    }
}

/// Parses YAML text, substituting placeholders in every string scalar before
/// the typed decode so numeric and boolean fields are never affected.
pub fn parse_component(
    raw: &str,
    params: &BTreeMap<String, String>,
) -> Result<Component, serde_yaml::Error> {
    let mut document: Value = serde_yaml::from_str(raw)?;
    substitute(&mut document, params);
    serde_yaml::from_value(document)
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex")
    })
}

/// Replaces `{{key}}` with `params[key]`. Unknown keys are left untouched.
pub fn render_template(input: &str, params: &BTreeMap<String, String>) -> String {
    placeholder()
        .replace_all(input, |caps: &Captures<'_>| {
            params
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn substitute(value: &mut Value, params: &BTreeMap<String, String>) {
    match value {
        Value::String(text) => {
            if text.contains("{{") {
                *text = render_template(text, params);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(|item| substitute(item, params)),
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, params);
            }
        }
        Value::Tagged(tagged) => substitute(&mut tagged.value, params),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::model::StepAction;

    const LOGIN: &str = r##"
name: login
platform: demo
steps:
  - action: navigate
    url: "https://{{ account.label }}.example/login"
  - action: fill
    selector: "#user"
    value: "{{account.username}}"
  - action: fill
    selector: "#pass"
    value: "{{account.password}}"
    timeout_ms: 5000
  - action: fill
    selector: "#note"
    value: "{{params.missing}}"
"##;

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("account.label".to_string(), "shop".to_string()),
            ("account.username".to_string(), "ops@shop".to_string()),
            ("account.password".to_string(), "hunter2".to_string()),
        ])
    }

    #[test]
    fn substitutes_known_placeholders_only() {
        let component = parse_component(LOGIN, &params()).unwrap();
        match &component.steps[0].action {
            StepAction::Navigate { url, .. } => assert_eq!(url, "https://shop.example/login"),
            other => panic!("unexpected {other:?}"),
        }
        match &component.steps[1].action {
            StepAction::Fill { value, .. } => assert_eq!(value, "ops@shop"),
            other => panic!("unexpected {other:?}"),
        }
        match &component.steps[3].action {
            StepAction::Fill { value, .. } => assert_eq!(value, "{{params.missing}}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(component.steps[2].timeout_ms, Some(5000));
    }

    #[tokio::test]
    async fn loads_versioned_file_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let platform_dir = dir.path().join("demo");
        std::fs::create_dir_all(&platform_dir).unwrap();
        std::fs::write(platform_dir.join("login.yaml"), LOGIN).unwrap();
        std::fs::write(
            platform_dir.join("login@2.0.yaml"),
            LOGIN.replace("name: login", "name: login\nversion: \"2.0\""),
        )
        .unwrap();

        let store = YamlComponentStore::new(dir.path());
        let latest = store.load("demo", "login", &params(), None).await.unwrap();
        assert!(latest.version.is_none());
        let pinned = store
            .load("demo", "login", &params(), Some("2.0"))
            .await
            .unwrap();
        assert_eq!(pinned.version.as_deref(), Some("2.0"));

        let err = store
            .load("demo", "orders_export", &params(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
