use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::browser::{ElementState, LoadState, Locator, SelectBy, SelectorKind};
use crate::config::RetrySection;

use super::error::{ComponentError, ComponentResult};

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    99
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorCandidate {
    #[serde(rename = "type", default)]
    pub kind: SelectorKind,
    pub value: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl SelectorCandidate {
    pub fn locator(&self) -> Locator {
        Locator::new(self.kind, self.value.clone())
    }
}

/// Where a targeted action applies: prioritised candidates and/or one legacy selector.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub selectors: Vec<SelectorCandidate>,
}

impl Target {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            selectors: Vec::new(),
        }
    }

    pub fn legacy(&self) -> Option<Locator> {
        self.selector.as_deref().map(Locator::parse)
    }

    /// Candidates in ascending priority; ties keep declaration order.
    pub fn candidates(&self) -> Vec<Locator> {
        let mut ordered: Vec<&SelectorCandidate> = self.selectors.iter().collect();
        ordered.sort_by_key(|candidate| candidate.priority);
        ordered.into_iter().map(SelectorCandidate::locator).collect()
    }

    pub fn primary(&self) -> Option<Locator> {
        self.candidates().into_iter().next().or_else(|| self.legacy())
    }

    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self
            .candidates()
            .iter()
            .map(ToString::to_string)
            .collect();
        if let Some(legacy) = &self.selector {
            parts.push(legacy.clone());
        }
        parts.join(" | ")
    }

    fn validate(&self) -> Result<(), String> {
        if self.selector.as_deref().map_or(true, |s| s.trim().is_empty()) && self.selectors.is_empty()
        {
            return Err("needs `selector` or `selectors`".into());
        }
        if self.selectors.iter().any(|candidate| candidate.value.trim().is_empty()) {
            return Err("selector candidate with empty value".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackAction {
    pub selector: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementExpectation {
    Exists,
    NotExists,
    #[default]
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFailure {
    #[default]
    Error,
    Skip,
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: LoadState,
    },
    Click {
        #[serde(flatten)]
        target: Target,
    },
    Fill {
        #[serde(flatten)]
        target: Target,
        value: String,
    },
    Select {
        #[serde(flatten)]
        target: Target,
        value: String,
        #[serde(default)]
        by: SelectBy,
    },
    Wait {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        state: ElementState,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        until: Option<LoadState>,
        #[serde(default = "default_true")]
        smart: bool,
    },
    Keyboard {
        key: String,
    },
    Hover {
        #[serde(flatten)]
        target: Target,
    },
    Scroll {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        delta_y: i64,
    },
    CallComponent {
        component: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    DismissPopups,
    CheckElement {
        #[serde(flatten)]
        target: Target,
        #[serde(default)]
        expect: ElementExpectation,
        #[serde(default)]
        on_fail: CheckFailure,
        #[serde(default)]
        message: Option<String>,
    },
    Screenshot {
        #[serde(default)]
        name: Option<String>,
    },
    AwaitDownload {
        #[serde(default)]
        selector: Option<String>,
    },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::Navigate { .. } => "navigate",
            StepAction::Click { .. } => "click",
            StepAction::Fill { .. } => "fill",
            StepAction::Select { .. } => "select",
            StepAction::Wait { .. } => "wait",
            StepAction::Keyboard { .. } => "keyboard",
            StepAction::Hover { .. } => "hover",
            StepAction::Scroll { .. } => "scroll",
            StepAction::CallComponent { .. } => "call_component",
            StepAction::DismissPopups => "dismiss_popups",
            StepAction::CheckElement { .. } => "check_element",
            StepAction::Screenshot { .. } => "screenshot",
            StepAction::AwaitDownload { .. } => "await_download",
        }
    }
}

/// Resolved form of a `wait` step.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitFor {
    Selector {
        locator: Locator,
        state: ElementState,
        smart: bool,
    },
    Duration(Duration),
    LoadState(LoadState),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry: Option<RetrySection>,
    #[serde(default)]
    pub fallbacks: Vec<FallbackAction>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Step {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            optional: false,
            timeout_ms: None,
            max_retries: None,
            retry: None,
            fallbacks: Vec::new(),
            description: None,
        }
    }

    pub fn label(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| self.action.name().to_string())
    }

    pub fn target(&self) -> Option<&Target> {
        match &self.action {
            StepAction::Click { target }
            | StepAction::Fill { target, .. }
            | StepAction::Select { target, .. }
            | StepAction::Hover { target }
            | StepAction::CheckElement { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Elements whose joint absence lets an optional step be skipped. Empty
    /// for actions that do not locate an element, and for checks that expect
    /// the element to be gone.
    pub fn probe_locators(&self) -> Vec<Locator> {
        match &self.action {
            StepAction::CheckElement {
                expect: ElementExpectation::NotExists | ElementExpectation::Hidden,
                ..
            } => Vec::new(),
            StepAction::Click { target }
            | StepAction::Fill { target, .. }
            | StepAction::Select { target, .. }
            | StepAction::CheckElement { target, .. } => {
                let mut locators = target.candidates();
                locators.extend(target.legacy());
                locators
            }
            StepAction::Wait {
                selector: Some(selector),
                state: ElementState::Attached | ElementState::Visible,
                ..
            } => vec![Locator::parse(selector)],
            _ => Vec::new(),
        }
    }

    pub fn wait_for(&self) -> Option<WaitFor> {
        let StepAction::Wait {
            selector,
            state,
            duration_ms,
            until,
            smart,
        } = &self.action
        else {
            return None;
        };
        if let Some(selector) = selector {
            Some(WaitFor::Selector {
                locator: Locator::parse(selector),
                state: *state,
                smart: *smart,
            })
        } else if let Some(ms) = duration_ms {
            Some(WaitFor::Duration(Duration::from_millis(*ms)))
        } else {
            until.map(WaitFor::LoadState)
        }
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(target) = self.target() {
            target.validate()?;
        }
        match &self.action {
            StepAction::Navigate { url, .. } if url.trim().is_empty() => {
                return Err("navigate needs a url".into());
            }
            StepAction::Wait {
                selector,
                duration_ms,
                until,
                ..
            } => {
                let conditions = [selector.is_some(), duration_ms.is_some(), until.is_some()]
                    .into_iter()
                    .filter(|set| *set)
                    .count();
                if conditions != 1 {
                    return Err(
                        "wait needs exactly one of `selector`, `duration_ms`, `until`".into(),
                    );
                }
            }
            StepAction::Keyboard { key } if key.is_empty() => {
                return Err("keyboard needs a key".into());
            }
            StepAction::CallComponent { component, .. } if component.trim().is_empty() => {
                return Err("call_component needs a component name".into());
            }
            _ => {}
        }
        if self
            .fallbacks
            .iter()
            .any(|fallback| fallback.selector.trim().is_empty())
        {
            return Err("fallback with empty selector".into());
        }
        if !self.fallbacks.is_empty() && self.target().is_none() {
            return Err(format!(
                "fallbacks are only supported on targeted actions, not {}",
                self.action.name()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionCheck {
    UrlContains { value: String },
    UrlMatches { pattern: String },
    ElementExists { selector: String },
    ElementVisible { selector: String },
    ElementTextContains { selector: String, text: String },
    PageContainsText { text: String },
    CustomScript { script: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessCriterion {
    #[serde(flatten)]
    pub check: CriterionCheck,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerAction {
    FailTask,
    ClosePopup,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorHandler {
    pub selector: String,
    pub action: HandlerAction,
    #[serde(default)]
    pub close_selector: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PopupHandling {
    pub check_before_steps: bool,
    pub check_after_steps: bool,
    pub check_each_step: bool,
}

impl Default for PopupHandling {
    fn default() -> Self {
        Self {
            check_before_steps: true,
            check_after_steps: false,
            check_each_step: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreCheckKind {
    UrlAccessible { url: String },
    ElementExists { selector: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreCheckFailure {
    #[default]
    #[serde(alias = "skip_task")]
    Skip,
    #[serde(alias = "fail_task")]
    Fail,
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreCheck {
    #[serde(flatten)]
    pub kind: PreCheckKind,
    #[serde(default)]
    pub on_failure: PreCheckFailure,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A named, versioned list of steps implementing one portal operation.
#[derive(Debug, Clone, Deserialize)]
pub struct Component {
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandler>,
    #[serde(default)]
    pub popup_handling: PopupHandling,
    #[serde(default)]
    pub pre_checks: Vec<PreCheck>,
    #[serde(default)]
    pub auto_detect_download: bool,
    #[serde(default = "default_true")]
    pub parallel_safe: bool,
}

impl Component {
    pub fn validate(&self) -> ComponentResult<()> {
        let invalid = |reason: String| ComponentError::Validation {
            component: format!("{}/{}", self.platform, self.name),
            reason,
        };
        if self.name.trim().is_empty() || self.platform.trim().is_empty() {
            return Err(invalid("name and platform are required".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("no steps".into()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate()
                .map_err(|reason| invalid(format!("step {} ({}): {reason}", index + 1, step.label())))?;
        }
        for criterion in &self.success_criteria {
            if let CriterionCheck::UrlMatches { pattern } = &criterion.check {
                Regex::new(pattern)
                    .map_err(|err| invalid(format!("bad url_matches pattern {pattern}: {err}")))?;
            }
        }
        Ok(())
    }

    pub fn has_download_step(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step.action, StepAction::AwaitDownload { .. }))
    }
}
