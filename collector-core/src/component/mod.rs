mod error;
mod model;
mod store;
mod version;

pub use error::{ComponentError, ComponentResult};
pub use model::{
    CheckFailure, Component, CriterionCheck, ElementExpectation, ErrorHandler, FallbackAction,
    HandlerAction, PopupHandling, PreCheck, PreCheckFailure, PreCheckKind, SelectorCandidate,
    Step, StepAction, SuccessCriterion, Target, WaitFor,
};
pub use store::{parse_component, render_template, ComponentStore, YamlComponentStore};
pub use version::{DefaultVersion, UsageStats, UsageStatsSelector, VersionSelector};
