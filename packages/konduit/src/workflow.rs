//! Workflow definitions and the in-process registry.
//!
//! A workflow is a linear sequence of elements; each element is a tagged
//! variant: a sequential step, a parallel block of steps, or a branch with
//! match arms. Handlers live on the step definitions and never leave the
//! process; a handler-free JSON descriptor of the shape is persisted to the
//! `workflows` table for bookkeeping.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{KonduitError, Result};
use crate::handler::StepHandler;
use crate::retry::RetryPolicy;

/// One step: a named handler plus its execution policy.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    /// Retry policy; the engine's configured default applies when absent.
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt wall-clock limit enforced by the worker's watchdog.
    pub timeout: Option<Duration>,
    handler: Arc<dyn StepHandler>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            retry_policy: None,
            timeout: None,
            handler,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handler(&self) -> Arc<dyn StepHandler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// One arm of a branch element.
#[derive(Debug, Clone)]
pub struct BranchArm {
    /// The selector string this arm matches.
    pub value: String,
    /// The arm's sub-sequence of sequential steps, dispatched one at a time.
    pub steps: Vec<StepDefinition>,
}

impl BranchArm {
    pub fn new(value: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            value: value.into(),
            steps,
        }
    }
}

/// One node of a workflow.
#[derive(Debug, Clone)]
pub enum WorkflowElement {
    Sequential(StepDefinition),
    Parallel { steps: Vec<StepDefinition> },
    Branch {
        arms: Vec<BranchArm>,
        fallback: Option<Vec<StepDefinition>>,
    },
}

/// Where a step name sits inside a definition.
#[derive(Debug)]
pub(crate) enum LocatedStep<'a> {
    Sequential {
        element_index: usize,
        step: &'a StepDefinition,
    },
    Parallel {
        element_index: usize,
        step: &'a StepDefinition,
    },
    Branch {
        element_index: usize,
        /// The arm the task's branch key selects.
        arm: &'a [StepDefinition],
        /// Position of the step within that arm.
        position: usize,
        step: &'a StepDefinition,
    },
}

impl LocatedStep<'_> {
    pub(crate) fn element_index(&self) -> usize {
        match self {
            LocatedStep::Sequential { element_index, .. }
            | LocatedStep::Parallel { element_index, .. }
            | LocatedStep::Branch { element_index, .. } => *element_index,
        }
    }

    pub(crate) fn step(&self) -> &StepDefinition {
        match self {
            LocatedStep::Sequential { step, .. }
            | LocatedStep::Parallel { step, .. }
            | LocatedStep::Branch { step, .. } => step,
        }
    }

    /// Whether this step is the first of its element.
    pub(crate) fn is_element_entry(&self) -> bool {
        match self {
            LocatedStep::Sequential { .. } | LocatedStep::Parallel { .. } => true,
            LocatedStep::Branch { position, .. } => *position == 0,
        }
    }
}

/// A named, versioned workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: i32,
    pub elements: Vec<WorkflowElement>,
    /// Execution deadline override; the engine default applies when absent.
    pub timeout: Option<Duration>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: i32) -> Self {
        Self {
            name: name.into(),
            version,
            elements: Vec::new(),
            timeout: None,
        }
    }

    /// Append a sequential step.
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.elements.push(WorkflowElement::Sequential(step));
        self
    }

    /// Append a parallel block; all steps become eligible simultaneously.
    pub fn parallel(mut self, steps: Vec<StepDefinition>) -> Self {
        self.elements.push(WorkflowElement::Parallel { steps });
        self
    }

    /// Append a branch on the previous element's output.
    pub fn branch(mut self, arms: Vec<BranchArm>, fallback: Option<Vec<StepDefinition>>) -> Self {
        self.elements.push(WorkflowElement::Branch { arms, fallback });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate structural constraints: at least one element, no empty
    /// blocks or arms, and step names unique across the whole definition
    /// (the advancer locates elements by step name).
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(KonduitError::InvalidDefinition {
                workflow: self.name.clone(),
                reason,
            })
        };

        if self.name.is_empty() {
            return fail("workflow name must not be empty".to_string());
        }
        if self.elements.is_empty() {
            return fail("workflow must declare at least one element".to_string());
        }

        let mut seen = HashSet::new();
        let mut check_step = |step: &StepDefinition| -> Result<()> {
            if step.name.is_empty() {
                return fail("step name must not be empty".to_string());
            }
            if !seen.insert(step.name.clone()) {
                return fail(format!("duplicate step name '{}'", step.name));
            }
            if let Some(policy) = &step.retry_policy {
                policy.validate()?;
            }
            Ok(())
        };

        for element in &self.elements {
            match element {
                WorkflowElement::Sequential(step) => check_step(step)?,
                WorkflowElement::Parallel { steps } => {
                    if steps.is_empty() {
                        return fail("parallel block must contain at least one step".to_string());
                    }
                    for step in steps {
                        check_step(step)?;
                    }
                }
                WorkflowElement::Branch { arms, fallback } => {
                    if arms.is_empty() {
                        return fail("branch must declare at least one arm".to_string());
                    }
                    let mut arm_values = HashSet::new();
                    for arm in arms {
                        if !arm_values.insert(arm.value.clone()) {
                            return fail(format!("duplicate branch arm value '{}'", arm.value));
                        }
                        if arm.steps.is_empty() {
                            return fail(format!("branch arm '{}' has no steps", arm.value));
                        }
                        for step in &arm.steps {
                            check_step(step)?;
                        }
                    }
                    if let Some(steps) = fallback {
                        if steps.is_empty() {
                            return fail("branch fallback arm has no steps".to_string());
                        }
                        for step in steps {
                            check_step(step)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the arm a branch key selects: the matching arm value, else
    /// the fallback. Mirrors the dispatcher's arm selection so a task's
    /// `branch_key` always locates the arm it was created under.
    pub(crate) fn branch_arm<'a>(
        arms: &'a [BranchArm],
        fallback: Option<&'a Vec<StepDefinition>>,
        branch_key: &str,
    ) -> Option<&'a [StepDefinition]> {
        arms.iter()
            .find(|arm| arm.value == branch_key)
            .map(|arm| arm.steps.as_slice())
            .or(fallback.map(|steps| steps.as_slice()))
    }

    /// Locate the step a task row refers to.
    pub(crate) fn locate(&self, step_name: &str, branch_key: Option<&str>) -> Option<LocatedStep<'_>> {
        for (element_index, element) in self.elements.iter().enumerate() {
            match element {
                WorkflowElement::Sequential(step) => {
                    if step.name == step_name {
                        return Some(LocatedStep::Sequential {
                            element_index,
                            step,
                        });
                    }
                }
                WorkflowElement::Parallel { steps } => {
                    if let Some(step) = steps.iter().find(|s| s.name == step_name) {
                        return Some(LocatedStep::Parallel {
                            element_index,
                            step,
                        });
                    }
                }
                WorkflowElement::Branch { arms, fallback } => {
                    let arm = match branch_key {
                        Some(key) => Self::branch_arm(arms, fallback.as_ref(), key),
                        None => None,
                    };
                    if let Some(steps) = arm {
                        if let Some(position) = steps.iter().position(|s| s.name == step_name) {
                            return Some(LocatedStep::Branch {
                                element_index,
                                arm: steps,
                                position,
                                step: &steps[position],
                            });
                        }
                    }
                }
            }
        }
        None
    }

    /// Handler-free JSON descriptor persisted to the `workflows` table.
    pub fn descriptor(&self) -> Value {
        let step_json = |step: &StepDefinition| {
            json!({
                "name": step.name,
                "retry_policy": step.retry_policy,
                "timeout_ms": step.timeout.map(|t| t.as_millis() as u64),
            })
        };
        let elements: Vec<Value> = self
            .elements
            .iter()
            .map(|element| match element {
                WorkflowElement::Sequential(step) => json!({
                    "type": "sequential",
                    "step": step_json(step),
                }),
                WorkflowElement::Parallel { steps } => json!({
                    "type": "parallel",
                    "steps": steps.iter().map(&step_json).collect::<Vec<_>>(),
                }),
                WorkflowElement::Branch { arms, fallback } => json!({
                    "type": "branch",
                    "arms": arms
                        .iter()
                        .map(|arm| json!({
                            "value": arm.value,
                            "steps": arm.steps.iter().map(&step_json).collect::<Vec<_>>(),
                        }))
                        .collect::<Vec<_>>(),
                    "fallback": fallback
                        .as_ref()
                        .map(|steps| steps.iter().map(&step_json).collect::<Vec<_>>()),
                }),
            })
            .collect();

        json!({
            "name": self.name,
            "version": self.version,
            "timeout_ms": self.timeout.map(|t| t.as_millis() as u64),
            "elements": elements,
        })
    }
}

/// In-process map from workflow name to its registered definition.
///
/// Registering a name again replaces the previous definition; the store
/// keeps one row per `(name, version)` for bookkeeping.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
