//! The Directive: a bundle's YAML manifest.
//!
//! A Directive names an application (`identifier` + `version`), lists the
//! Runnables shipped in the bundle, and composes them into handlers and
//! schedules. The runtime uses it to map module names to FQFNs; handlers
//! and schedules are validated but not executed here.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use runnr_common::BundleError;
use runnr_host::CapabilityConfig;

use super::fqfn::{Fqfn, NAMESPACE_DEFAULT};

/// Handler input types.
pub const INPUT_TYPE_REQUEST: &str = "request";
pub const INPUT_TYPE_STREAM: &str = "stream";

/// Bundle manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub identifier: String,

    /// Application version, a semver with an optional leading `v`.
    #[serde(alias = "appVersion")]
    pub version: String,

    #[serde(default)]
    pub runnables: Vec<RunnableEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<Handler>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleEntry>,

    /// Capability configuration for every Runnable in the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilityConfig>,
}

/// A Runnable shipped in the bundle as `<name>.wasm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableEntry {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub lang: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl RunnableEntry {
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            lang: lang.into(),
            api_version: None,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// `namespace#name`.
    pub fn namespaced(&self) -> String {
        format!("{}#{}", self.namespace, self.name)
    }
}

fn default_namespace() -> String {
    NAMESPACE_DEFAULT.to_string()
}

/// Maps an input to a pipeline of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    #[serde(flatten)]
    pub input: Input,

    #[serde(default)]
    pub steps: Vec<Executable>,

    /// State key returned as the handler's response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    #[serde(rename = "type")]
    pub input_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub resource: String,
}

/// One step: a single function, a group run concurrently, or a `forEach`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executable {
    #[serde(flatten)]
    pub call: CallableFn,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<CallableFn>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEach>,
}

impl Executable {
    pub fn is_fn(&self) -> bool {
        !self.call.fn_name.is_empty() && self.group.is_empty() && self.for_each.is_none()
    }

    pub fn is_group(&self) -> bool {
        self.call.fn_name.is_empty() && !self.group.is_empty() && self.for_each.is_none()
    }

    pub fn is_for_each(&self) -> bool {
        self.call.fn_name.is_empty() && self.group.is_empty() && self.for_each.is_some()
    }
}

/// A function call with its state key, arguments and error handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallableFn {
    #[serde(rename = "fn", default, skip_serializing_if = "String::is_empty")]
    pub fn_name: String,

    /// State key for the result; the function name when absent.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Argument name to state key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_err: Option<OnErr>,
}

impl CallableFn {
    pub fn new(fn_name: impl Into<String>) -> Self {
        Self {
            fn_name: fn_name.into(),
            ..Self::default()
        }
    }

    /// The state key this call writes.
    pub fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.fn_name)
    }
}

/// Error handling for a call: per-code, `any`, or `other` with `return`/`continue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnErr {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub code: BTreeMap<i32, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEach {
    #[serde(rename = "in", default)]
    pub input: String,

    #[serde(rename = "fn", default)]
    pub fn_name: String,

    #[serde(rename = "as", default)]
    pub alias: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_err: Option<OnErr>,
}

/// A recurring pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub every: ScheduleEvery,

    /// Initial state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, String>,

    #[serde(default)]
    pub steps: Vec<Executable>,
}

impl ScheduleEntry {
    /// Total period of the schedule.
    pub fn number_of_seconds(&self) -> u64 {
        let every = &self.every;
        every.seconds + every.minutes * 60 + every.hours * 60 * 60 + every.days * 60 * 60 * 24
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvery {
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub days: u64,
}

impl ScheduleEvery {
    fn is_zero(self) -> bool {
        self.seconds == 0 && self.minutes == 0 && self.hours == 0 && self.days == 0
    }
}

impl Directive {
    /// Parse a Directive from YAML. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::DirectiveParse`] for malformed YAML.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, BundleError> {
        serde_yaml::from_slice(bytes).map_err(|e| BundleError::DirectiveParse {
            reason: e.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`BundleError::DirectiveParse`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, BundleError> {
        serde_yaml::to_string(self).map_err(|e| BundleError::DirectiveParse {
            reason: e.to_string(),
        })
    }

    /// The Runnable `name` refers to.
    ///
    /// Bare names only match the default namespace. A name carrying a
    /// version only matches this Directive's version.
    pub fn find_runnable(&self, name: &str) -> Option<&RunnableEntry> {
        let fqfn = Fqfn::parse(name);
        if !fqfn.version.is_empty() && fqfn.version != self.version {
            return None;
        }

        self.runnables
            .iter()
            .find(|r| r.name == fqfn.name && r.namespace == fqfn.namespace)
    }

    /// The FQFN of the Runnable `name` refers to.
    pub fn fqfn_for(&self, name: &str) -> Option<String> {
        self.find_runnable(name)
            .map(|r| Fqfn::from_parts(&r.namespace, &r.name, &self.version))
    }

    /// Check the Directive, collecting every problem found.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Invalid`] listing all problems.
    pub fn validate(&self) -> Result<(), BundleError> {
        let mut problems = Vec::new();

        if self.identifier.is_empty() {
            problems.push("identifier is missing".to_string());
        }
        if semver::Version::parse(self.version.trim_start_matches('v')).is_err() {
            problems.push(format!("version '{}' is not a valid semantic version", self.version));
        }

        self.validate_runnables(&mut problems);

        for (i, handler) in self.handlers.iter().enumerate() {
            self.validate_handler(i, handler, &mut problems);
        }

        for (i, schedule) in self.schedules.iter().enumerate() {
            if schedule.name.is_empty() {
                problems.push(format!("schedule at position {i} has no name"));
                continue;
            }
            if schedule.steps.is_empty() {
                problems.push(format!("schedule {} missing steps", schedule.name));
                continue;
            }
            if schedule.every.is_zero() {
                problems.push(format!("schedule {} has no 'every' values", schedule.name));
            }

            let state = schedule.state.keys().cloned().collect();
            self.validate_steps("schedule", &schedule.name, &schedule.steps, state, &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BundleError::Invalid { problems })
        }
    }

    fn validate_runnables(&self, problems: &mut Vec<String>) {
        if self.runnables.is_empty() {
            problems.push("no runnables listed".to_string());
        }

        let mut seen = HashSet::new();
        for (i, runnable) in self.runnables.iter().enumerate() {
            if runnable.name.is_empty() {
                problems.push(format!("runnable at position {i} missing name"));
                continue;
            }
            if runnable.namespace.is_empty() {
                problems.push(format!("runnable at position {i} missing namespace"));
                continue;
            }
            if !seen.insert(runnable.namespaced()) {
                problems.push(format!("duplicate runnable {} found", runnable.namespaced()));
            }
        }
    }

    fn validate_handler(&self, i: usize, handler: &Handler, problems: &mut Vec<String>) {
        let input = &handler.input;
        let resource = &input.resource;

        match input.input_type.as_str() {
            INPUT_TYPE_REQUEST => {
                if input.method.is_empty() {
                    problems.push(format!(
                        "handler for resource {resource} has type 'request' but no method"
                    ));
                }
                if !resource.starts_with('/') {
                    problems.push(format!(
                        "handler resource must begin with a leading slash: {resource}"
                    ));
                }
            }
            INPUT_TYPE_STREAM => {}
            _ => problems.push(format!(
                "handler for resource {resource} has invalid type, must be 'request' or 'stream'"
            )),
        }

        if resource.is_empty() {
            problems.push(format!("handler at position {i} missing resource"));
        }

        let Some(last) = handler.steps.last() else {
            problems.push(format!("handler for resource {resource} missing steps"));
            return;
        };

        let name = format!("{} {}", input.method, resource);
        let state = self.validate_steps("handler", &name, &handler.steps, HashSet::new(), problems);

        match &handler.response {
            None if last.is_group() => problems.push(format!(
                "handler for {name} has a group as last step but no 'response' field"
            )),
            Some(response) if !state.contains(response) => problems.push(format!(
                "handler for {name} lists response state key that does not exist: {response}"
            )),
            _ => {}
        }
    }

    /// Validate `steps` in order and return the state keys they produce.
    fn validate_steps(
        &self,
        kind: &str,
        name: &str,
        steps: &[Executable],
        mut state: HashSet<String>,
        problems: &mut Vec<String>,
    ) -> HashSet<String> {
        for (j, step) in steps.iter().enumerate() {
            let calls: Vec<CallableFn> = if step.is_fn() {
                vec![step.call.clone()]
            } else if step.is_group() {
                step.group.clone()
            } else if let Some(for_each) = step.for_each.as_ref().filter(|_| step.is_for_each()) {
                if for_each.input.is_empty() {
                    problems.push(format!("forEach at step {j} for {kind} {name} is missing 'in'"));
                }
                if for_each.alias.is_empty() {
                    problems.push(format!("forEach at step {j} for {kind} {name} is missing 'as'"));
                }
                vec![CallableFn {
                    fn_name: for_each.fn_name.clone(),
                    alias: Some(for_each.alias.clone()),
                    with: BTreeMap::new(),
                    on_err: for_each.on_err.clone(),
                }]
            } else {
                problems.push(format!(
                    "step at position {j} for {kind} {name} isn't an fn, group, or forEach"
                ));
                continue;
            };

            let mut produced = Vec::with_capacity(calls.len());
            for call in &calls {
                if self.find_runnable(&call.fn_name).is_none() {
                    problems.push(format!(
                        "{kind} for {name} lists fn at step {j} that does not exist: {} (did you forget a namespace?)",
                        call.fn_name
                    ));
                }

                for key in call.with.values() {
                    if !state.contains(key) {
                        problems.push(format!(
                            "{kind} for {name} has 'with' value at step {j} referencing a key that is not yet in state: {key}"
                        ));
                    }
                }

                if let Some(on_err) = &call.on_err {
                    validate_on_err(on_err, &format!("{kind} for {name} at step {j}"), problems);
                }

                produced.push(call.key().to_string());
            }
            state.extend(produced);
        }

        state
    }
}

fn validate_on_err(on_err: &OnErr, context: &str, problems: &mut Vec<String>) {
    let valid = |directive: &str| matches!(directive, "return" | "continue");

    match (&on_err.any, on_err.code.is_empty()) {
        (Some(_), false) => problems.push(format!(
            "{context} has 'onErr.any' while specific codes are listed, use 'other' instead"
        )),
        (Some(any), true) if !valid(any) => problems.push(format!(
            "{context} has an invalid 'onErr.any' directive: {any}"
        )),
        _ => {}
    }

    match (&on_err.other, on_err.code.is_empty()) {
        (Some(_), true) => problems.push(format!(
            "{context} has 'onErr.other' while no codes are listed, use 'any' instead"
        )),
        (Some(other), false) if !valid(other) => problems.push(format!(
            "{context} has an invalid 'onErr.other' directive: {other}"
        )),
        _ => {}
    }

    for (code, directive) in &on_err.code {
        if !valid(directive) {
            problems.push(format!(
                "{context} has an invalid 'onErr.code' directive for code {code}: {directive}"
            ));
        }
    }
}
