//! Task graph builder.
//!
//! Validates a [`DagSchema`] and resolves, for every task, the parties that
//! run it, its upstream tasks and its runtime inputs per party.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dag::schema::{expand_parties, DagSchema, InputSource, PartyRef, TaskSpec};
use crate::error::DagError;

static TASK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]{0,127}$").expect("valid regex"));

/// A task input resolved for one party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedInput {
    Data {
        uri: String,
    },
    /// Filled with the producer's output location once the producer has run.
    TaskOutput {
        task: String,
        output: String,
        location: Option<String>,
    },
    Model {
        job_id: String,
        task: String,
        output: String,
    },
}

#[derive(Debug, Clone)]
struct TaskNode {
    upstream: Vec<String>,
    parties: Vec<PartyRef>,
}

/// Validated task graph of one job.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    schema: DagSchema,
    nodes: HashMap<String, TaskNode>,
    order: Vec<String>,
}

impl TaskGraph {
    /// Validate the schema and build the graph. Fails on cycles and on
    /// references to undeclared tasks, outputs or parties.
    pub fn build(schema: DagSchema) -> Result<Self, DagError> {
        if schema.tasks.is_empty() {
            return Err(DagError::Empty);
        }
        let job_parties = expand_parties(&schema.parties);
        if job_parties.is_empty() {
            return Err(DagError::NoParties);
        }

        let mut nodes = HashMap::with_capacity(schema.tasks.len());
        for (name, spec) in &schema.tasks {
            if !TASK_NAME.is_match(name) {
                return Err(DagError::InvalidTaskName(name.clone()));
            }
            let upstream = resolve_upstream(name, spec, &schema)?;
            let parties = match &spec.parties {
                Some(overrides) => {
                    let parties = expand_parties(overrides);
                    check_parties(name, &parties, &job_parties)?;
                    parties
                }
                None => job_parties.clone(),
            };
            for input in spec.inputs.values() {
                if let Some(filter) = &input.parties {
                    check_parties(name, &expand_parties(filter), &parties)?;
                }
            }
            nodes.insert(name.clone(), TaskNode { upstream, parties });
        }

        let order = topological_order(&schema, &nodes)?;
        Ok(Self {
            schema,
            nodes,
            order,
        })
    }

    pub fn schema(&self) -> &DagSchema {
        &self.schema
    }

    pub fn contains(&self, task: &str) -> bool {
        self.nodes.contains_key(task)
    }

    /// Deterministic topological order; ties broken by declaration order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Upstream tasks that must succeed before `task` may start.
    pub fn dependent_tasks_of(&self, task: &str) -> &[String] {
        self.nodes
            .get(task)
            .map(|n| n.upstream.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks that list `task` as upstream, in topological order.
    pub fn downstream_of(&self, task: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.dependent_tasks_of(name).iter().any(|u| u == task))
            .cloned()
            .collect()
    }

    /// `(role, party_id)` pairs that run `task`.
    pub fn task_parties(&self, task: &str) -> &[PartyRef] {
        self.nodes
            .get(task)
            .map(|n| n.parties.as_slice())
            .unwrap_or(&[])
    }

    /// Roles in which `party_id` runs `task`.
    pub fn runtime_parties_of(&self, task: &str, party_id: &str) -> Vec<String> {
        self.task_parties(task)
            .iter()
            .filter(|p| p.party_id == party_id)
            .map(|p| p.role.clone())
            .collect()
    }

    /// Tasks `party` takes part in, in topological order.
    pub fn tasks_for_party(&self, party: &PartyRef) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.task_parties(name).contains(party))
            .map(String::as_str)
            .collect()
    }

    pub fn task_spec(&self, task: &str) -> Option<&TaskSpec> {
        self.schema.tasks.get(task)
    }

    /// Inputs of `task` as seen by `party`. Task-output locations are left
    /// empty; they are filled at start time from the producer's record.
    pub fn runtime_inputs(&self, task: &str, party: &PartyRef) -> IndexMap<String, ResolvedInput> {
        let Some(spec) = self.schema.tasks.get(task) else {
            return IndexMap::new();
        };
        spec.inputs
            .iter()
            .filter(|(_, input)| match &input.parties {
                Some(filter) => expand_parties(filter).contains(party),
                None => true,
            })
            .map(|(key, input)| {
                let resolved = match &input.source {
                    InputSource::Data { uri } => ResolvedInput::Data { uri: uri.clone() },
                    InputSource::TaskOutput { task, output } => ResolvedInput::TaskOutput {
                        task: task.clone(),
                        output: output.clone(),
                        location: None,
                    },
                    InputSource::Model {
                        job_id,
                        task,
                        output,
                    } => ResolvedInput::Model {
                        job_id: job_id.clone(),
                        task: task.clone(),
                        output: output.clone(),
                    },
                };
                (key.clone(), resolved)
            })
            .collect()
    }
}

fn resolve_upstream(name: &str, spec: &TaskSpec, schema: &DagSchema) -> Result<Vec<String>, DagError> {
    let mut upstream: Vec<String> = Vec::new();
    for dep in &spec.dependent_tasks {
        if !schema.tasks.contains_key(dep) {
            return Err(DagError::UnknownTask {
                task: name.to_string(),
                upstream: dep.clone(),
            });
        }
        if !upstream.contains(dep) {
            upstream.push(dep.clone());
        }
    }
    for input in spec.inputs.values() {
        if let InputSource::TaskOutput { task, output } = &input.source {
            let producer = schema.tasks.get(task).ok_or_else(|| DagError::UnknownTask {
                task: name.to_string(),
                upstream: task.clone(),
            })?;
            if !producer.outputs.contains(output) {
                return Err(DagError::UnknownOutput {
                    task: name.to_string(),
                    upstream: task.clone(),
                    output: output.clone(),
                });
            }
            if !upstream.contains(task) {
                upstream.push(task.clone());
            }
        }
    }
    Ok(upstream)
}

fn check_parties(task: &str, parties: &[PartyRef], allowed: &[PartyRef]) -> Result<(), DagError> {
    match parties.iter().find(|p| !allowed.contains(p)) {
        Some(p) => Err(DagError::UnknownParty {
            task: task.to_string(),
            role: p.role.clone(),
            party_id: p.party_id.clone(),
        }),
        None => Ok(()),
    }
}

/// Kahn's algorithm, always taking the earliest-declared ready task.
fn topological_order(
    schema: &DagSchema,
    nodes: &HashMap<String, TaskNode>,
) -> Result<Vec<String>, DagError> {
    let names: Vec<&String> = schema.tasks.keys().collect();
    let index: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; names.len()];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    for (i, name) in names.iter().enumerate() {
        for up in &nodes[name.as_str()].upstream {
            let u = index[up.as_str()];
            in_degree[i] += 1;
            downstream[u].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..names.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(next) = ready.pop_first() {
        order.push(names[next].clone());
        for &d in &downstream[next] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() != names.len() {
        let tasks = names
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, name)| (*name).clone())
            .collect();
        return Err(DagError::Cycle { tasks });
    }
    Ok(order)
}
