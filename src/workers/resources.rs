//! CPU and memory sizing for workloads.
//!
//! Standard tasks request what the project declares; the memory limit is the
//! request scaled by [`MEMORY_LIMIT_FACTOR`] and rounded up to whole GB. Control
//! tasks ([`CONTROL_TASKS`]) always get a small fixed profile so an oversized
//! project cannot starve the cluster of room for them.

use serde::{Deserialize, Serialize};

use super::models::Project;
use crate::errors::{WorkersError, WorkersResult};

/// Tasks that only query defaults, parse inputs or report a version.
pub const CONTROL_TASKS: &[&str] = &["defaults", "parse", "version"];

pub const MEMORY_LIMIT_FACTOR: f64 = 1.2;

const CONTROL_REQUESTS: Resources = Resources {
    cpu: 0.7,
    memory: 0.25,
};
const CONTROL_LIMITS: Resources = Resources {
    cpu: 1.0,
    memory: 0.7,
};

/// Which sizing policy applies to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskProfile {
    Standard,
    Control,
}

impl TaskProfile {
    pub fn for_task(task_name: &str) -> Self {
        if CONTROL_TASKS.contains(&task_name) {
            Self::Control
        } else {
            Self::Standard
        }
    }
}

/// CPU in cores, memory in GB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: f64,
}

impl Resources {
    /// Orchestrator quantity strings, e.g. `("4", "10G")`.
    pub fn quantities(&self) -> (String, String) {
        (format_quantity(self.cpu), format!("{}G", format_quantity(self.memory)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSizing {
    pub requests: Resources,
    pub limits: Resources,
}

/// Size a task of `task_name` for `project`.
pub fn size_for(project: &Project, task_name: &str) -> WorkersResult<ResourceSizing> {
    match TaskProfile::for_task(task_name) {
        TaskProfile::Control => Ok(ResourceSizing {
            requests: CONTROL_REQUESTS,
            limits: CONTROL_LIMITS,
        }),
        TaskProfile::Standard => {
            let cpu = declared(project, "cpu", project.cpu)?;
            let memory = declared(project, "memory", project.memory)?;
            Ok(ResourceSizing {
                requests: Resources { cpu, memory },
                limits: Resources {
                    cpu,
                    memory: memory_limit(memory),
                },
            })
        }
    }
}

/// `ceil(memory * 1.2)`, with float noise removed first so 10 GB maps to 12, not 13.
pub fn memory_limit(memory: f64) -> f64 {
    let scaled = (memory * MEMORY_LIMIT_FACTOR * 1e6).round() / 1e6;
    scaled.ceil()
}

fn declared(project: &Project, field: &str, value: Option<f64>) -> WorkersResult<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(v) => Err(WorkersError::InvalidResource(format!(
            "{} declares {} = {}",
            project.full_name(),
            field,
            v
        ))),
        None => Err(WorkersError::InvalidResource(format!(
            "{} does not declare {}",
            project.full_name(),
            field
        ))),
    }
}

fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.3}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
