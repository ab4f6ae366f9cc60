//! Queue Registry
//!
//! An ordered list of (condition, queue name) pairs. The first descriptor
//! whose condition holds for a request wins.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::error::{AutotestError, Result};
use crate::types::{RunRequest, UserType};

/// Predicate over the routing attributes of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueCondition {
    /// Matches every request
    Always,
    /// Request belongs to a batch run
    Batch,
    UserType { user_type: UserType },
    All { conditions: Vec<QueueCondition> },
    Any { conditions: Vec<QueueCondition> },
    Not { condition: Box<QueueCondition> },
}

impl QueueCondition {
    pub fn matches(&self, request: &RunRequest) -> bool {
        match self {
            QueueCondition::Always => true,
            QueueCondition::Batch => request.batch_id.is_some(),
            QueueCondition::UserType { user_type } => request.user_type == *user_type,
            QueueCondition::All { conditions } => conditions.iter().all(|c| c.matches(request)),
            QueueCondition::Any { conditions } => conditions.iter().any(|c| c.matches(request)),
            QueueCondition::Not { condition } => !condition.matches(request),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub condition: QueueCondition,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>, condition: QueueCondition) -> Self {
        Self {
            name: name.into(),
            condition,
        }
    }
}

/// Built-in routing: batch runs, then single admin runs, then student runs.
pub fn default_descriptors() -> Vec<QueueDescriptor> {
    vec![
        QueueDescriptor::new("batch", QueueCondition::Batch),
        QueueDescriptor::new(
            "single",
            QueueCondition::All {
                conditions: vec![
                    QueueCondition::Not {
                        condition: Box::new(QueueCondition::Batch),
                    },
                    QueueCondition::UserType {
                        user_type: UserType::Admin,
                    },
                ],
            },
        ),
        QueueDescriptor::new(
            "student",
            QueueCondition::UserType {
                user_type: UserType::Student,
            },
        ),
    ]
}

/// Immutable, validated routing table
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    descriptors: Vec<QueueDescriptor>,
}

impl QueueRegistry {
    pub fn new(descriptors: Vec<QueueDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(AutotestError::Config(
                "at least one queue must be configured".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for descriptor in &descriptors {
            if descriptor.name.is_empty() {
                return Err(AutotestError::Config("queue names must not be empty".to_string()));
            }
            if !names.insert(descriptor.name.as_str()) {
                return Err(AutotestError::Config(format!(
                    "queue '{}' is configured more than once",
                    descriptor.name
                )));
            }
        }
        Ok(Self { descriptors })
    }

    /// Name of the first queue whose condition holds for `request`.
    pub fn select(&self, request: &RunRequest) -> Result<&str> {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.condition.matches(request))
            .ok_or(AutotestError::InvalidQueue)?;
        debug!(
            queue = %descriptor.name,
            user_type = %request.user_type,
            batch = request.batch_id.is_some(),
            "Routed request"
        );
        Ok(&descriptor.name)
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    pub fn descriptors(&self) -> &[QueueDescriptor] {
        &self.descriptors
    }
}
