use serde::{Deserialize, Serialize};

/// A worker identity polling for work. Only used as a selection filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    pub id: String,
    pub name: String,
    pub executor_type: String,
    pub colony_name: String,
    #[serde(default)]
    pub location_name: String,
    #[serde(default)]
    pub approved: bool,
}

impl Executor {
    pub fn new(name: &str, executor_type: &str, colony_name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            executor_type: executor_type.into(),
            colony_name: colony_name.into(),
            location_name: String::new(),
            approved: true,
        }
    }

    pub fn at_location(mut self, location: &str) -> Self {
        self.location_name = location.into();
        self
    }
}
