use serde::{Deserialize, Serialize};
use shipyard_core::{Condition, PersistableModel};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VariableValue {
    pub id: String,
    pub value: serde_json::Value,
    pub resource_selector: Option<Condition>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeploymentVariable {
    pub id: String,
    pub deployment_id: String,
    pub key: String,

    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub values: Vec<VariableValue>,
}

impl PersistableModel<DeploymentVariable> for DeploymentVariable {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}
