//! Flow definition and builder.

use serde::{Deserialize, Serialize};

use crate::schema::InputSchema;
use crate::step::{Step, StepBuilder};

/// A declarative flow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Short name of the flow
    #[serde(default)]
    pub summary: String,

    /// Description of what this flow does
    #[serde(default)]
    pub description: Option<String>,

    /// Top-level steps
    pub value: FlowValue,

    /// Schema of the flow input
    #[serde(default)]
    pub schema: Option<InputSchema>,
}

/// The step list of a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowValue {
    #[serde(default)]
    pub modules: Vec<Step>,
}

impl FlowDefinition {
    /// Create a new flow with a name.
    pub fn new(summary: &str) -> FlowBuilder {
        FlowBuilder::new(summary)
    }

    /// Top-level steps.
    pub fn modules(&self) -> &[Step] {
        &self.value.modules
    }
}

/// Builder for creating flows.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    flow: FlowDefinition,
}

impl FlowBuilder {
    /// Create a new flow builder.
    pub fn new(summary: &str) -> Self {
        Self {
            flow: FlowDefinition {
                summary: summary.to_string(),
                description: None,
                value: FlowValue::default(),
                schema: None,
            },
        }
    }

    /// Set the flow description.
    pub fn description(mut self, desc: &str) -> Self {
        self.flow.description = Some(desc.to_string());
        self
    }

    /// Set the input schema.
    pub fn schema(mut self, schema: InputSchema) -> Self {
        self.flow.schema = Some(schema);
        self
    }

    /// Add a step to the flow.
    pub fn add<S: Into<Step>>(mut self, step: S) -> Self {
        self.flow.value.modules.push(step.into());
        self
    }

    /// Add a step builder (convenience).
    pub fn step(self, step: StepBuilder) -> Self {
        self.add(step.build())
    }

    /// Build the flow definition.
    pub fn build(self) -> FlowDefinition {
        self.flow
    }
}

impl From<FlowBuilder> for FlowDefinition {
    fn from(builder: FlowBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_builder() {
        let flow = FlowDefinition::new("daily-report")
            .description("Download, parse and publish")
            .add(Step::leaf("download").with_param("bucket", "reports"))
            .step(Step::leaf("parse").with_ref("csv", "results.download"))
            .build();

        assert_eq!(flow.summary, "daily-report");
        assert_eq!(flow.modules().len(), 2);
        assert_eq!(flow.modules()[0].id, "download");
        assert_eq!(flow.modules()[1].id, "parse");
    }
}
