//! YAML flow parser.

use std::path::Path;

use anyhow::{Context, Result};

use crate::{FlowDefinition, FlowGraph};

/// Parse a flow definition from a YAML (or JSON) string.
pub fn parse_definition(yaml: &str) -> Result<FlowDefinition> {
    serde_yaml::from_str(yaml).context("Failed to parse flow YAML")
}

/// Parse and validate a flow.
///
/// # Example
///
/// ```rust
/// use flowgraph::parse_yaml;
///
/// let yaml = r#"
/// summary: my-flow
/// value:
///   modules:
///     - id: download
///       value:
///         type: rawscript
///         input_transforms:
///           bucket:
///             type: static
///             value: reports
///     - id: parse
///       value:
///         type: rawscript
///         input_transforms:
///           csv:
///             type: javascript
///             expr: results.download
/// "#;
///
/// let graph = parse_yaml(yaml).unwrap();
/// assert_eq!(graph.name(), "my-flow");
/// assert_eq!(graph.step_ids().len(), 2);
/// ```
pub fn parse_yaml(yaml: &str) -> Result<FlowGraph> {
    let definition = parse_definition(yaml)?;
    let graph = FlowGraph::build(&definition).context("Invalid flow definition")?;
    Ok(graph)
}

/// Load, parse and validate a flow file.
///
/// ```rust,no_run
/// use flowgraph::yaml::load_file;
///
/// let graph = load_file("flows/market_report.flow.yaml")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_file(path: impl AsRef<Path>) -> Result<FlowGraph> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow file: {}", path.display()))?;

    parse_yaml(&content).with_context(|| format!("Failed to parse flow file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefinitionError;

    #[test]
    fn test_parse_simple_flow() {
        let yaml = r#"
summary: test-flow
description: A test flow
value:
  modules:
    - id: fetch
      value:
        type: rawscript
        language: python3
        input_transforms:
          limit:
            type: static
            value: 10
"#;

        let graph = parse_yaml(yaml).unwrap();
        assert_eq!(graph.name(), "test-flow");
        assert_eq!(graph.step_ids(), ["fetch"]);
    }

    #[test]
    fn test_parse_json_flow() {
        let json = r#"{"summary": "j", "value": {"modules": [
            {"id": "a", "value": {"type": "script", "path": "f/lib/a"}}
        ]}}"#;

        let graph = parse_yaml(json).unwrap();
        assert_eq!(graph.body_keys(), vec!["f/lib/a"]);
    }

    #[test]
    fn test_invalid_reference_reported() {
        let yaml = r#"
summary: bad
value:
  modules:
    - id: render
      value:
        type: rawscript
        input_transforms:
          data:
            type: javascript
            expr: results.parse
    - id: parse
      value:
        type: rawscript
"#;

        let err = parse_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Invalid flow definition"));
        assert!(matches!(
            err.downcast_ref::<DefinitionError>(),
            Some(DefinitionError::OutOfOrderReference { .. })
        ));
    }

    #[test]
    fn test_unknown_step_type() {
        let yaml = r#"
summary: bad
value:
  modules:
    - id: loop
      value:
        type: forloopflow
"#;

        let err = parse_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Failed to parse flow YAML"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_file("does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read flow file"));
    }
}
