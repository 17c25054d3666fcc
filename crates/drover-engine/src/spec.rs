use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// External input describing one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub cloud_instance: CloudInstance,
    /// Pipeline-global staging: directories and files created before
    /// any step runs, in the given order.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Scratch directories for temporary volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// The VM backing this pipeline. Only `pool_name` is supplied by the
/// caller; `id` and `ip` are filled in during setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudInstance {
    pub pool_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default)]
    pub data: Vec<u8>,
    pub mode: u32,
    #[serde(default)]
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default)]
    pub empty_dir: Option<EmptyDir>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyDir {
    pub id: String,
    #[serde(default)]
    pub mode: u32,
}

/// One command to execute on the VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: String,
    pub working_dir: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    /// Script files staged to the VM before the command runs.
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    pub env: String,
    pub data: String,
}

/// Result of one executed step. A non-zero exit is a result, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub exit_code: i32,
    pub exited: bool,
    pub oom_killed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_spec_deserializes() {
        let spec: PipelineSpec = serde_json::from_str(
            r#"{"cloud_instance": {"pool_name": "ubuntu"}}"#,
        )
        .unwrap();
        assert_eq!(spec.cloud_instance.pool_name, "ubuntu");
        assert!(spec.cloud_instance.id.is_empty());
        assert!(spec.files.is_empty());
        assert!(spec.steps.is_empty());
    }

    #[test]
    fn test_step_deserializes_with_defaults() {
        let step: Step = serde_json::from_str(
            r#"{"working_dir": "/tmp/w", "command": "bash", "args": ["run.sh"]}"#,
        )
        .unwrap();
        assert_eq!(step.command, "bash");
        assert_eq!(step.args, vec!["run.sh"]);
        assert!(step.envs.is_empty());
        assert!(step.secrets.is_empty());
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = PipelineSpec {
            cloud_instance: CloudInstance {
                pool_name: "ubuntu".to_string(),
                id: "4711".to_string(),
                ip: "10.0.0.1".to_string(),
            },
            files: vec![FileEntry {
                path: "/tmp/w".to_string(),
                data: Vec::new(),
                mode: 0o700,
                is_dir: true,
            }],
            volumes: vec![Volume {
                empty_dir: Some(EmptyDir {
                    id: "/tmp/scratch".to_string(),
                    mode: 0o777,
                }),
            }],
            steps: Vec::new(),
        };
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: PipelineSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.cloud_instance.id, "4711");
        assert!(parsed.files[0].is_dir);
        assert_eq!(
            parsed.volumes[0].empty_dir.as_ref().unwrap().id,
            "/tmp/scratch"
        );
    }
}
