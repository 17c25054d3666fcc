use drover_core::platform::OsKind;

use crate::spec::{FileEntry, Step};

/// Name of the container network created during setup.
pub const NETWORK_NAME: &str = "myNetwork";

/// `docker network create` invocation for the pool's OS. Windows
/// daemons need the nat driver; everywhere else the default bridge
/// driver applies.
pub fn network_create_command(os: OsKind) -> String {
    match os {
        OsKind::Windows => format!("docker network create --driver nat {NETWORK_NAME}"),
        OsKind::Linux => format!("docker network create {NETWORK_NAME}"),
    }
}

/// Remote command line for a step.
pub fn step_command(step: &Step) -> String {
    if step.args.is_empty() {
        step.command.clone()
    } else {
        format!("{} {}", step.command, step.args.join(" "))
    }
}

/// Prepend the execution prelude to a step script.
///
/// There is no good way to set the working directory or environment of
/// a remote command over SSH, so both are baked into the script: a cd,
/// the secret exports, then the env exports sorted by key so the
/// emitted bytes are deterministic for a given mapping.
pub fn render_step_file(step: &Step, os: OsKind, file: &FileEntry) -> Vec<u8> {
    let mut script = String::new();
    script.push_str(&format!("cd {}\n", step.working_dir));
    for secret in &step.secrets {
        write_env(&mut script, os, &secret.env, &secret.data);
    }
    let mut keys: Vec<&String> = step.envs.keys().collect();
    keys.sort();
    for key in keys {
        write_env(&mut script, os, key, &step.envs[key]);
    }

    let mut bytes = script.into_bytes();
    bytes.extend_from_slice(&file.data);
    bytes
}

fn write_env(script: &mut String, os: OsKind, key: &str, value: &str) {
    match os {
        OsKind::Windows => script.push_str(&format!("$Env:{} = {:?}\n", key, value)),
        OsKind::Linux => script.push_str(&format!("export {}={:?}\n", key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn step_with_envs(envs: &[(&str, &str)]) -> Step {
        Step {
            working_dir: "/tmp/work".to_string(),
            command: "bash".to_string(),
            envs: envs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    fn script_file() -> FileEntry {
        FileEntry {
            path: "/tmp/work/run.sh".to_string(),
            data: b"echo hello\n".to_vec(),
            mode: 0o700,
            is_dir: false,
        }
    }

    #[test]
    fn test_network_command_per_os() {
        assert_eq!(
            network_create_command(OsKind::Linux),
            "docker network create myNetwork"
        );
        assert_eq!(
            network_create_command(OsKind::Windows),
            "docker network create --driver nat myNetwork"
        );
    }

    #[test]
    fn test_step_command_joins_args() {
        let mut step = step_with_envs(&[]);
        assert_eq!(step_command(&step), "bash");
        step.args = vec!["-e".to_string(), "run.sh".to_string()];
        assert_eq!(step_command(&step), "bash -e run.sh");
    }

    // Envs are emitted sorted by key, after the workdir line.
    #[test]
    fn test_prelude_sorts_envs() {
        let step = step_with_envs(&[("B", "2"), ("A", "1")]);
        let rendered = render_step_file(&step, OsKind::Linux, &script_file());
        let text = String::from_utf8(rendered).unwrap();
        assert_eq!(
            text,
            "cd /tmp/work\nexport A=\"1\"\nexport B=\"2\"\necho hello\n"
        );
    }

    #[test]
    fn test_prelude_is_deterministic() {
        let step = step_with_envs(&[("Z", "26"), ("M", "13"), ("A", "1")]);
        let first = render_step_file(&step, OsKind::Linux, &script_file());
        let second = render_step_file(&step, OsKind::Linux, &script_file());
        assert_eq!(first, second);
    }

    #[test]
    fn test_prelude_secrets_precede_envs() {
        let mut step = step_with_envs(&[("A", "1")]);
        step.secrets = vec![crate::spec::Secret {
            env: "TOKEN".to_string(),
            data: "hunter2".to_string(),
        }];
        let rendered = render_step_file(&step, OsKind::Linux, &script_file());
        let text = String::from_utf8(rendered).unwrap();
        let token = text.find("TOKEN").unwrap();
        let env = text.find("export A").unwrap();
        assert!(token < env);
        assert!(text.contains("export TOKEN=\"hunter2\"\n"));
    }

    #[test]
    fn test_prelude_powershell_form() {
        let step = step_with_envs(&[("PATH_EXT", "C:\\tools")]);
        let rendered = render_step_file(&step, OsKind::Windows, &script_file());
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains("$Env:PATH_EXT = \"C:\\\\tools\"\n"));
        assert!(!text.contains("export"));
    }

    #[test]
    fn test_prelude_quotes_values_with_spaces() {
        let step = step_with_envs(&[("MSG", "hello world")]);
        let rendered = render_step_file(&step, OsKind::Linux, &script_file());
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains("export MSG=\"hello world\"\n"));
    }

    #[test]
    fn test_payload_follows_prelude() {
        let step = step_with_envs(&[]);
        let rendered = render_step_file(&step, OsKind::Linux, &script_file());
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.starts_with("cd /tmp/work\n"));
        assert!(text.ends_with("echo hello\n"));
    }
}
