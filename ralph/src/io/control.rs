//! Operator command queue (`.ralph/control/commands.json`).
//!
//! The queue file is renamed aside before it is read, so a writer racing
//! with the loop either lands in this batch or starts a fresh file that the
//! next poll picks up.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// One operator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlCommand {
    Pause,
    Resume,
    InjectNote {
        note: String,
    },
    SkipTask {
        task_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct CommandQueue {
    #[serde(default)]
    pending: Vec<Value>,
}

/// Take every pending command and clear the queue.
///
/// A missing file is an empty queue. Entries that do not parse are logged and dropped.
pub fn consume_commands(path: &Path) -> Result<Vec<ControlCommand>> {
    let claimed = claimed_path(path);
    match fs::rename(path, &claimed) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("claim {}", path.display())),
    }
    let contents = fs::read_to_string(&claimed)
        .with_context(|| format!("read {}", claimed.display()))?;
    fs::remove_file(&claimed).with_context(|| format!("remove {}", claimed.display()))?;

    let queue: CommandQueue = match serde_json::from_str(&contents) {
        Ok(queue) => queue,
        Err(err) => {
            warn!(err = %err, "control file is not valid json, dropping it");
            return Ok(Vec::new());
        }
    };
    let commands: Vec<ControlCommand> = queue
        .pending
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(command) => Some(command),
            Err(err) => {
                warn!(entry = %entry, err = %err, "dropping unknown control command");
                None
            }
        })
        .collect();
    debug!(count = commands.len(), "control commands consumed");
    Ok(commands)
}

fn claimed_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".consumed");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_queue() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            consume_commands(&temp.path().join("commands.json"))
                .expect("consume")
                .is_empty()
        );
    }

    #[test]
    fn consumes_known_commands_and_clears_queue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("commands.json");
        fs::write(
            &path,
            r#"{"pending":[
                {"command":"pause"},
                {"command":"inject-note","note":"prefer small commits"},
                {"command":"reboot-universe"},
                {"command":"skip-task","task_id":"b"},
                {"command":"resume"}
            ]}"#,
        )
        .expect("write");

        let commands = consume_commands(&path).expect("consume");
        assert_eq!(
            commands,
            vec![
                ControlCommand::Pause,
                ControlCommand::InjectNote {
                    note: "prefer small commits".to_string()
                },
                ControlCommand::SkipTask {
                    task_id: "b".to_string(),
                    reason: None
                },
                ControlCommand::Resume,
            ]
        );
        assert!(!path.exists());
        assert!(!claimed_path(&path).exists());
        assert!(consume_commands(&path).expect("again").is_empty());
    }

    #[test]
    fn invalid_json_is_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("commands.json");
        fs::write(&path, "{not json").expect("write");
        assert!(consume_commands(&path).expect("consume").is_empty());
        assert!(!path.exists());
    }
}
