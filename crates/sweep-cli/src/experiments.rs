use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use sweep_runner::{Experiment, ExperimentRegistry, Kwargs, ResultValue, TrialOutput};

pub fn register_builtins(registry: &mut ExperimentRegistry) {
    registry.register_instance(
        "echo",
        "records the configuration it was called with",
        Arc::new(Echo),
    );
    registry.register(
        "command",
        "runs the command after `--` with the config as JSON on stdin",
        |args| Ok(Arc::new(CommandExperiment::from_args(args)?) as Arc<dyn Experiment>),
    );
}

pub struct Echo;

impl Experiment for Echo {
    fn run(&self, kwargs: &Kwargs) -> Result<TrialOutput> {
        let mut out = TrialOutput::new();
        match kwargs.to_json() {
            Value::Object(map) => {
                out.insert("config".to_string(), ResultValue::Mapping(map));
            }
            other => bail!("expected keyword arguments to be a mapping, got {}", other),
        }
        Ok(out)
    }
}

/// Runs an external program once per configuration.
///
/// The configuration goes to stdin as one JSON object. If the last non-empty
/// stdout line is a JSON object, each of its fields becomes a result.
#[derive(Debug, Clone)]
pub struct CommandExperiment {
    program: String,
    args: Vec<String>,
}

impl CommandExperiment {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("the command experiment needs a program after `--`"))?;
        Ok(Self {
            program: program.clone(),
            args: rest.to_vec(),
        })
    }
}

impl Experiment for CommandExperiment {
    fn run(&self, kwargs: &Kwargs) -> Result<TrialOutput> {
        let input = serde_json::to_vec(&kwargs.to_json())?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("cannot start {}", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&input);
        }
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            bail!("{} exited with {}", self.program, output.status);
        }

        let mut out = TrialOutput::new();
        if let Some(Value::Object(fields)) = last_json_line(&stdout) {
            for (key, value) in fields {
                out.insert(key, ResultValue::from(value));
            }
        }
        out.insert(
            "status".to_string(),
            ResultValue::from(i64::from(output.status.code().unwrap_or(-1))),
        );
        out.insert("stdout.log".to_string(), ResultValue::from(stdout));
        Ok(out)
    }

    fn description(&self, config: &Kwargs) -> String {
        format!("{} {}", self.program, config.to_json())
    }
}

fn last_json_line(stdout: &str) -> Option<Value> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}
