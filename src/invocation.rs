//! A single conda call: subcommand, flags and positional arguments.
//!
//! The same value is rendered as an argv for the pipe transport and sent as
//! JSON to a relay for the channel transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flag always appended to argv so conda answers in JSON.
pub const JSON_FLAG: &str = "--json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub subcommand: String,
    #[serde(default)]
    pub flags: Map<String, Value>,
    #[serde(default)]
    pub positional: Vec<String>,
}

impl Invocation {
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            ..Default::default()
        }
    }

    pub fn flag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Whether conda was asked to report progress (`quiet: false`).
    pub fn wants_progress(&self) -> bool {
        matches!(self.flags.get("quiet"), Some(Value::Bool(false)))
    }

    /// Render as conda argv.
    ///
    /// `false` and `null` flags are omitted, `true` is a bare switch, arrays
    /// expand to one argument per item, and `--json` comes last.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.subcommand.clone()];

        for (name, value) in &self.flags {
            match value {
                Value::Bool(false) | Value::Null => continue,
                Value::Bool(true) => args.push(switch_name(name)),
                Value::Array(items) => {
                    args.push(switch_name(name));
                    args.extend(items.iter().map(scalar_arg));
                }
                other => {
                    args.push(switch_name(name));
                    args.push(scalar_arg(other));
                }
            }
        }

        args.extend(self.positional.iter().cloned());
        args.push(JSON_FLAG.to_string());
        args
    }
}

/// `useIndexCache` -> `--use-index-cache`
pub fn switch_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    out.push_str("--");
    for c in name.chars() {
        if c.is_uppercase() {
            out.push('-');
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn scalar_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
