use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PrexdError;

/// Scripting languages the worker sandbox can dispatch to.
///
/// The tag travels on the wire in the `lang` field of both submission and
/// task-dispatch payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Python,
    Java,
    Shell,
    Ruby,
    Js,
}

impl Lang {
    /// Configuration key holding the interpreter binary path.
    pub fn config_key(self) -> &'static str {
        match self {
            Lang::Python => "python",
            Lang::Java => "java",
            Lang::Shell => "shell",
            Lang::Ruby => "ruby",
            Lang::Js => "js",
        }
    }

    /// Driver script under `<exe_dir>/node/` that bridges the FIFO protocol
    /// to the interpreter. Java is compiled ahead of time, so its "script"
    /// is the class directory instead.
    pub fn node_script(self) -> &'static str {
        match self {
            Lang::Python => "node/node.py",
            Lang::Java => "node",
            Lang::Shell => "node/node.sh",
            Lang::Ruby => "node/node.rb",
            Lang::Js => "node/node.js",
        }
    }
}

impl FromStr for Lang {
    type Err = PrexdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Lang::Python),
            "java" => Ok(Lang::Java),
            "shell" => Ok(Lang::Shell),
            "ruby" => Ok(Lang::Ruby),
            "js" => Ok(Lang::Js),
            other => Err(PrexdError::LanguageNotSupported(other.to_string())),
        }
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.config_key())
    }
}
