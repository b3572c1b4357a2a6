use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Points in a capture where recipe commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionPhase {
    Precapture,
    Preinstall,
    Install,
    Postinstall,
    Prebuild,
}

impl fmt::Display for ConversionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Precapture => "precapture",
            Self::Preinstall => "preinstall",
            Self::Install => "install",
            Self::Postinstall => "postinstall",
            Self::Prebuild => "prebuild",
        };
        f.write_str(name)
    }
}

/// One line of a recipe, run inside the guest through a batch script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub label: String,
    pub command: String,
}

impl Command {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
        }
    }
}

pub type PhaseCommands = HashMap<ConversionPhase, Vec<Command>>;
