//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration for the native stack support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Stacks shallower than this many words never get a stack trap
    pub min_stack_words: usize,
    /// Number of frames skipped each time the stack trap is moved
    pub skip_frames: usize,
    /// Number of actual arguments passed in registers
    pub arg_registers: usize,
    /// Default the CLI log filter to `trace`, showing trap and unwinder
    /// events (`RUST_LOG` still takes precedence)
    pub trace: bool,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            min_stack_words: 128,
            skip_frames: 4,
            arg_registers: 0,
            trace: false,
        }
    }
}

/// On-disk layout: the settings live under a `[native]` table.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    native: NativeConfig,
}

impl NativeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        file.native.validate()?;
        Ok(file.native)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    /// Number of the given actuals that are passed on the stack.
    pub fn stack_arity(&self, arity: usize) -> usize {
        arity.saturating_sub(self.arg_registers)
    }

    fn validate(&self) -> Result<(), String> {
        // A zero skip count would install the trap on the current frame itself.
        if self.skip_frames == 0 {
            return Err("skip_frames must be at least 1".to_string());
        }
        Ok(())
    }
}
