//! Native stack scenarios (TOML).
//!
//! A scenario describes a stopped process: its frames from innermost to
//! outermost, the current call's stack arguments and the handler
//! addresses. Loading one lays the frames out on a [`NativeStack`] the way
//! native code would have, ending in the mode-switch frame.
//!
//! ```toml
//! fail_handler = 0x200
//! mode_switch = 0x100
//!
//! [call]
//! arity = 1
//! args = [0x51]
//!
//! [[frame]]
//! return_address = 0x1000
//! frame_size = 2
//! arity = 1
//! live = [0]
//! slots = [0x11, 0x12, 0x13]
//! handler = 0x3000
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::NativeConfig;
use crate::stack::{
    DescriptorMap, DescriptorTable, FrameDescriptor, FrameRecord, LiveBits, NativeContext,
    NativeStack,
};

fn default_mode_switch() -> usize {
    0x100
}

fn default_fail_handler() -> usize {
    0x200
}

/// A scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Address of the uncaught-exception terminator
    #[serde(default = "default_fail_handler")]
    pub fail_handler: usize,
    /// Return address of the mode-switch frame that ends every stack
    #[serde(default = "default_mode_switch")]
    pub mode_switch: usize,
    #[serde(default)]
    pub call: CallSpec,
    #[serde(default, rename = "frame")]
    pub frames: Vec<FrameSpec>,
}

/// The call in progress when the process stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallSpec {
    #[serde(default)]
    pub arity: usize,
    /// Arguments passed on the stack, at the stack pointer. Must hold
    /// exactly the actuals not passed in registers.
    #[serde(default)]
    pub args: Vec<usize>,
}

/// One native frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSpec {
    pub return_address: usize,
    pub frame_size: usize,
    #[serde(default)]
    pub arity: usize,
    /// Live slots, counted from the frame base (the return address slot excluded)
    #[serde(default)]
    pub live: Vec<usize>,
    /// Local slots then incoming arguments; missing words are zero
    #[serde(default)]
    pub slots: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<usize>,
}

/// A process rebuilt from a scenario.
#[derive(Debug)]
pub struct Process {
    pub stack: NativeStack,
    pub ctx: NativeContext,
    pub table: DescriptorMap,
    pub fail_handler: usize,
}

impl Scenario {
    /// Parse a scenario from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse scenario: {}", e))
    }

    /// Load a scenario file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    /// Lay the frames out on a stack. `config` decides how many of the
    /// current call's actuals are on the stack.
    pub fn build(&self, config: &NativeConfig) -> Result<Process, String> {
        let stack_args = config.stack_arity(self.call.arity);
        if self.call.args.len() != stack_args {
            return Err(format!(
                "call of arity {} has {} stack arguments, expected {}",
                self.call.arity,
                self.call.args.len(),
                stack_args
            ));
        }

        let mut table = DescriptorMap::new().with(
            self.mode_switch,
            FrameDescriptor::new(0, 0).with_handler(self.fail_handler),
        );

        let mut words = self.call.args.clone();
        for (i, frame) in self.frames.iter().enumerate() {
            let descriptor = frame.descriptor();
            let payload = descriptor.frame_size + descriptor.arity;
            if frame.slots.len() > payload {
                return Err(format!(
                    "frame {} ({:#x}) has {} slot values but only {} slots",
                    i,
                    frame.return_address,
                    frame.slots.len(),
                    payload
                ));
            }
            let bad_live = frame
                .live
                .iter()
                .find(|&&s| s == frame.frame_size || s >= descriptor.size_in_words());
            if let Some(&slot) = bad_live {
                return Err(format!(
                    "frame {} ({:#x}): live slot {} is not a local or argument slot",
                    i, frame.return_address, slot
                ));
            }

            let mut slots = frame.slots.clone();
            slots.resize(payload, 0);
            let caller = self
                .frames
                .get(i + 1)
                .map_or(self.mode_switch, |next| next.return_address);
            words.extend_from_slice(&slots[..frame.frame_size]);
            words.push(caller);
            words.extend_from_slice(&slots[frame.frame_size..]);

            if table.find(frame.return_address).is_some() {
                return Err(format!(
                    "return address {:#x} described twice",
                    frame.return_address
                ));
            }
            table.insert(frame.return_address, descriptor);
        }

        let return_address = self
            .frames
            .first()
            .map_or(self.mode_switch, |f| f.return_address);
        Ok(Process {
            stack: NativeStack::from_words(words, 0),
            ctx: NativeContext::new(return_address, self.call.arity),
            table,
            fail_handler: self.fail_handler,
        })
    }
}

impl FrameSpec {
    fn descriptor(&self) -> FrameDescriptor {
        let descriptor = FrameDescriptor::new(self.frame_size, self.arity)
            .with_live_bits(LiveBits::from_slots(&self.live));
        match self.handler {
            Some(handler) => descriptor.with_handler(handler),
            None => descriptor,
        }
    }
}

/// A walked frame in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub base: usize,
    pub return_address: usize,
    pub frame_size: usize,
    pub arity: usize,
    pub trapped: bool,
    pub live: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<usize>,
}

impl From<&FrameRecord<'_>> for FrameSummary {
    fn from(record: &FrameRecord<'_>) -> Self {
        Self {
            base: record.base,
            return_address: record.return_address,
            frame_size: record.descriptor.frame_size,
            arity: record.descriptor.arity,
            trapped: record.trapped,
            live: record.live_slots().collect(),
            handler: record.descriptor.exception_handler,
        }
    }
}
