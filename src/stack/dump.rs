//! Human-readable native stack dump.
//!
//! Used by the stack introspection command. The exact text is not a stable
//! format.

use std::fmt;
use std::io::{self, Write};

use super::descriptor::DescriptorTable;
use super::native::{NativeContext, NativeStack};
use super::{NativeSupport, StackError};

/// One line of a stack dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpRow {
    /// Execution context field
    Field { name: &'static str, value: usize },
    /// Horizontal rule between sections and frames
    Separator,
    /// A stack word; live words hold references and are decoded
    Slot {
        address: usize,
        value: usize,
        live: bool,
    },
    /// A return address slot
    ReturnAddress {
        address: usize,
        value: usize,
        /// Real return address when the slot holds the stack trap
        trap_original: Option<usize>,
        /// Exception handler of the frame the address returns into
        exception_handler: Option<usize>,
    },
}

/// A captured native stack dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDump {
    pub rows: Vec<DumpRow>,
}

const WIDTH: usize = 2 + 2 * std::mem::size_of::<usize>();

impl StackDump {
    /// Slot rows only, in stack order.
    pub fn slots(&self) -> impl Iterator<Item = &DumpRow> {
        self.rows
            .iter()
            .filter(|row| matches!(row, DumpRow::Slot { .. } | DumpRow::ReturnAddress { .. }))
    }

    /// Write the dump as a table, decoding live words with `decode`.
    pub fn render<W: Write>(&self, out: &mut W, decode: impl Fn(usize) -> String) -> io::Result<()> {
        let dashes = "-".repeat(WIDTH + 2);
        writeln!(out, " |      NATIVE  STACK      |")?;
        for row in &self.rows {
            match row {
                DumpRow::Field { name, value } => {
                    writeln!(out, " | {:>w$} | {:#0w$x} |", name, value, w = WIDTH)?;
                }
                DumpRow::Separator => writeln!(out, " |{}|{}|", dashes, dashes)?,
                DumpRow::Slot {
                    address,
                    value,
                    live,
                } => {
                    write!(out, " | {:#0w$x} | {:#0w$x} | ", address, value, w = WIDTH)?;
                    if *live {
                        write!(out, "{}", decode(*value))?;
                    }
                    writeln!(out)?;
                }
                DumpRow::ReturnAddress {
                    address,
                    value,
                    trap_original,
                    exception_handler,
                } => {
                    write!(out, " | {:#0w$x} | {:#0w$x} | ", address, value, w = WIDTH)?;
                    match trap_original {
                        Some(ra) => write!(out, "STACK TRAP, ORIG RA {:#x}", ra)?,
                        None => write!(out, "NATIVE RA")?,
                    }
                    if let Some(handler) = exception_handler {
                        write!(out, ", EXNRA {:#x}", handler)?;
                    }
                    writeln!(out)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for StackDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::new();
        self.render(&mut buf, |word| format!("<{:#x}>", word))
            .map_err(|_| fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl<T: DescriptorTable> NativeSupport<'_, T> {
    /// Capture the native stack and context of a stopped process.
    ///
    /// Frames are decoded with the walker, so a corrupt stack is reported
    /// the same way as for any other walk.
    pub fn dump_stack(&self, stack: &NativeStack, ctx: &NativeContext) -> Result<StackDump, StackError> {
        let mut rows = vec![
            DumpRow::Separator,
            DumpRow::Field {
                name: "nsp",
                value: stack.address_of(stack.top()),
            },
            DumpRow::Field {
                name: "nstend",
                value: stack.address_of(stack.end()),
            },
            DumpRow::Field {
                name: "nstgraylim",
                value: ctx.gray_limit.map_or(0, |limit| stack.address_of(limit)),
            },
            DumpRow::Field {
                name: "nra",
                value: ctx.return_address,
            },
            DumpRow::Field {
                name: "narity",
                value: ctx.arity,
            },
            DumpRow::Field {
                name: "ngra",
                value: ctx.saved_return.unwrap_or(0),
            },
            DumpRow::Separator,
        ];

        // No native frames yet.
        if ctx.return_address == 0 {
            return Ok(StackDump { rows });
        }

        // The current call's arguments come first.
        let args = self.config.stack_arity(ctx.arity);
        for index in stack.top()..stack.top() + args {
            rows.push(DumpRow::Slot {
                address: stack.address_of(index),
                value: stack.get(index)?,
                live: true,
            });
        }

        for record in self.walk(stack, ctx) {
            let record = record?;
            rows.push(DumpRow::Separator);
            let desc = record.descriptor;
            for slot in 0..desc.size_in_words() {
                let index = record.base + slot;
                let address = stack.address_of(index);
                let value = stack.get(index)?;
                if slot == desc.frame_size {
                    let (real, trapped) = ctx.resolve_return(value)?;
                    rows.push(DumpRow::ReturnAddress {
                        address,
                        value,
                        trap_original: trapped.then_some(real),
                        exception_handler: self.table.find(real).and_then(|d| d.exception_handler),
                    });
                } else {
                    rows.push(DumpRow::Slot {
                        address,
                        value,
                        live: desc.live_bit(slot),
                    });
                }
            }
        }
        rows.push(DumpRow::Separator);
        Ok(StackDump { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FAIL, MODE_SWITCH_RA, build, frame};
    use super::super::{DescriptorMap, FrameDescriptor, LiveBits, stack_trap_ra};
    use super::*;
    use crate::config::NativeConfig;

    const R: usize = 0x1000;
    const H: usize = 0x7000;

    fn scenario() -> (NativeStack, NativeContext, DescriptorMap) {
        let table = DescriptorMap::new()
            .with(
                R,
                FrameDescriptor::new(3, 2)
                    .with_live_bits(LiveBits::from_mask(0b101))
                    .with_handler(H),
            )
            .with(MODE_SWITCH_RA, FrameDescriptor::new(0, 0).with_handler(FAIL));
        let stack = NativeStack::from_words(vec![0x10, 0x11, 0x12, MODE_SWITCH_RA, 0x14, 0x15], 0);
        (stack, NativeContext::new(R, 0), table)
    }

    #[test]
    fn test_dump_single_frame() {
        let (stack, ctx, table) = scenario();
        let config = NativeConfig::default();
        let support = NativeSupport::new(&table, &config, FAIL);

        let dump = support.dump_stack(&stack, &ctx).unwrap();
        let slots: Vec<_> = dump.slots().cloned().collect();

        assert_eq!(slots.len(), 6);
        assert!(matches!(slots[0], DumpRow::Slot { value: 0x10, live: true, .. }));
        assert!(matches!(slots[1], DumpRow::Slot { value: 0x11, live: false, .. }));
        assert!(matches!(slots[2], DumpRow::Slot { value: 0x12, live: true, .. }));
        assert_eq!(
            slots[3],
            DumpRow::ReturnAddress {
                address: stack.address_of(3),
                value: MODE_SWITCH_RA,
                trap_original: None,
                exception_handler: Some(FAIL),
            }
        );

        let text = dump.to_string();
        assert!(text.contains("NATIVE  STACK"));
        assert!(text.contains("<0x10>"));
        assert!(!text.contains("<0x11>"));
        assert!(text.contains("<0x12>"));
        assert!(text.contains("NATIVE RA"));
        assert!(text.contains(&format!("EXNRA {:#x}", FAIL)));
    }

    #[test]
    fn test_dump_marks_trap() {
        let (mut stack, mut ctx, table) = build(vec![frame(0x1000, 1, 0), frame(0x2000, 1, 0)]);
        stack.set(1, stack_trap_ra()).unwrap();
        ctx.saved_return = Some(0x2000);
        let config = NativeConfig::default();
        let support = NativeSupport::new(&table, &config, FAIL);

        let text = support.dump_stack(&stack, &ctx).unwrap().to_string();
        assert!(text.contains("STACK TRAP, ORIG RA 0x2000"));
    }

    #[test]
    fn test_dump_without_native_frames() {
        let (stack, mut ctx, table) = scenario();
        ctx.return_address = 0;
        let config = NativeConfig::default();
        let support = NativeSupport::new(&table, &config, FAIL);

        let dump = support.dump_stack(&stack, &ctx).unwrap();
        assert_eq!(dump.slots().count(), 0);
        assert!(dump.rows.contains(&DumpRow::Field { name: "nra", value: 0 }));
    }

    #[test]
    fn test_dump_reports_overrun() {
        let (stack, ctx, mut table) = scenario();
        table.insert(R, FrameDescriptor::new(3, 3));
        let config = NativeConfig::default();
        let support = NativeSupport::new(&table, &config, FAIL);

        assert!(matches!(
            support.dump_stack(&stack, &ctx),
            Err(StackError::Overrun { .. })
        ));
    }
}
