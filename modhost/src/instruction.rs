//! Instruction bindings and dispatch table splicing.
//!
//! Every `(mode, opcode)` slot keeps a splice stack. Splicing pushes a frame
//! holding the routine that was live before; unsplicing the top frame
//! restores it. Removing a frame that is not on top (the modules were
//! unloaded in a different order than they were loaded) hands its saved
//! routine to the frame above, so the chain stays intact.

use modhost_common::abi::{Address, InstructionSink};
use modhost_common::flags::ArchModes;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// The host's instruction dispatch table.
pub trait DispatchTable: Send + Sync {
    /// Install `routine` at `(mode, opcode)` and return the previous occupant.
    ///
    /// `mode` always holds exactly one mode.
    fn replace(&mut self, mode: ArchModes, opcode: u16, routine: Address) -> Address;

    /// Routine currently installed at `(mode, opcode)`.
    fn routine(&self, mode: ArchModes, opcode: u16) -> Address;
}

/// Sparse dispatch table with a fallback routine for empty slots.
#[derive(Debug, Clone)]
pub struct OpcodeTable {
    slots: HashMap<(ArchModes, u16), Address>,
    fallback: Address,
}

impl OpcodeTable {
    /// Table whose empty slots dispatch to `fallback`.
    pub fn new(fallback: Address) -> Self {
        Self {
            slots: HashMap::new(),
            fallback,
        }
    }

    /// Pre-install a built-in routine.
    pub fn with_routine(mut self, mode: ArchModes, opcode: u16, routine: Address) -> Self {
        self.slots.insert((mode, opcode), routine);
        self
    }
}

impl DispatchTable for OpcodeTable {
    fn replace(&mut self, mode: ArchModes, opcode: u16, routine: Address) -> Address {
        self.slots
            .insert((mode, opcode), routine)
            .unwrap_or(self.fallback)
    }

    fn routine(&self, mode: ArchModes, opcode: u16) -> Address {
        self.slots
            .get(&(mode, opcode))
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Identifies one binding across its splice frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

/// An instruction routine contributed by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBinding {
    /// Binding identity.
    pub id: BindingId,
    /// Instruction name.
    pub name: String,
    /// Normalised two-byte opcode.
    pub opcode: u16,
    /// Modes the routine is installed in.
    pub modes: ArchModes,
    /// The routine.
    pub routine: Address,
}

#[derive(Debug, Clone, Copy)]
struct SpliceFrame {
    binding: BindingId,
    saved: Address,
}

/// Splice stacks of every slot a module routine was installed in.
#[derive(Debug, Default)]
pub struct SpliceStacks {
    stacks: HashMap<(ArchModes, u16), Vec<SpliceFrame>>,
    next_id: u64,
}

impl SpliceStacks {
    /// No slot spliced yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `binding` in every one of its modes.
    pub fn splice(&mut self, table: &mut dyn DispatchTable, binding: &InstructionBinding) {
        for mode in binding.modes.iter() {
            let saved = table.replace(mode, binding.opcode, binding.routine);
            self.stacks
                .entry((mode, binding.opcode))
                .or_default()
                .push(SpliceFrame {
                    binding: binding.id,
                    saved,
                });
        }
    }

    /// Remove `binding` from every slot it was installed in.
    pub fn unsplice(&mut self, table: &mut dyn DispatchTable, binding: &InstructionBinding) {
        for mode in binding.modes.iter() {
            let key = (mode, binding.opcode);
            let Some(stack) = self.stacks.get_mut(&key) else {
                warn!(
                    "instruction {} ({:04X}) was never spliced",
                    binding.name, binding.opcode
                );
                continue;
            };
            let Some(pos) = stack.iter().rposition(|f| f.binding == binding.id) else {
                warn!(
                    "instruction {} ({:04X}) was never spliced",
                    binding.name, binding.opcode
                );
                continue;
            };

            let frame = stack.remove(pos);
            if pos == stack.len() {
                table.replace(mode, binding.opcode, frame.saved);
            } else {
                warn!(
                    "instruction {} ({:04X}) unloaded out of order; relinking",
                    binding.name, binding.opcode
                );
                stack[pos].saved = frame.saved;
            }
            if stack.is_empty() {
                self.stacks.remove(&key);
            }
        }
        debug!(name = %binding.name, opcode = binding.opcode, "instruction unspliced");
    }

    /// Routine `binding` displaced in `mode`, i.e. what unsplicing it now
    /// would restore (or hand to the binding above).
    pub fn saved_original(&self, binding: BindingId, mode: ArchModes, opcode: u16) -> Option<Address> {
        self.stacks
            .get(&(mode, opcode))?
            .iter()
            .rfind(|f| f.binding == binding)
            .map(|f| f.saved)
    }

    /// Number of bindings stacked on a slot.
    pub fn depth(&self, mode: ArchModes, opcode: u16) -> usize {
        self.stacks.get(&(mode, opcode)).map_or(0, Vec::len)
    }

    fn allocate_id(&mut self) -> BindingId {
        self.next_id += 1;
        BindingId(self.next_id)
    }
}

/// Sink behind [`modhost_common::abi::InstructionRegistrar`]: records the
/// binding on the module and splices it immediately.
pub(crate) struct InstructionCollector<'a> {
    bindings: &'a mut VecDeque<InstructionBinding>,
    table: &'a mut dyn DispatchTable,
    splices: &'a mut SpliceStacks,
}

impl<'a> InstructionCollector<'a> {
    pub(crate) fn new(
        bindings: &'a mut VecDeque<InstructionBinding>,
        table: &'a mut dyn DispatchTable,
        splices: &'a mut SpliceStacks,
    ) -> Self {
        Self {
            bindings,
            table,
            splices,
        }
    }
}

impl InstructionSink for InstructionCollector<'_> {
    fn register_instruction(&mut self, modes: ArchModes, opcode: u16, name: &str, routine: Address) {
        let binding = InstructionBinding {
            id: self.splices.allocate_id(),
            name: name.to_string(),
            opcode,
            modes,
            routine,
        };
        self.splices.splice(&mut *self.table, &binding);
        debug!(name, opcode, modes = ?modes, "instruction spliced");
        self.bindings.push_front(binding);
    }
}
