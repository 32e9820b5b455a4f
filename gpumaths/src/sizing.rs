//! Helper functions for sizing stream arenas
//!
//! An arena holds the constants region once, followed by `n` slots of input and output words.
use crate::env::{Kernel, Variant};

/// Input + output bytes for a single item
pub const fn slot_cost(variant: Variant, kernel: Kernel) -> usize {
    variant.input_size(kernel) + variant.output_size(kernel)
}

/// Per-batch overhead, independent of the item count
pub const fn constants_cost(variant: Variant, kernel: Kernel) -> usize {
    variant.constants_size(kernel)
}

/// Number of items a `mem_size` bytes arena can hold
/// Zero means that the arena can't even hold the constants region
pub const fn max_slots(variant: Variant, kernel: Kernel, mem_size: usize) -> usize {
    let constants = constants_cost(variant, kernel);
    if mem_size < constants {
        0
    } else {
        (mem_size - constants) / slot_cost(variant, kernel)
    }
}

/// Arena size required to hold `num_items` items
pub const fn required_memory(variant: Variant, kernel: Kernel, num_items: usize) -> usize {
    constants_cost(variant, kernel) + num_items * slot_cost(variant, kernel)
}

/// Same as [`required_memory`], `None` when the size does not fit in a `usize`
pub const fn checked_required_memory(
    variant: Variant,
    kernel: Kernel,
    num_items: usize,
) -> Option<usize> {
    match num_items.checked_mul(slot_cost(variant, kernel)) {
        Some(slots) => constants_cost(variant, kernel).checked_add(slots),
        None => None,
    }
}

/// Byte ranges of the different regions inside an arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaLayout {
    pub constants: std::ops::Range<usize>,
    pub inputs: std::ops::Range<usize>,
    pub outputs: std::ops::Range<usize>,
}

impl ArenaLayout {
    pub fn new(variant: Variant, kernel: Kernel, num_items: usize) -> Self {
        let c = constants_cost(variant, kernel);
        let i = c + num_items * variant.input_size(kernel);
        let o = i + num_items * variant.output_size(kernel);
        Self {
            constants: 0..c,
            inputs: c..i,
            outputs: i..o,
        }
    }

    /// Length of the staged host region (constants followed by inputs)
    pub fn staged_len(&self) -> usize {
        self.inputs.end
    }

    pub fn total_len(&self) -> usize {
        self.outputs.end
    }
}
