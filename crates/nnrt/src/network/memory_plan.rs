//! Intermediate tensor memory planning.
//!
//! Each tensor lives from the layer that produces it to the last layer that
//! reads it (closed interval over topological positions). Intermediates are
//! packed into slots by greedy interval coloring: tensors are visited in
//! order of first use and take the best-fitting slot whose previous tenant
//! is already dead. Graph inputs, declared outputs and persistent tensors
//! get dedicated allocations and never share.

use std::collections::BTreeMap;

use crate::blob::dims::round_up;
use crate::config::ForwardMemoryPolicy;
use crate::graph::NetStructure;

/// Alignment of every slot inside forward memory.
pub const FORWARD_MEMORY_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Owns its allocation.
    Dedicated,
    /// Lives in forward memory at the slot's offset.
    Shared { slot: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorPlan {
    pub bytes: usize,
    pub live_range: LiveRange,
    pub placement: Placement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySlot {
    pub id: usize,
    pub offset: usize,
    pub size: usize,
    pub tenants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryPlan {
    pub tensors: BTreeMap<String, TensorPlan>,
    pub slots: Vec<MemorySlot>,
}

impl MemoryPlan {
    /// Plans every tensor in `sizes` (bytes per tensor name).
    pub fn build(
        structure: &NetStructure,
        sizes: &BTreeMap<String, usize>,
        policy: ForwardMemoryPolicy,
    ) -> MemoryPlan {
        let ranges = live_ranges(structure);
        let mut plan = MemoryPlan::default();
        let mut shared: Vec<(&str, usize, LiveRange)> = Vec::new();

        for (name, &bytes) in sizes {
            let live_range = ranges
                .get(name.as_str())
                .copied()
                .unwrap_or(LiveRange::new(0, structure.layers.len()));
            let dedicated = structure.is_input(name)
                || structure.is_output(name)
                || structure.persistent.contains(name)
                || !ranges.contains_key(name.as_str());
            if dedicated {
                plan.tensors.insert(
                    name.clone(),
                    TensorPlan {
                        bytes,
                        live_range,
                        placement: Placement::Dedicated,
                    },
                );
            } else {
                shared.push((name.as_str(), bytes, live_range));
            }
        }

        shared.sort_by(|a, b| {
            (a.2.start, a.2.end, a.0).cmp(&(b.2.start, b.2.end, b.0))
        });

        let mut busy_until: Vec<usize> = Vec::new();
        for (name, bytes, range) in shared {
            let slot_id = match policy {
                ForwardMemoryPolicy::NoReuse => None,
                _ => best_fit(&plan.slots, &busy_until, bytes, range),
            };
            let slot_id = match slot_id {
                Some(id) => id,
                None => {
                    let id = plan.slots.len();
                    plan.slots.push(MemorySlot {
                        id,
                        offset: 0,
                        size: 0,
                        tenants: Vec::new(),
                    });
                    busy_until.push(0);
                    id
                }
            };
            let slot = &mut plan.slots[slot_id];
            slot.size = slot.size.max(bytes);
            slot.tenants.push(name.to_string());
            busy_until[slot_id] = range.end;
            plan.tensors.insert(
                name.to_string(),
                TensorPlan {
                    bytes,
                    live_range: range,
                    placement: Placement::Shared { slot: slot_id },
                },
            );
        }

        let mut offset = 0;
        for slot in &mut plan.slots {
            slot.offset = offset;
            offset += round_up(slot.size, FORWARD_MEMORY_ALIGNMENT);
        }
        plan
    }

    /// Bytes of forward memory needed for every shared slot.
    pub fn forward_memory_size(&self) -> usize {
        self.slots
            .last()
            .map_or(0, |slot| slot.offset + round_up(slot.size, FORWARD_MEMORY_ALIGNMENT))
    }

    /// Bytes held by dedicated tensors.
    pub fn dedicated_size(&self) -> usize {
        self.tensors
            .values()
            .filter(|t| t.placement == Placement::Dedicated)
            .map(|t| t.bytes)
            .sum()
    }

    /// Sum of all shared tensor sizes, i.e. the cost without reuse.
    pub fn unshared_size(&self) -> usize {
        self.tensors
            .values()
            .filter(|t| t.placement != Placement::Dedicated)
            .map(|t| round_up(t.bytes, FORWARD_MEMORY_ALIGNMENT))
            .sum()
    }

    pub fn slot_of(&self, name: &str) -> Option<&MemorySlot> {
        match self.tensors.get(name)?.placement {
            Placement::Shared { slot } => self.slots.get(slot),
            Placement::Dedicated => None,
        }
    }

    /// Pairs of tensors sharing a slot with overlapping live ranges. Empty
    /// for every plan `build` produces.
    pub fn conflicts(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for slot in &self.slots {
            for (i, a) in slot.tenants.iter().enumerate() {
                for b in &slot.tenants[i + 1..] {
                    let (Some(ta), Some(tb)) = (self.tensors.get(a), self.tensors.get(b)) else {
                        continue;
                    };
                    if ta.live_range.overlaps(&tb.live_range) {
                        out.push((a.clone(), b.clone()));
                    }
                }
            }
        }
        out
    }
}

fn best_fit(
    slots: &[MemorySlot],
    busy_until: &[usize],
    bytes: usize,
    range: LiveRange,
) -> Option<usize> {
    let free = slots
        .iter()
        .filter(|slot| busy_until[slot.id] < range.start);
    let mut fitting: Option<&MemorySlot> = None;
    let mut largest: Option<&MemorySlot> = None;
    for slot in free {
        if slot.size >= bytes && fitting.map_or(true, |f| slot.size < f.size) {
            fitting = Some(slot);
        }
        if largest.map_or(true, |l| slot.size > l.size) {
            largest = Some(slot);
        }
    }
    fitting.or(largest).map(|slot| slot.id)
}

/// Producer-to-last-consumer range of every tensor some layer produces.
pub fn live_ranges(structure: &NetStructure) -> BTreeMap<&str, LiveRange> {
    let mut ranges: BTreeMap<&str, LiveRange> = BTreeMap::new();
    for (idx, layer) in structure.layers.iter().enumerate() {
        for output in &layer.outputs {
            ranges.insert(output.as_str(), LiveRange::new(idx, idx));
        }
        for input in &layer.inputs {
            if let Some(range) = ranges.get_mut(input.as_str()) {
                range.end = range.end.max(idx);
            }
        }
    }
    ranges
}
