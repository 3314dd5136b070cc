//! Synths: leaf nodes running one instance built from a prototype.

#![forbid(unsafe_code)]

use crate::error::GraphError;
use crate::node::Slot;
use std::fmt;
use std::sync::Arc;

/// Most control slots a synth can carry. Controls live inline in the node, so
/// the bound keeps every node the same fixed size.
pub const MAX_CONTROLS: usize = 64;

/// Signal-processing graph of one running synth.
///
/// Built by an external collaborator. `process` runs on the render path and
/// must not allocate, lock or block.
pub trait UnitGraph: Send {
    /// Render one block, adding into `out`.
    fn process(&mut self, controls: &[f32], out: &mut [f32]);
}

/// Ordered parameter table of a prototype: slot names with default values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTable {
    names: Vec<String>,
    defaults: Vec<f32>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named slot. A repeated name shadows nothing: resolution
    /// returns the first slot with that name.
    pub fn with(mut self, name: impl Into<String>, default: f32) -> Self {
        self.names.push(name.into());
        self.defaults.push(default);
        self
    }

    /// Slot index for `name`.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn defaults(&self) -> &[f32] {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for ParameterTable {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |table, (name, default)| table.with(name, default))
    }
}

/// A running synth instance.
///
/// Control values are stored inline; only the unit graph lives behind a
/// pointer, allocated by whoever builds it.
pub struct Synth {
    prototype: Arc<str>,
    parameters: Arc<ParameterTable>,
    controls: [f32; MAX_CONTROLS],
    control_count: usize,
    graph: Box<dyn UnitGraph>,
}

impl Synth {
    /// Start a synth with every control at its default.
    ///
    /// Fails with [`GraphError::InstantiationError`] when the table has more
    /// than [`MAX_CONTROLS`] slots.
    pub fn new(
        prototype: Arc<str>,
        parameters: Arc<ParameterTable>,
        graph: Box<dyn UnitGraph>,
    ) -> Result<Self, GraphError> {
        let defaults = parameters.defaults();
        if defaults.len() > MAX_CONTROLS {
            return Err(GraphError::InstantiationError(format!(
                "{} declares {} controls, at most {} are supported",
                prototype,
                defaults.len(),
                MAX_CONTROLS
            )));
        }
        let mut controls = [0.0; MAX_CONTROLS];
        controls[..defaults.len()].copy_from_slice(defaults);
        let control_count = defaults.len();
        Ok(Self {
            prototype,
            parameters,
            controls,
            control_count,
            graph,
        })
    }

    /// Name of the prototype this synth was built from.
    pub fn prototype_name(&self) -> &str {
        &self.prototype
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    /// Live control values, indexed like the parameter table.
    pub fn controls(&self) -> &[f32] {
        &self.controls[..self.control_count]
    }

    pub fn control<'a>(&self, slot: impl Into<Slot<'a>>) -> Option<f32> {
        self.index_of(slot.into())
            .and_then(|index| self.controls().get(index).copied())
    }

    /// Write a control. Names resolve through the parameter table; indices are
    /// used as-is.
    pub fn set<'a>(&mut self, slot: impl Into<Slot<'a>>, value: f32) -> Result<(), GraphError> {
        let slot = slot.into();
        let control = self
            .index_of(slot)
            .and_then(|index| self.controls[..self.control_count].get_mut(index))
            .ok_or_else(|| GraphError::SlotNotFound(slot.to_string()))?;
        *control = value;
        Ok(())
    }

    /// Render one block through the unit graph.
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        self.graph.process(&self.controls[..self.control_count], out);
    }

    fn index_of(&self, slot: Slot<'_>) -> Option<usize> {
        match slot {
            Slot::Name(name) => self.parameters.resolve(name),
            Slot::Index(index) => Some(index),
        }
    }
}

impl fmt::Debug for Synth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synth")
            .field("prototype", &self.prototype)
            .field("controls", &self.controls())
            .finish()
    }
}

/// Sine oscillator unit graph with `freq` (Hz) and `amp` controls.
#[derive(Debug, Clone)]
pub struct SineVoice {
    sample_rate: f32,
    phase: f32,
}

impl SineVoice {
    pub const FREQ: usize = 0;
    pub const AMP: usize = 1;

    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            phase: 0.0,
        }
    }
}

impl UnitGraph for SineVoice {
    fn process(&mut self, controls: &[f32], out: &mut [f32]) {
        let freq = controls.get(Self::FREQ).copied().unwrap_or(0.0);
        let amp = controls.get(Self::AMP).copied().unwrap_or(0.0);
        let step = 2.0 * std::f32::consts::PI * freq / self.sample_rate;
        for sample in out.iter_mut() {
            *sample += amp * self.phase.sin();
            self.phase = (self.phase + step) % std::f32::consts::TAU;
        }
    }
}
