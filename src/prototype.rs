//! Synth prototypes and the name → prototype factory.
//!
//! Definition blobs are parsed by an external [`DefinitionReader`]; the
//! factory only needs a name, a parameter table and a routine that builds a
//! unit graph.

#![forbid(unsafe_code)]

use crate::error::{DefinitionError, GraphError};
use crate::node::{NodeId, ServerNode};
use crate::synth::{ParameterTable, SineVoice, Synth, UnitGraph};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// File extension of binary synth definitions.
pub const DEFINITION_EXTENSION: &str = "scsyndef";

/// Immutable named template for synths.
pub trait SynthPrototype: Send + Sync {
    fn name(&self) -> &str;

    fn parameters(&self) -> &ParameterTable;

    /// Bytes reserved from the node pool for one instance. Controls are
    /// stored inline, so by default this is the node footprint.
    fn instance_size(&self) -> usize {
        mem::size_of::<ServerNode>()
    }

    /// Build a ready-to-render synth for `node_id`.
    fn create_instance(&self, node_id: NodeId) -> Result<Synth, GraphError>;
}

/// Builds the unit graph of one synth instance.
pub trait UnitGraphBuilder: Send + Sync {
    fn build(&self, parameters: &ParameterTable) -> Result<Box<dyn UnitGraph>, String>;
}

impl<F> UnitGraphBuilder for F
where
    F: Fn(&ParameterTable) -> Result<Box<dyn UnitGraph>, String> + Send + Sync,
{
    fn build(&self, parameters: &ParameterTable) -> Result<Box<dyn UnitGraph>, String> {
        self(parameters)
    }
}

/// A decoded synth definition: what a [`DefinitionReader`] produces.
#[derive(Clone)]
pub struct SynthDefinition {
    name: String,
    parameters: ParameterTable,
    builder: Arc<dyn UnitGraphBuilder>,
}

impl SynthDefinition {
    pub fn new(
        name: impl Into<String>,
        parameters: ParameterTable,
        builder: impl UnitGraphBuilder + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            parameters,
            builder: Arc::new(builder),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }
}

impl fmt::Debug for SynthDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthDefinition")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Prototype backed by a synth definition.
pub struct DefinitionPrototype {
    name: Arc<str>,
    parameters: Arc<ParameterTable>,
    builder: Arc<dyn UnitGraphBuilder>,
}

impl From<SynthDefinition> for DefinitionPrototype {
    fn from(definition: SynthDefinition) -> Self {
        Self {
            name: Arc::from(definition.name),
            parameters: Arc::new(definition.parameters),
            builder: definition.builder,
        }
    }
}

impl SynthPrototype for DefinitionPrototype {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    fn create_instance(&self, node_id: NodeId) -> Result<Synth, GraphError> {
        let graph = self.builder.build(&self.parameters).map_err(|reason| {
            GraphError::InstantiationError(format!("{} (node {}): {}", self.name, node_id, reason))
        })?;
        Synth::new(
            Arc::clone(&self.name),
            Arc::clone(&self.parameters),
            graph,
        )
    }
}

impl fmt::Debug for DefinitionPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefinitionPrototype")
            .field("name", &self.name)
            .field("parameters", &self.parameters.len())
            .finish()
    }
}

/// Decodes definition blobs. Implemented by the definition-format crate.
pub trait DefinitionReader {
    fn read(&self, bytes: &[u8]) -> Result<Vec<SynthDefinition>, DefinitionError>;
}

/// Name → prototype mapping used to instantiate synths.
///
/// Registering a name that is already present replaces the old prototype:
/// the last registration wins. Synths already running keep the prototype they
/// were built from.
#[derive(Default)]
pub struct SynthFactory {
    prototypes: HashMap<String, Arc<dyn SynthPrototype>>,
}

impl SynthFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prototype, returning the one it replaced.
    pub fn register(
        &mut self,
        prototype: Arc<dyn SynthPrototype>,
    ) -> Option<Arc<dyn SynthPrototype>> {
        let name = prototype.name().to_string();
        let replaced = self.prototypes.insert(name.clone(), prototype);
        info!(prototype = %name, replaced = replaced.is_some(), "registered synth prototype");
        replaced
    }

    pub fn register_definition(
        &mut self,
        definition: SynthDefinition,
    ) -> Option<Arc<dyn SynthPrototype>> {
        self.register(Arc::new(DefinitionPrototype::from(definition)))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SynthPrototype>, GraphError> {
        self.prototypes
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::PrototypeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prototypes.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn SynthPrototype>> {
        self.prototypes.remove(name)
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prototypes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Decode `bytes` and register every definition found. Nothing is
    /// registered when the reader fails.
    pub fn load_definitions(
        &mut self,
        reader: &dyn DefinitionReader,
        bytes: &[u8],
    ) -> Result<usize, DefinitionError> {
        let definitions = reader.read(bytes)?;
        let count = definitions.len();
        for definition in definitions {
            self.register_definition(definition);
        }
        Ok(count)
    }

    pub fn load_definition_file(
        &mut self,
        reader: &dyn DefinitionReader,
        path: &Path,
    ) -> Result<usize, DefinitionError> {
        let bytes = std::fs::read(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let count = self.load_definitions(reader, &bytes)?;
        debug!(path = %path.display(), count, "loaded synth definitions");
        Ok(count)
    }

    /// Load every `.scsyndef` file below `dir`, recursing into subdirectories.
    pub fn load_definition_dir(
        &mut self,
        reader: &dyn DefinitionReader,
        dir: &Path,
    ) -> Result<usize, DefinitionError> {
        let mut entries = std::fs::read_dir(dir)
            .map_err(|source| DefinitionError::Read {
                path: dir.to_path_buf(),
                source,
            })?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.path());

        let mut count = 0;
        for entry in entries {
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                count += self.load_definition_dir(reader, &path)?;
            } else if path.extension().is_some_and(|ext| ext == DEFINITION_EXTENSION) {
                count += self.load_definition_file(reader, &path)?;
            }
        }
        info!(dir = %dir.display(), count, "loaded synth definition directory");
        Ok(count)
    }
}

impl fmt::Debug for SynthFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthFactory")
            .field("prototypes", &self.names())
            .finish()
    }
}

/// The built-in `sine` definition: `freq` (440 Hz) and `amp` (0.1) slots.
pub fn sine_definition(sample_rate: f32) -> SynthDefinition {
    let parameters: ParameterTable = [("freq", 440.0), ("amp", 0.1)].into_iter().collect();
    SynthDefinition::new(
        "sine",
        parameters,
        move |_: &ParameterTable| -> Result<Box<dyn UnitGraph>, String> {
            Ok(Box::new(SineVoice::new(sample_rate)))
        },
    )
}
