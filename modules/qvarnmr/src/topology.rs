//! Declarative map/reduce topology: which targets are derived from which
//! sources, by which handlers, at which version.

use std::collections::{BTreeMap, BTreeSet};

use crate::clock;
use crate::error::{Error, Result};
use crate::handlers::{MapFn, ReduceFn, ReduceMapFn};

#[derive(Debug, Clone)]
pub struct MapSpec {
    pub version: i64,
    pub handler: MapFn,
}

#[derive(Debug, Clone)]
pub struct ReduceSpec {
    pub version: i64,
    pub handler: ReduceFn,
    /// Optional transform applied to the mapped row ids before the reducer.
    pub map: Option<ReduceMapFn>,
}

#[derive(Debug, Clone)]
pub enum HandlerSpec {
    Map(MapSpec),
    Reduce(ReduceSpec),
}

impl HandlerSpec {
    pub fn map(version: i64, handler: MapFn) -> Self {
        HandlerSpec::Map(MapSpec { version, handler })
    }

    pub fn reduce(version: i64, handler: ReduceFn) -> Self {
        HandlerSpec::Reduce(ReduceSpec {
            version,
            handler,
            map: None,
        })
    }

    pub fn reduce_with_map(version: i64, handler: ReduceFn, map: ReduceMapFn) -> Self {
        HandlerSpec::Reduce(ReduceSpec {
            version,
            handler,
            map: Some(map),
        })
    }

    pub fn version(&self) -> i64 {
        match self {
            HandlerSpec::Map(spec) => spec.version,
            HandlerSpec::Reduce(spec) => spec.version,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            HandlerSpec::Map(_) => "map",
            HandlerSpec::Reduce(_) => "reduce",
        }
    }
}

/// Two-level mapping: target resource type → source resource type →
/// handler spec.
pub type HandlersConfig = BTreeMap<String, BTreeMap<String, HandlerSpec>>;

/// A validated topology with its derived lookup tables.
#[derive(Debug)]
pub struct Topology {
    config: HandlersConfig,
    mappers: BTreeMap<String, Vec<(String, MapSpec)>>,
    reducers: BTreeMap<String, Vec<(String, ReduceSpec)>>,
    /// Source types consumed by some reduce handler.
    reduce_sources: BTreeSet<String>,
}

impl Topology {
    pub fn new(config: HandlersConfig) -> Result<Self> {
        clock::check_resolution()?;
        validate_handlers(&config)?;

        let mut mappers: BTreeMap<String, Vec<(String, MapSpec)>> = BTreeMap::new();
        let mut reducers: BTreeMap<String, Vec<(String, ReduceSpec)>> = BTreeMap::new();
        let mut reduce_sources = BTreeSet::new();
        for (target, sources) in &config {
            for (source, spec) in sources {
                match spec {
                    HandlerSpec::Map(spec) => {
                        mappers
                            .entry(source.clone())
                            .or_default()
                            .push((target.clone(), spec.clone()));
                    }
                    HandlerSpec::Reduce(spec) => {
                        reducers
                            .entry(source.clone())
                            .or_default()
                            .push((target.clone(), spec.clone()));
                        reduce_sources.insert(source.clone());
                    }
                }
            }
        }

        Ok(Self {
            config,
            mappers,
            reducers,
            reduce_sources,
        })
    }

    /// Map handlers whose source is the given resource type.
    pub fn mappers_for(&self, source: &str) -> &[(String, MapSpec)] {
        self.mappers.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reduce handlers whose source is the given resource type.
    pub fn reducers_for(&self, source: &str) -> &[(String, ReduceSpec)] {
        self.reducers.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Is this resource type consumed by some reduce handler?
    pub fn is_reduce_source(&self, resource_type: &str) -> bool {
        self.reduce_sources.contains(resource_type)
    }

    /// The map spec registered for `target ← source`, if any.
    pub fn map_spec(&self, target: &str, source: &str) -> Option<&MapSpec> {
        match self.config.get(target)?.get(source)? {
            HandlerSpec::Map(spec) => Some(spec),
            HandlerSpec::Reduce(_) => None,
        }
    }

    /// The reduce spec registered for `target ← source`, if any.
    pub fn reduce_spec(&self, target: &str, source: &str) -> Option<&ReduceSpec> {
        match self.config.get(target)?.get(source)? {
            HandlerSpec::Reduce(spec) => Some(spec),
            HandlerSpec::Map(_) => None,
        }
    }

    /// Every distinct source resource type in the topology.
    pub fn source_types(&self) -> BTreeSet<String> {
        self.config
            .values()
            .flat_map(|sources| sources.keys().cloned())
            .collect()
    }

    /// Every `(target, source, spec)` triple.
    pub fn handlers(&self) -> impl Iterator<Item = (&str, &str, &HandlerSpec)> {
        self.config.iter().flat_map(|(target, sources)| {
            sources
                .iter()
                .map(move |(source, spec)| (target.as_str(), source.as_str(), spec))
        })
    }
}

fn validate_handlers(config: &HandlersConfig) -> Result<()> {
    let mut target_kinds: BTreeMap<&str, &'static str> = BTreeMap::new();
    for (target, sources) in config {
        let kinds: BTreeSet<&'static str> = sources.values().map(HandlerSpec::kind).collect();
        if kinds.is_empty() {
            return Err(Error::Config(format!(
                "Handler configuration error: {target}: target has no sources."
            )));
        }
        if kinds.len() > 1 {
            return Err(Error::Config(format!(
                "Handler configuration error: {target}: all handlers of a single target must \
                 have same type, but there is more than one type used."
            )));
        }
        let kind = kinds
            .into_iter()
            .next()
            .unwrap_or("map");
        target_kinds.insert(target, kind);

        if kind == "reduce" && sources.len() != 1 {
            return Err(Error::Config(format!(
                "Handler configuration error: {target}: currently only one handler is supported \
                 for reduce target, but {n_sources} sources found.",
                n_sources = sources.len(),
            )));
        }
    }

    for (target, sources) in config {
        for (source, spec) in sources {
            if matches!(spec, HandlerSpec::Reduce(_))
                && target_kinds.get(source.as_str()) != Some(&"map")
            {
                return Err(Error::Config(format!(
                    "Handler configuration error: {target} <- {source}: source resource \
                     ({source}) for reduce target ({target}) must be defined as map target \
                     resource."
                )));
            }
        }
    }

    Ok(())
}

/// Named topologies resolvable from the `HANDLERS` CLI argument. Rust has
/// no runtime module import, so deployments register their topologies at
/// compile time and wrap [`crate::worker::cli_main`] in a thin `main`.
#[derive(Default)]
pub struct TopologyRegistry {
    topologies: BTreeMap<String, HandlersConfig>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, config: HandlersConfig) {
        self.topologies.insert(name.to_string(), config);
    }

    pub fn resolve(&self, name: &str) -> Result<&HandlersConfig> {
        self.topologies.get(name).ok_or_else(|| {
            Error::Config(format!(
                "unknown handlers name: {name:?} (registered: {:?})",
                self.topologies.keys().collect::<Vec<_>>()
            ))
        })
    }
}
