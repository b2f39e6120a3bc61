//! Handler functions and the context they run in.
//!
//! Handlers come in two forms: *plain* functions of the input alone, and
//! *bound* closures produced by a factory that captured extra arguments at
//! configuration time; bound handlers also receive the processing context
//! and may call back into the store. The built-in helpers at the bottom
//! cover the common topologies (field extraction, counting, summing,
//! joining source documents).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use futures::future::BoxFuture;
use serde_json::Value;

use qvarn_client::{Resource, Store};

/// Carried into every handler invocation: the store handle and the
/// resource type currently being processed.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub store: &'a dyn Store,
    pub source_resource_type: &'a str,
}

// ---------------------------------------------------------------------------
// Output normalization
// ---------------------------------------------------------------------------

/// Normalized map handler output: zero or more `(key, value)` pairs.
/// A single pair and a vector of pairs both convert via `Into`.
#[derive(Debug, Default)]
pub struct MapOutput {
    pairs: Vec<(Value, Value)>,
}

impl MapOutput {
    pub fn pair(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        MapOutput {
            pairs: vec![(key.into(), value.into())],
        }
    }

    pub fn pairs(pairs: Vec<(Value, Value)>) -> Self {
        MapOutput { pairs }
    }

    pub fn none() -> Self {
        MapOutput::default()
    }

    pub fn into_pairs(self) -> Vec<(Value, Value)> {
        self.pairs
    }
}

impl From<(Value, Value)> for MapOutput {
    fn from(pair: (Value, Value)) -> Self {
        MapOutput { pairs: vec![pair] }
    }
}

impl From<Vec<(Value, Value)>> for MapOutput {
    fn from(pairs: Vec<(Value, Value)>) -> Self {
        MapOutput { pairs }
    }
}

/// Wrap a scalar handler output as `{"_mr_value": v}`; spread a record
/// into the resource with `_mr_value` set to null.
pub(crate) fn normalized_payload(value: Value) -> Resource {
    match value {
        Value::Object(mut map) => {
            map.insert("_mr_value".to_string(), Value::Null);
            map
        }
        scalar => {
            let mut map = Resource::new();
            map.insert("_mr_value".to_string(), scalar);
            map
        }
    }
}

// ---------------------------------------------------------------------------
// Map handlers
// ---------------------------------------------------------------------------

type PlainMap = dyn Fn(&Resource) -> anyhow::Result<MapOutput> + Send + Sync;
type BoundMap = dyn for<'a> Fn(Context<'a>, &'a Resource) -> BoxFuture<'a, anyhow::Result<MapOutput>>
    + Send
    + Sync;

/// A map handler: source resource in, `(key, value)` pairs out.
#[derive(Clone)]
pub enum MapFn {
    Plain(Arc<PlainMap>),
    Bound(Arc<BoundMap>),
}

impl MapFn {
    pub fn plain<F, O>(f: F) -> Self
    where
        F: Fn(&Resource) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<MapOutput>,
    {
        MapFn::Plain(Arc::new(move |resource| f(resource).map(Into::into)))
    }

    pub fn bound<F>(f: F) -> Self
    where
        F: for<'a> Fn(Context<'a>, &'a Resource) -> BoxFuture<'a, anyhow::Result<MapOutput>>
            + Send
            + Sync
            + 'static,
    {
        MapFn::Bound(Arc::new(f))
    }

    pub async fn run(
        &self,
        context: Context<'_>,
        resource: &Resource,
    ) -> anyhow::Result<Vec<(Value, Value)>> {
        let output = match self {
            MapFn::Plain(f) => f(resource)?,
            MapFn::Bound(f) => f(context, resource).await?,
        };
        Ok(output.into_pairs())
    }
}

impl fmt::Debug for MapFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapFn::Plain(_) => f.write_str("MapFn::Plain"),
            MapFn::Bound(_) => f.write_str("MapFn::Bound"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reduce handlers
// ---------------------------------------------------------------------------

type PlainReduce = dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync;
type BoundReduce = dyn for<'a> Fn(Context<'a>, Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>>
    + Send
    + Sync;

/// A reduce handler: the mapped row ids for one key (or the pre-transform
/// output) in, a single reduced value out.
#[derive(Clone)]
pub enum ReduceFn {
    Plain(Arc<PlainReduce>),
    Bound(Arc<BoundReduce>),
}

impl ReduceFn {
    pub fn plain<F, O>(f: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Into<Value>,
    {
        ReduceFn::Plain(Arc::new(move |items| f(items).map(Into::into)))
    }

    pub fn bound<F>(f: F) -> Self
    where
        F: for<'a> Fn(Context<'a>, Vec<Value>) -> BoxFuture<'a, anyhow::Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        ReduceFn::Bound(Arc::new(f))
    }

    pub async fn run(&self, context: Context<'_>, items: Vec<Value>) -> anyhow::Result<Value> {
        match self {
            ReduceFn::Plain(f) => f(&items),
            ReduceFn::Bound(f) => f(context, items).await,
        }
    }
}

impl fmt::Debug for ReduceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceFn::Plain(_) => f.write_str("ReduceFn::Plain"),
            ReduceFn::Bound(_) => f.write_str("ReduceFn::Bound"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pre-reduce transform (the optional `map` of a reduce spec)
// ---------------------------------------------------------------------------

type PlainReduceMap = dyn Fn(Vec<Value>) -> anyhow::Result<Vec<Value>> + Send + Sync;
type BoundReduceMap = dyn for<'a> Fn(Context<'a>, Vec<Value>) -> BoxFuture<'a, anyhow::Result<Vec<Value>>>
    + Send
    + Sync;

/// Transforms the iterable of live mapped row ids before the reducer
/// consumes it (typically by loading the rows and projecting a field).
#[derive(Clone)]
pub enum ReduceMapFn {
    Plain(Arc<PlainReduceMap>),
    Bound(Arc<BoundReduceMap>),
}

impl ReduceMapFn {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        ReduceMapFn::Plain(Arc::new(f))
    }

    pub fn bound<F>(f: F) -> Self
    where
        F: for<'a> Fn(Context<'a>, Vec<Value>) -> BoxFuture<'a, anyhow::Result<Vec<Value>>>
            + Send
            + Sync
            + 'static,
    {
        ReduceMapFn::Bound(Arc::new(f))
    }

    pub async fn run(&self, context: Context<'_>, items: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        match self {
            ReduceMapFn::Plain(f) => f(items),
            ReduceMapFn::Bound(f) => f(context, items).await,
        }
    }
}

impl fmt::Debug for ReduceMapFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceMapFn::Plain(_) => f.write_str("ReduceMapFn::Plain"),
            ReduceMapFn::Bound(_) => f.write_str("ReduceMapFn::Bound"),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in helpers
// ---------------------------------------------------------------------------

fn field(resource: &Resource, name: &str) -> anyhow::Result<Value> {
    resource
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("resource has no field {name:?}"))
}

fn string_ids(items: &[Value]) -> anyhow::Result<Vec<String>> {
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("expected a resource id, got: {item}"))
        })
        .collect()
}

/// Map helper: emit `(resource[key], null)`.
pub fn item(key: &str) -> MapFn {
    let key = key.to_string();
    MapFn::plain(move |resource: &Resource| {
        Ok(MapOutput::from((field(resource, &key)?, Value::Null)))
    })
}

/// Map helper: emit `(resource[key], resource[value_field])`.
pub fn item_value(key: &str, value_field: &str) -> MapFn {
    let key = key.to_string();
    let value_field = value_field.to_string();
    MapFn::plain(move |resource: &Resource| {
        Ok(MapOutput::from((
            field(resource, &key)?,
            field(resource, &value_field)?,
        )))
    })
}

/// Pre-reduce transform: load the mapped rows and yield `_mr_value`.
pub fn value() -> ReduceMapFn {
    value_of("_mr_value")
}

/// Pre-reduce transform: load the mapped rows and yield the given field.
pub fn value_of(field_name: &str) -> ReduceMapFn {
    let field_name = field_name.to_string();
    ReduceMapFn::bound(move |context: Context<'_>, items: Vec<Value>| {
        let field_name = field_name.clone();
        Box::pin(async move {
            let ids = string_ids(&items)?;
            let rows = context
                .store
                .get_multiple(context.source_resource_type, &ids)
                .await?;
            Ok(rows
                .into_iter()
                .map(|row| row.get(&field_name).cloned().unwrap_or(Value::Null))
                .collect())
        })
    })
}

/// Reducer: the number of input items.
pub fn count() -> ReduceFn {
    ReduceFn::plain(|items: &[Value]| Ok(items.len() as i64))
}

/// Reducer: the numeric sum of the input items. Stays integral while every
/// input is integral.
pub fn sum_values() -> ReduceFn {
    ReduceFn::plain(|items: &[Value]| {
        let mut int_sum: i64 = 0;
        let mut float_sum: f64 = 0.0;
        let mut any_float = false;
        for item in items {
            if let Some(n) = item.as_i64() {
                int_sum += n;
            } else if let Some(f) = item.as_f64() {
                any_float = true;
                float_sum += f;
            } else {
                bail!("sum_values: non-numeric input: {item}");
            }
        }
        if any_float {
            Ok(Value::from(int_sum as f64 + float_sum))
        } else {
            Ok(Value::from(int_sum))
        }
    })
}

/// Field mapping for [`join`]: source document type → (field → optional
/// rename in the joined record).
pub type JoinMapping = BTreeMap<String, BTreeMap<String, Option<String>>>;

/// Reducer: merge fields of the source documents behind each mapped row
/// into a single record, per the mapping.
pub fn join(mapping: JoinMapping) -> ReduceFn {
    let mapping = Arc::new(mapping);
    ReduceFn::bound(move |context: Context<'_>, items: Vec<Value>| {
        let mapping = Arc::clone(&mapping);
        Box::pin(async move {
            let ids = string_ids(&items)?;
            let rows = context
                .store
                .get_multiple(context.source_resource_type, &ids)
                .await?;
            let mut result = Resource::new();
            for row in rows {
                let source_type = row
                    .get("_mr_source_type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("mapped row without _mr_source_type"))?
                    .to_string();
                let source_id = row
                    .get("_mr_source_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("mapped row without _mr_source_id"))?;
                let source = context.store.get(&source_type, source_id).await?;
                let doc_type = source
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(&source_type);
                if let Some(fields) = mapping.get(doc_type) {
                    for (field_name, rename) in fields {
                        let target = rename.clone().unwrap_or_else(|| field_name.clone());
                        result.insert(
                            target,
                            source.get(field_name).cloned().unwrap_or(Value::Null),
                        );
                    }
                }
            }
            Ok(Value::Object(result))
        })
    })
}
