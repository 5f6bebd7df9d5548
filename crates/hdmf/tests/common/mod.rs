//! Shared schema and graph fixtures.

#![allow(dead_code)]

use hdmf::{
    ContainerId, ContainerValue, Containers, FieldValue, HdmfIo, JsonOptions, MemoryBackend, MemoryStore, Namespace,
    NamespaceCatalog, RaggedColumn, TypeMap, TypeSpec, Value,
};
use serde_json::json;

pub const NAMESPACE: &str = "store";

/// `Series` (float64 data with a unit and an optional origin reference),
/// `Velocity` (a series with another default unit), `Bucket` (label, values,
/// a ragged column, series, nested buckets, an optional series link),
/// `Library` (a bucket with a curator) and `Holder` (a series inside the
/// untyped group `meta`, nested holders, an optional link to a holder).
pub fn specs() -> Vec<TypeSpec> {
    let groups = [
        json!({
            "data_type_def": "Bucket", "doc": "a bucket of series",
            "attributes": [{"name": "label", "dtype": "text", "doc": "bucket label"}],
            "datasets": [
                {"name": "values", "dtype": "int32", "doc": "plain values", "quantity": "?"},
                {"name": "spikes", "dtype": "int32", "doc": "spike times per unit", "quantity": "?"},
                {"data_type_inc": "Series", "doc": "owned series", "quantity": "*"}
            ],
            "groups": [{"data_type_inc": "Bucket", "doc": "nested buckets", "quantity": "*"}],
            "links": [{"name": "source_series", "target_type": "Series", "doc": "series this was derived from", "quantity": "?"}]
        }),
        json!({
            "data_type_def": "Library", "data_type_inc": "Bucket", "doc": "top-level bucket",
            "attributes": [{"name": "curator", "dtype": "text", "doc": "curator", "required": false}]
        }),
        json!({
            "data_type_def": "Holder", "doc": "keeps a series under an untyped group",
            "attributes": [{"name": "label", "dtype": "text", "doc": "holder label", "required": false}],
            "groups": [
                {
                    "name": "meta", "doc": "metadata", "quantity": "?",
                    "datasets": [
                        {"data_type_inc": "Series", "doc": "tracked series", "quantity": "?"},
                        {"name": "counts", "dtype": "int32", "doc": "counts", "quantity": "?"}
                    ]
                },
                {"data_type_inc": "Holder", "doc": "nested holders", "quantity": "*"}
            ],
            "links": [{"name": "owner", "target_type": "Holder", "doc": "holder this one belongs to", "quantity": "?"}]
        }),
    ];
    let datasets = [
        json!({
            "data_type_def": "Series", "doc": "a series of samples",
            "dtype": "float64", "shape": [null],
            "attributes": [
                {"name": "unit", "dtype": "text", "doc": "sample unit", "default_value": "m", "required": false},
                {"name": "origin", "dtype": {"target_type": "Series", "reftype": "object"}, "doc": "series this one was computed from", "required": false}
            ]
        }),
        json!({
            "data_type_def": "Velocity", "data_type_inc": "Series", "doc": "a velocity series",
            "attributes": [
                {"name": "unit", "dtype": "text", "doc": "sample unit", "default_value": "m/s", "required": false}
            ]
        }),
    ];
    let mut specs: Vec<TypeSpec> = groups.iter().map(|g| TypeSpec::group_from_json(g).unwrap()).collect();
    specs.extend(datasets.iter().map(|d| TypeSpec::dataset_from_json(d).unwrap()));
    specs
}

pub fn catalog() -> NamespaceCatalog {
    let mut catalog = NamespaceCatalog::new();
    catalog
        .register(Namespace::new(NAMESPACE, Some("1.0")).unwrap().specs("store.json", specs()))
        .unwrap();
    catalog
}

pub fn type_map() -> TypeMap {
    TypeMap::new(catalog())
}

pub fn series(tm: &TypeMap, cs: &mut Containers, data_type: &str, name: &str, data: Vec<f64>) -> ContainerId {
    series_with(tm, cs, data_type, name, data, vec![])
}

pub fn series_with(
    tm: &TypeMap,
    cs: &mut Containers,
    data_type: &str,
    name: &str,
    data: Vec<f64>,
    fields: Vec<(&str, FieldValue)>,
) -> ContainerId {
    let class = tm.get_class(data_type, NAMESPACE).unwrap();
    cs.create_data(&class, name, data, fields).unwrap()
}

pub fn bucket(tm: &TypeMap, cs: &mut Containers, data_type: &str, name: &str, fields: Vec<(&str, FieldValue)>) -> ContainerId {
    let class = tm.get_class(data_type, NAMESPACE).unwrap();
    cs.create(&class, name, fields).unwrap()
}

pub fn ragged(rows: &[&[i32]]) -> FieldValue {
    FieldValue::Ragged(RaggedColumn::from_rows(
        rows.iter()
            .map(|row| row.iter().map(|&v| ContainerValue::Int32(v)).collect::<Vec<_>>()),
    ))
}

/// Handles into the graph built by [`sample`].
pub struct Sample {
    pub root: ContainerId,
    pub first: ContainerId,
    pub second: ContainerId,
    pub inner: ContainerId,
    pub velocity: ContainerId,
}

/// A library with two series (the first referencing the second), a ragged
/// column and a nested bucket that owns a velocity series and links to the
/// first series.
pub fn sample(tm: &TypeMap, cs: &mut Containers) -> Sample {
    let second = series(tm, cs, "Series", "second", vec![0.5, 1.5]);
    let first = series_with(
        tm,
        cs,
        "Series",
        "first",
        vec![1.0, 2.0, 3.0],
        vec![("origin", FieldValue::value(Value::Ref(second)))],
    );
    let velocity = series(tm, cs, "Velocity", "velocity", vec![9.5]);
    let inner = bucket(
        tm,
        cs,
        "Bucket",
        "inner",
        vec![
            ("label", FieldValue::value("inner")),
            ("seriess", FieldValue::Children(vec![velocity])),
            ("source_series", FieldValue::Child(first)),
        ],
    );
    let root = bucket(
        tm,
        cs,
        "Library",
        "library",
        vec![
            ("label", FieldValue::value("main")),
            ("curator", FieldValue::value("ana")),
            ("values", FieldValue::value(vec![1i32, 2, 3])),
            ("spikes", ragged(&[&[1, 2], &[3], &[4, 5, 6]])),
            ("seriess", FieldValue::Children(vec![first, second])),
            ("buckets", FieldValue::Children(vec![inner])),
        ],
    );
    Sample {
        root,
        first,
        second,
        inner,
        velocity,
    }
}

pub fn memory_io(store: &MemoryStore, source: &str) -> HdmfIo<MemoryBackend> {
    HdmfIo::new(MemoryBackend::new(store.clone(), source, JsonOptions::default()))
}

/// Containers held by a child field.
pub fn children(cs: &Containers, id: ContainerId, field: &str) -> Vec<ContainerId> {
    cs.get(id)
        .and_then(|c| c.field(field))
        .map(|f| f.containers().to_vec())
        .unwrap_or_default()
}

/// A holder labelled `label` whose `meta` group owns `series` and a counts dataset.
pub fn holder(tm: &TypeMap, cs: &mut Containers, name: &str, label: &str, series: ContainerId) -> ContainerId {
    bucket(
        tm,
        cs,
        "Holder",
        name,
        vec![
            ("label", FieldValue::value(label)),
            ("meta__series", FieldValue::Child(series)),
            ("meta__counts", FieldValue::value(vec![4i32, 5])),
        ],
    )
}
