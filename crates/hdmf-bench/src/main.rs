//! Round-trip benchmark for the build layer.
//!
//! Generates a library of buckets holding sampled series, then times
//! building, writing and reading it through the in-memory backend, with and
//! without compression.
//!
//! Usage: `bench-roundtrip [buckets] [series-per-bucket] [samples-per-series]`

use std::time::{Duration, Instant};

use hdmf::{
    BuildManager, ContainerId, Containers, FieldValue, HdmfIo, JsonOptions, MemoryBackend, MemoryStore, Namespace,
    NamespaceCatalog, TypeMap, TypeSpec, Value,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const NAMESPACE: &str = "bench";

// =============================================================================
// SCHEMA
// =============================================================================

fn catalog() -> NamespaceCatalog {
    let series = TypeSpec::dataset_from_json(&json!({
        "data_type_def": "Series", "doc": "sampled values",
        "dtype": "float64", "shape": [null],
        "attributes": [
            {"name": "unit", "dtype": "text", "doc": "sample unit", "default_value": "m", "required": false},
            {"name": "origin", "dtype": {"target_type": "Series", "reftype": "object"}, "doc": "source series", "required": false}
        ]
    }))
    .expect("Series spec");
    let bucket = TypeSpec::group_from_json(&json!({
        "data_type_def": "Bucket", "doc": "a bucket of series",
        "attributes": [{"name": "label", "dtype": "text", "doc": "bucket label"}],
        "datasets": [
            {"name": "counts", "dtype": "int32", "doc": "per-series sample counts", "quantity": "?"},
            {"data_type_inc": "Series", "doc": "owned series", "quantity": "*"}
        ],
        "groups": [{"data_type_inc": "Bucket", "doc": "nested buckets", "quantity": "*"}]
    }))
    .expect("Bucket spec");

    let mut catalog = NamespaceCatalog::new();
    catalog
        .register(
            Namespace::new(NAMESPACE, Some("0.1"))
                .expect("namespace")
                .specs("bench.json", vec![bucket, series]),
        )
        .expect("register namespace");
    catalog
}

// =============================================================================
// GRAPH
// =============================================================================

fn generate(tm: &TypeMap, cs: &mut Containers, buckets: usize, per_bucket: usize, samples: usize) -> ContainerId {
    let series_class = tm.get_class("Series", NAMESPACE).expect("Series class");
    let bucket_class = tm.get_class("Bucket", NAMESPACE).expect("Bucket class");

    let mut children = Vec::with_capacity(buckets);
    for b in 0..buckets {
        let mut owned: Vec<ContainerId> = Vec::with_capacity(per_bucket);
        for s in 0..per_bucket {
            let data: Vec<f64> = (0..samples).map(|i| (b * per_bucket + s + i) as f64 * 0.25).collect();
            // each series after the first points back at its predecessor
            let fields = match owned.last() {
                Some(&prev) => vec![("origin", FieldValue::value(Value::Ref(prev)))],
                None => vec![],
            };
            let id = cs
                .create_data(&series_class, &format!("series_{s}"), data, fields)
                .expect("create series");
            owned.push(id);
        }
        let counts = vec![samples as i32; per_bucket];
        let id = cs
            .create(
                &bucket_class,
                &format!("bucket_{b}"),
                vec![
                    ("label", FieldValue::value(format!("bucket {b}").as_str())),
                    ("counts", FieldValue::value(counts)),
                    ("seriess", FieldValue::Children(owned)),
                ],
            )
            .expect("create bucket");
        children.push(id);
    }

    cs.create(
        &bucket_class,
        "root",
        vec![
            ("label", FieldValue::value("root")),
            ("buckets", FieldValue::Children(children)),
        ],
    )
    .expect("create root")
}

// =============================================================================
// ROUND TRIP
// =============================================================================

struct Timings {
    write: Duration,
    rewrite: Duration,
    read: Duration,
    bytes: usize,
}

fn round_trip(tm: &TypeMap, cs: &mut Containers, root: ContainerId, options: JsonOptions) -> Timings {
    let store = MemoryStore::new();
    let mut io = HdmfIo::new(MemoryBackend::new(store.clone(), "bench.json", options));
    let mut mgr = BuildManager::new(tm);

    let start = Instant::now();
    io.write(&mut mgr, cs, root).expect("write");
    let write = start.elapsed();

    // unchanged graph: every builder comes from the memo
    let start = Instant::now();
    io.write(&mut mgr, cs, root).expect("rewrite");
    let rewrite = start.elapsed();

    let bytes = store.get("bench.json").map(|b| b.len()).unwrap_or(0);

    let mut reader = BuildManager::new(tm);
    let mut read = Containers::new();
    let start = Instant::now();
    let copy = io.read(&mut reader, &mut read).expect("read");
    let read_time = start.elapsed();
    assert!(cs.same_content(root, &read, copy), "round trip changed the graph");

    Timings {
        write,
        rewrite,
        read: read_time,
        bytes,
    }
}

fn report(label: &str, t: &Timings) {
    println!("\n{}: {} bytes", label, t.bytes);
    println!("  Write:   {:?}", t.write);
    println!("  Rewrite: {:?}", t.rewrite);
    println!("  Read:    {:?}", t.read);
    println!(
        "  Throughput: {:.2} MB/s write, {:.2} MB/s read",
        (t.bytes as f64 / 1_000_000.0) / t.write.as_secs_f64(),
        (t.bytes as f64 / 1_000_000.0) / t.read.as_secs_f64()
    );
}

fn arg(n: usize, default: usize) -> usize {
    std::env::args()
        .nth(n)
        .and_then(|a| a.parse().ok())
        .unwrap_or(default)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let buckets = arg(1, 200);
    let per_bucket = arg(2, 20);
    let samples = arg(3, 64);

    let tm = TypeMap::new(catalog());
    let mut cs = Containers::new();

    let start = Instant::now();
    let root = generate(&tm, &mut cs, buckets, per_bucket, samples);
    println!(
        "Generated {} containers ({} buckets x {} series x {} samples) in {:?}",
        cs.len(),
        buckets,
        per_bucket,
        samples,
        start.elapsed()
    );

    let plain = round_trip(&tm, &mut cs, root, JsonOptions::default());
    report("Uncompressed", &plain);

    let packed = round_trip(&tm, &mut cs, root, JsonOptions::compressed());
    report("Compressed (zstd)", &packed);

    println!(
        "\nCompression ratio: {:.1}%",
        packed.bytes as f64 / plain.bytes.max(1) as f64 * 100.0
    );
}
