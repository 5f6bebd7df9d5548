//! Writing, reading and exporting container graphs through storage backends.

mod common;

use common::*;
use hdmf::limits::MAGIC_COMPRESSED;
use hdmf::{
    BuildManager, Config, Containers, ErrorKind, FieldValue, HdmfIo, JsonFileBackend, JsonOptions, MemoryBackend,
    MemoryStore, TypeMap, Value,
};

#[test]
fn test_memory_round_trip() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let store = MemoryStore::new();
    let mut io = memory_io(&store, "a.json");

    let mut mgr = BuildManager::new(&tm);
    io.write(&mut mgr, &mut cs, s.root).unwrap();
    assert!(store.contains("a.json"));
    assert!(!cs.get(s.root).unwrap().is_modified());

    let mut reader = BuildManager::new(&tm);
    let mut read = Containers::new();
    let root = io.read(&mut reader, &mut read).unwrap();
    assert!(cs.same_content(s.root, &read, root));
    assert_eq!(read.get(root).unwrap().container_source(), Some("a.json"));
    for id in read.descendants(root) {
        assert_eq!(read.get(id).unwrap().container_source(), Some("a.json"));
    }
}

#[test]
fn test_write_twice_is_stable() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let store = MemoryStore::new();
    let mut io = memory_io(&store, "a.json");
    let mut mgr = BuildManager::new(&tm);

    let first = io.write(&mut mgr, &mut cs, s.root).unwrap();
    let bytes = store.get("a.json").unwrap();
    let count = mgr.builders().len();

    let second = io.write(&mut mgr, &mut cs, s.root).unwrap();
    assert_eq!(first, second);
    assert_eq!(mgr.builders().len(), count);
    assert_eq!(store.get("a.json").unwrap(), bytes);
}

#[test]
fn test_compressed_round_trip() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let store = MemoryStore::new();
    let mut io = HdmfIo::new(MemoryBackend::new(store.clone(), "packed.json", JsonOptions::compressed()));
    let mut mgr = BuildManager::new(&tm);
    io.write(&mut mgr, &mut cs, s.root).unwrap();
    assert!(store.get("packed.json").unwrap().starts_with(MAGIC_COMPRESSED));

    // reading detects the compression on its own
    let mut plain = memory_io(&store, "packed.json");
    let mut reader = BuildManager::new(&tm);
    let mut read = Containers::new();
    let root = plain.read(&mut reader, &mut read).unwrap();
    assert!(cs.same_content(s.root, &read, root));
}

#[test]
fn test_file_round_trip() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let path = std::env::temp_dir().join(format!("hdmf-io-{}.json", std::process::id()));
    let mut io = HdmfIo::new(JsonFileBackend::new(&path, JsonOptions::default()));

    let mut mgr = BuildManager::new(&tm);
    io.write(&mut mgr, &mut cs, s.root).unwrap();
    let mut reader = BuildManager::new(&tm);
    let mut read = Containers::new();
    let root = io.read(&mut reader, &mut read).unwrap();
    std::fs::remove_file(&path).ok();

    assert!(cs.same_content(s.root, &read, root));
    assert_eq!(
        read.get(root).unwrap().container_source(),
        Some(path.display().to_string().as_str())
    );
}

#[test]
fn test_read_empty_source() {
    let tm = type_map();
    let mut io = memory_io(&MemoryStore::new(), "missing.json");
    let mut mgr = BuildManager::new(&tm);
    match io.read(&mut mgr, &mut Containers::new()) {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Backend),
        other => panic!("Expected a backend error, got {:?}", other),
    }
}

#[test]
fn test_export_leaves_source_untouched() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let store = MemoryStore::new();
    let mut src = memory_io(&store, "a.json");
    src.write(&mut BuildManager::new(&tm), &mut cs, s.root).unwrap();
    let original = store.get("a.json").unwrap();

    let mut reader = BuildManager::new(&tm);
    let mut read = Containers::new();
    let root = src.read(&mut reader, &mut read).unwrap();
    let velocity = children(&read, children(&read, root, "buckets")[0], "seriess")[0];
    read.set_field(velocity, "unit", FieldValue::value("km/h")).unwrap();

    let mut dst = memory_io(&store, "b.json");
    dst.export(&mut src, &reader, &mut read, Some(root)).unwrap();

    // the source file, the reading manager and the containers are unchanged
    assert_eq!(store.get("a.json").unwrap(), original);
    assert_eq!(read.get(root).unwrap().container_source(), Some("a.json"));
    assert_eq!(read.get(velocity).unwrap().container_source(), Some("a.json"));
    let old = reader.get_builder(velocity).unwrap();
    assert_eq!(
        reader.builders().node(old).attribute("unit"),
        Some(&Value::Text("m/s".into()))
    );
    assert_eq!(reader.builders().source(old), Some("a.json"));

    // the export carries the change
    let mut check = BuildManager::new(&tm);
    let mut exported = Containers::new();
    let copy = dst.read(&mut check, &mut exported).unwrap();
    assert!(read.same_content(root, &exported, copy));
    assert_eq!(exported.get(copy).unwrap().container_source(), Some("b.json"));
}

#[test]
fn test_write_and_export_after_modifying_holder() {
    let tm = type_map();
    let mut cs = Containers::new();
    let item = series(&tm, &mut cs, "Series", "item", vec![3.0]);
    let root = holder(&tm, &mut cs, "holder", "first", item);
    let store = MemoryStore::new();
    let mut src = memory_io(&store, "a.json");
    let mut writer = BuildManager::new(&tm);
    src.write(&mut writer, &mut cs, root).unwrap();

    // writing again after a change rebuilds the holder around the kept series
    cs.set_field(root, "label", FieldValue::value("second")).unwrap();
    src.write(&mut writer, &mut cs, root).unwrap();

    let mut reader = BuildManager::new(&tm);
    let mut read = Containers::new();
    let copy = src.read(&mut reader, &mut read).unwrap();
    assert!(cs.same_content(root, &read, copy));

    read.set_field(copy, "label", FieldValue::value("third")).unwrap();
    let mut dst = memory_io(&store, "b.json");
    dst.export(&mut src, &reader, &mut read, Some(copy)).unwrap();

    let mut check = BuildManager::new(&tm);
    let mut exported = Containers::new();
    let again = dst.read(&mut check, &mut exported).unwrap();
    assert!(read.same_content(copy, &exported, again));
    assert_eq!(
        exported.get(again).unwrap().field("label"),
        Some(&FieldValue::value("third"))
    );
    assert_eq!(children(&exported, again, "meta__series").len(), 1);
}

#[test]
fn test_export_whole_source() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let store = MemoryStore::new();
    let mut src = memory_io(&store, "a.json");
    src.write(&mut BuildManager::new(&tm), &mut cs, s.root).unwrap();

    let mut dst = memory_io(&store, "copy.json");
    dst.export(&mut src, &BuildManager::new(&tm), &mut Containers::new(), None)
        .unwrap();

    let mut reader = BuildManager::new(&tm);
    let mut read = Containers::new();
    let root = dst.read(&mut reader, &mut read).unwrap();
    assert!(cs.same_content(s.root, &read, root));
    assert_eq!(read.get(root).unwrap().container_source(), Some("copy.json"));
}

#[test]
fn test_export_of_unread_container() {
    let tm = type_map();
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let store = MemoryStore::new();
    let mut src = memory_io(&store, "a.json");
    let mut dst = memory_io(&store, "b.json");
    let err = dst
        .export(&mut src, &BuildManager::new(&tm), &mut cs, Some(s.root))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyWritten);
    assert!(!store.contains("b.json"));
}

#[test]
fn test_cross_file_link() {
    let tm = type_map();
    let store = MemoryStore::new();

    // a library file holding the series
    let mut cs = Containers::new();
    let s = sample(&tm, &mut cs);
    let mut lib_io = memory_io(&store, "lib.json");
    lib_io.write(&mut BuildManager::new(&tm), &mut cs, s.root).unwrap();

    // a second file whose bucket links into the library read back
    let mut mgr = BuildManager::new(&tm);
    let mut read = Containers::new();
    let lib = lib_io.read(&mut mgr, &mut read).unwrap();
    let first = children(&read, lib, "seriess")[0];
    let derived = bucket(
        &tm,
        &mut read,
        "Bucket",
        "derived",
        vec![("label", FieldValue::value("derived")), ("source_series", FieldValue::Child(first))],
    );
    let mut derived_io = memory_io(&store, "derived.json");
    derived_io.write(&mut mgr, &mut read, derived).unwrap();
    assert_eq!(read.get(first).unwrap().container_source(), Some("lib.json"));

    // both files are loaded into one manager before constructing
    let mut reader = BuildManager::new(&tm);
    let mut again = Containers::new();
    lib_io.read_builder(&mut reader).unwrap();
    let copy = derived_io.read(&mut reader, &mut again).unwrap();
    let Some(FieldValue::Child(target)) = again.get(copy).unwrap().field("source_series").cloned() else {
        panic!("Expected the link to be constructed");
    };
    let target = again.get(target).unwrap();
    assert_eq!(target.name(), "first");
    assert_eq!(target.object_id(), read.get(first).unwrap().object_id());
    assert_eq!(target.container_source(), Some("lib.json"));
}

#[test]
fn test_config_drives_conversion_and_compression() {
    let config = Config::from_json_str(
        r#"{"conversion": {"allow_narrowing": true}, "json": {"compress": true, "level": 5}}"#,
    )
    .unwrap();
    let tm = TypeMap::new(catalog()).with_policy(config.conversion_policy().unwrap());
    let mut cs = Containers::new();
    let root = bucket(
        &tm,
        &mut cs,
        "Bucket",
        "narrowed",
        vec![
            ("label", FieldValue::value("n")),
            ("values", FieldValue::value(vec![1.0f64, 2.0])),
        ],
    );

    let store = MemoryStore::new();
    let mut io = HdmfIo::new(MemoryBackend::new(store.clone(), "n.json", config.json));
    let mut mgr = BuildManager::new(&tm);
    let built = io.write(&mut mgr, &mut cs, root).unwrap();
    let values = mgr.builders().child(built, "values").unwrap();
    assert_eq!(
        mgr.builders().node(values).data(),
        Some(&Value::List(vec![Value::Int32(1), Value::Int32(2)]))
    );
    assert!(store.get("n.json").unwrap().starts_with(MAGIC_COMPRESSED));

    // the default policy refuses the same values
    let strict = type_map();
    let mut cs = Containers::new();
    let root = bucket(
        &strict,
        &mut cs,
        "Bucket",
        "strict",
        vec![
            ("label", FieldValue::value("s")),
            ("values", FieldValue::value(vec![1.0f64, 2.0])),
        ],
    );
    let err = BuildManager::new(&strict).build(&mut cs, root, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conversion);
}
