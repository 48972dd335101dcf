use std::rc::Rc;

use dmx_datamodel::codec::DeferredMode;
use dmx_datamodel::{Datamodel, Value};

fn populate_all_kinds(dm: &Datamodel, root: &dmx_datamodel::ElementHandle) {
    let member = dm.create_element("DmElement", "member", None).unwrap();
    dm.set_attribute(root, "members", Value::ElementArray(dmx_datamodel::ElementArray::from_vec(vec![Some(member)]))).unwrap();
    dm.set_attribute(root, "i", Value::Int32(-7)).unwrap();
    dm.set_attribute(root, "f", Value::Float32(1.5)).unwrap();
    dm.set_attribute(root, "b", Value::Bool(true)).unwrap();
    dm.set_attribute(root, "s", Value::String("hello".into())).unwrap();
    dm.set_attribute(root, "bin", Value::Binary(vec![1, 2, 3, 255])).unwrap();
    dm.set_attribute(root, "t", Value::TimeSpan(chrono::Duration::milliseconds(2500))).unwrap();
    dm.set_attribute(root, "color", Value::Color(dmx_datamodel::Color::new(10, 20, 30, 255))).unwrap();
    dm.set_attribute(root, "v2", Value::Vector2(dmx_datamodel::Vector2 { x: 1.0, y: 2.0 })).unwrap();
    dm.set_attribute(root, "v3", Value::Vector3(dmx_datamodel::Vector3 { x: 1.0, y: 2.0, z: 3.0 })).unwrap();
    dm.set_attribute(root, "v4", Value::Vector4(dmx_datamodel::Vector4 { x: 1.0, y: 2.0, z: 3.0, w: 4.0 })).unwrap();
    dm.set_attribute(root, "ang", Value::Angle(dmx_datamodel::Angle { pitch: 1.0, yaw: 2.0, roll: 3.0 })).unwrap();
    dm.set_attribute(root, "q", Value::Quaternion(dmx_datamodel::Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 })).unwrap();
    dm.set_attribute(root, "m", Value::Matrix4(dmx_datamodel::Matrix4::IDENTITY)).unwrap();
    dm.set_attribute(root, "ints", Value::Int32Array(vec![1, 2, 3])).unwrap();
    dm.set_attribute(root, "floats", Value::Float32Array(vec![1.0, 2.0, 3.0])).unwrap();
    dm.set_attribute(root, "bools", Value::BoolArray(vec![true, false])).unwrap();
    dm.set_attribute(root, "strings", Value::StringArray(vec!["a".into(), "b".into()])).unwrap();
}

fn assert_float_close(a: f32, b: f32) {
    assert!((a - b).abs() < 1e-5, "{a} vs {b}");
}

fn assert_all_kinds(root: &dmx_datamodel::ElementHandle) {
    let get = |name: &str| root.borrow_mut().get_attribute(name).unwrap();

    assert!(matches!(get("i"), Value::Int32(-7)));
    match get("f") {
        Value::Float32(v) => assert_float_close(v, 1.5),
        _ => panic!("expected float"),
    }
    assert!(matches!(get("b"), Value::Bool(true)));
    assert!(matches!(get("s"), Value::String(s) if s == "hello"));
    assert!(matches!(get("bin"), Value::Binary(v) if v == vec![1, 2, 3, 255]));
    match get("t") {
        Value::TimeSpan(d) => assert_eq!(d.num_milliseconds(), 2500),
        _ => panic!("expected time"),
    }
    match get("color") {
        Value::Color(c) => assert_eq!(c, dmx_datamodel::Color::new(10, 20, 30, 255)),
        _ => panic!("expected color"),
    }
    match get("v2") {
        Value::Vector2(v) => assert_eq!(v, dmx_datamodel::Vector2 { x: 1.0, y: 2.0 }),
        _ => panic!("expected vector2"),
    }
    match get("v3") {
        Value::Vector3(v) => assert_eq!(v, dmx_datamodel::Vector3 { x: 1.0, y: 2.0, z: 3.0 }),
        _ => panic!("expected vector3"),
    }
    match get("v4") {
        Value::Vector4(v) => assert_eq!(v, dmx_datamodel::Vector4 { x: 1.0, y: 2.0, z: 3.0, w: 4.0 }),
        _ => panic!("expected vector4"),
    }
    match get("ang") {
        Value::Angle(a) => assert_eq!(a, dmx_datamodel::Angle { pitch: 1.0, yaw: 2.0, roll: 3.0 }),
        _ => panic!("expected angle"),
    }
    match get("q") {
        Value::Quaternion(q) => assert_eq!(q, dmx_datamodel::Quaternion { x: 0.0, y: 0.0, z: 0.0, w: 1.0 }),
        _ => panic!("expected quaternion"),
    }
    match get("m") {
        Value::Matrix4(m) => assert_eq!(m, dmx_datamodel::Matrix4::IDENTITY),
        _ => panic!("expected matrix4"),
    }
    match get("ints") {
        Value::Int32Array(v) => assert_eq!(v, vec![1, 2, 3]),
        _ => panic!("expected int array"),
    }
    match get("floats") {
        Value::Float32Array(v) => {
            assert_eq!(v.len(), 3);
            for (a, b) in v.iter().zip([1.0, 2.0, 3.0]) {
                assert_float_close(*a, b);
            }
        }
        _ => panic!("expected float array"),
    }
    match get("bools") {
        Value::BoolArray(v) => assert_eq!(v, vec![true, false]),
        _ => panic!("expected bool array"),
    }
    match get("strings") {
        Value::StringArray(v) => assert_eq!(v, vec!["a".to_string(), "b".to_string()]),
        _ => panic!("expected string array"),
    }
    match get("members") {
        Value::ElementArray(array) => assert_eq!(array.len(), 1),
        _ => panic!("expected element array"),
    }
}

#[test]
fn populate_and_roundtrip_via_binary_v5() {
    let dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmElement", "root", None).unwrap();
    dm.set_root(&root).unwrap();
    populate_all_kinds(&dm, &root);

    let mut buf = Vec::new();
    dm.save(&mut buf, "binary", 5).unwrap();

    let loaded = Datamodel::load(buf, DeferredMode::Automatic).unwrap();
    let loaded_root = loaded.root().unwrap();
    assert_all_kinds(&loaded_root);
}

#[test]
fn populate_and_roundtrip_via_keyvalues2_v1() {
    let dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmElement", "root", None).unwrap();
    dm.set_root(&root).unwrap();
    populate_all_kinds(&dm, &root);

    let mut buf = Vec::new();
    dm.save(&mut buf, "keyvalues2", 1).unwrap();

    let loaded = Datamodel::load(buf, DeferredMode::Disabled).unwrap();
    let loaded_root = loaded.root().unwrap();
    assert_all_kinds(&loaded_root);
}

#[test]
fn stub_reference_resolves_through_user_supplied_resolver() {
    let dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmElement", "root", None).unwrap();
    dm.set_root(&root).unwrap();

    let external_id = uuid::Uuid::new_v4();
    let stub = dm.element(external_id);
    assert!(stub.is_none());

    // Reference an id that isn't registered yet: round-tripping through a
    // codec would normally create this stub; here we exercise the resolver
    // path directly by registering one and then requesting it. The resolver
    // creates the real element on the same datamodel, so it must not
    // deadlock against the borrow `on_stub_request` takes internally.
    let dm_for_resolver = dm.clone();
    dm.set_stub_resolver(move |id| {
        if id == external_id {
            dm_for_resolver.create_element("DmExternal", "resolved", Some(id)).ok()
        } else {
            None
        }
    });

    let resolved = dm.on_stub_request(external_id);
    assert!(resolved.is_some());
    assert!(!resolved.unwrap().borrow().is_stub());
}

#[test]
fn deferred_attribute_materializes_exactly_once() {
    let dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmElement", "root", None).unwrap();
    dm.set_root(&root).unwrap();
    let large: Vec<i32> = (0..128).collect();
    dm.set_attribute(&root, "bulk", Value::Int32Array(large.clone())).unwrap();

    let mut buf = Vec::new();
    dm.save(&mut buf, "binary", 5).unwrap();

    let loaded = Datamodel::load(buf, DeferredMode::Always).unwrap();
    let loaded_root = loaded.root().unwrap();

    assert!(loaded_root.borrow().attribute("bulk").unwrap().is_deferred());

    let first = loaded_root.borrow_mut().get_attribute("bulk").unwrap();
    assert!(matches!(first, Value::Int32Array(ref v) if *v == large));
    assert!(!loaded_root.borrow().attribute("bulk").unwrap().is_deferred());

    let second = loaded_root.borrow_mut().get_attribute("bulk").unwrap();
    assert!(matches!(second, Value::Int32Array(ref v) if *v == large));
}

#[test]
fn cross_datamodel_element_assignment_is_rejected_without_mutation() {
    let a = Datamodel::new("model", 1);
    let b = Datamodel::new("model", 1);

    let a_child = a.create_element("DmElement", "a-child", None).unwrap();
    let b_root = b.create_element("DmElement", "b-root", None).unwrap();
    b.set_root(&b_root).unwrap();

    let result = b.set_attribute(&b_root, "foreign", Value::Element(Some(a_child)));
    assert!(result.is_err());
    assert!(!b_root.borrow().has_attribute("foreign"));
}

#[test]
fn timespan_on_binary_v4_fails_to_encode() {
    let dm = Datamodel::new("model", 1);
    let root = dm.create_element("DmElement", "root", None).unwrap();
    dm.set_root(&root).unwrap();
    dm.set_attribute(&root, "t", Value::TimeSpan(chrono::Duration::seconds(1))).unwrap();

    let mut buf = Vec::new();
    assert!(dm.save(&mut buf, "binary", 4).is_err());
}

#[test]
fn loading_an_unregistered_encoding_fails_without_consuming_the_buffer() {
    let source = b"<!-- dmx encoding made_up_encoding 1 format model 1 -->\nrest-of-file".to_vec();
    let original_len = source.len();
    let result = Datamodel::load(source.clone(), DeferredMode::Automatic);
    assert!(result.is_err());
    assert_eq!(source.len(), original_len);
}

#[test]
fn same_element_compares_by_id_not_handle_identity() {
    let dm = Datamodel::new("model", 1);
    let id = uuid::Uuid::new_v4();
    let a = dm.create_element("DmElement", "a", Some(id)).unwrap();
    let b = dm.element(id).unwrap();
    assert!(dmx_datamodel::same_element(&a, &b));
    let _ = Rc::strong_count(&a);
}
