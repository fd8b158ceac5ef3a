//! Tests for the XML API loader and the model invariants it enforces

mod common;

use common::*;

use bgapi::api::ParamType;

#[test]
fn test_fixture_loads() {
    let api = test_api();
    assert_eq!(api.device_id, 1);
    assert_eq!(api.device_name, "test");
    assert_eq!(api.version.as_deref(), Some("1.0"));
    assert_eq!(api.classes().len(), 4);
}

#[test]
fn test_class_lookup_by_name_and_index() {
    let api = test_api();
    let simple = api.class("simple").expect("simple class");
    assert_eq!(simple.index, 1);
    assert_eq!(api.class_by_index(1).expect("class 1").name, "simple");
    assert!(api.class("nonexistent").is_none());
    assert!(api.class_by_index(99).is_none());
}

#[test]
fn test_command_and_event_dual_lookup() {
    let api = test_api();
    let simple = api.class("simple").expect("simple class");

    let returns = simple.command("returns").expect("returns command");
    assert_eq!(returns.index, 1);
    assert_eq!(simple.command_by_index(1).expect("command 1").name, "returns");
    assert_eq!(returns.params.len(), 1);
    assert_eq!(returns.returns.len(), 1);
    assert!(!returns.no_return);

    assert!(simple.command("no_return").expect("no_return command").no_return);
    assert!(simple.command("set_mode").is_none());

    let double = simple.event("double_uint8").expect("double_uint8 event");
    assert_eq!(double.index, 3);
    assert_eq!(double.params[1].name, "second");
    assert_eq!(simple.event_by_index(3).expect("event 3").name, "double_uint8");
}

#[test]
fn test_datatype_table() {
    let api = test_api();
    assert_eq!(api.datatype("errorcode").expect("errorcode").base, "uint16");
    assert_eq!(api.datatype("five_bytes_array").expect("five").length, 5);
    // length attribute accepts hex
    assert_eq!(api.datatype("ten_bytes_array").expect("ten").length, 10);

    let types = api.class("types").expect("types class");
    let five = types.command("five_bytes_array").expect("five command");
    assert_eq!(five.params[0].format, ParamType::ByteArray);
    assert_eq!(five.params[0].datatype.as_ref().expect("datatype").length, 5);
}

#[test]
fn test_enum_and_define_groups() {
    let api = test_api();
    let modes = api.class("modes").expect("modes class");

    let mode = modes.enum_group("mode").expect("mode group");
    assert_eq!(mode.member("on").expect("on").value, 1);
    // value attributes accept 0x and 0b forms
    assert_eq!(mode.member("auto").expect("auto").value, 2);
    assert_eq!(mode.member_by_value(0).expect("value 0").name, "off");

    let flags = modes.define_group("flags").expect("flags group");
    assert_eq!(flags.member("flag_c").expect("flag_c").value, 4);
    assert_eq!(flags.members().len(), 3);
}

#[test]
fn test_symbolic_constants_folded_per_class() {
    let api = test_api();
    let modes = api.class("modes").expect("modes class");
    assert_eq!(modes.constant("MODE_ON"), Some(1));
    assert_eq!(modes.constant("MODE_AUTO"), Some(2));
    assert_eq!(modes.constant("FLAGS_FLAG_C"), Some(4));
    assert_eq!(modes.constant("MODE_NOPE"), None);
}

#[test]
fn test_missing_required_attribute_rejected() {
    let err = DeviceApi::from_xml(r#"<api device_id="2"/>"#).expect_err("device_name is required");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);

    let err = DeviceApi::from_xml(
        r#"<api device_id="2" device_name="bad"><class name="noindex"/></api>"#,
    )
    .expect_err("class index is required");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_device_id_must_fit_header_field() {
    let err = DeviceApi::from_xml(r#"<api device_id="16" device_name="big"/>"#)
        .expect_err("device_id is a 4-bit field");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_duplicate_command_index_rejected() {
    let xml = r#"
        <api device_id="2" device_name="dup">
          <class index="1" name="clash">
            <command index="1" name="first"><params/><returns/></command>
            <command index="1" name="second"><params/><returns/></command>
          </class>
        </api>"#;
    let err = DeviceApi::from_xml(xml).expect_err("duplicate command index");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_duplicate_class_index_rejected() {
    let xml = r#"
        <api device_id="2" device_name="dup">
          <class index="1" name="first"/>
          <class index="1" name="second"/>
        </api>"#;
    let err = DeviceApi::from_xml(xml).expect_err("duplicate class index");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_dangling_validator_rejected() {
    let xml = r#"
        <api device_id="2" device_name="dangling">
          <class index="1" name="broken">
            <command index="1" name="cmd">
              <params>
                <param name="mode" type="uint8" validator_type="enum" validator_id="missing"/>
              </params>
            </command>
          </class>
        </api>"#;
    let err = DeviceApi::from_xml(xml).expect_err("validator must resolve");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_byte_array_needs_concrete_length() {
    let xml = r#"
        <api device_id="2" device_name="nolength">
          <class index="1" name="broken">
            <command index="1" name="cmd">
              <params>
                <param name="data" type="byte_array"/>
              </params>
            </command>
          </class>
        </api>"#;
    let err = DeviceApi::from_xml(xml).expect_err("byte_array needs a sized datatype");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_unrecognized_param_type_rejected() {
    let xml = r#"
        <api device_id="2" device_name="badtype">
          <class index="1" name="broken">
            <command index="1" name="cmd">
              <params>
                <param name="value" type="float32"/>
              </params>
            </command>
          </class>
        </api>"#;
    let err = DeviceApi::from_xml(xml).expect_err("unknown format tag");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}

#[test]
fn test_registry_lookup_and_duplicate_device_id() {
    let registry = test_registry();
    assert!(registry.contains_id(1));
    assert!(!registry.contains_id(2));
    assert_eq!(registry.by_name("test").expect("by name").device_id, 1);
    assert!(registry.by_id(1).is_some());

    let err = ApiRegistry::new([test_api(), test_api()]).expect_err("duplicate device id");
    assert!(matches!(err, BgError::ApiDescription(_)), "got {:?}", err);
}
