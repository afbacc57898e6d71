//! Writing images to disk and loading them back.

use pawn_core::{smx, CodeFlags, ErrorCode, Image, ImageBuilder, Opcode};

/// A plugin with two functions, globals, strings, natives and debug info.
fn plugin() -> Image {
    let mut b = ImageBuilder::new("plugin.smx");
    b.heap_size(32 * 1024);
    let greeting = b.data_string("hello");
    let count = b.data_cells(&[3, 1, 4, 1, 5]);
    b.pubvar("g_greeting", greeting);
    b.pubvar("g_count", count);
    b.native("PrintToServer");
    b.native("GetTime");
    b.source_file("plugin.sp");

    let helper = b.new_label();
    b.public("OnPluginStart");
    b.begin_function("OnPluginStart");
    b.source_line(4);
    b.op1(Opcode::PushC, greeting as i32);
    b.op2(Opcode::SysreqN, 0, 1);
    b.op1(Opcode::PushC, 0);
    b.call(helper);
    b.op(Opcode::Retn);
    b.end_function();

    b.bind(helper);
    b.begin_function("Helper");
    b.source_line(11);
    b.op1(Opcode::LoadPri, count as i32);
    b.op(Opcode::Retn);
    b.end_function();
    b.build().unwrap()
}

fn assert_same(a: &Image, b: &Image) {
    assert_eq!(a.code(), b.code());
    assert_eq!(a.data(), b.data());
    assert_eq!(a.heap_size(), b.heap_size());
    assert_eq!(a.natives(), b.natives());
    assert_eq!(a.publics(), b.publics());
    assert_eq!(a.pubvars(), b.pubvars());
    assert_eq!(a.flags(), b.flags());
}

#[test]
fn test_file_roundtrip_both_encodings() {
    let dir = tempfile::tempdir().unwrap();
    let image = plugin();
    for compress in [false, true] {
        let path = dir.path().join(format!("plugin-{compress}.smx"));
        std::fs::write(&path, smx::write_image(&image, compress).unwrap()).unwrap();
        let loaded = smx::load_file(&path).unwrap();
        assert_same(&image, &loaded);
        assert_eq!(loaded.name(), format!("plugin-{compress}.smx"));
    }
}

#[test]
fn test_debug_info_survives_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugin.smx");
    std::fs::write(&path, smx::write_image(&plugin(), true).unwrap()).unwrap();
    let loaded = smx::load_file(&path).unwrap();

    assert!(loaded.flags().contains(CodeFlags::DEBUG));
    let last = loaded.code_size() - 4;
    assert_eq!(loaded.function_name_at(last), Some("Helper"));
    assert_eq!(loaded.function_name_at(4), Some("OnPluginStart"));
    let debug = loaded.debug().unwrap();
    assert_eq!(debug.lookup_file(4), Some("plugin.sp"));
    assert_eq!(debug.lookup_line(4), Some(5));
}

#[test]
fn test_compression_shrinks_repetitive_data() {
    let mut b = ImageBuilder::new("big");
    b.data_cells(&[0x1234_5678; 4096]);
    b.public("main");
    b.begin_function("main");
    b.op(Opcode::Retn);
    let image = b.build().unwrap();
    let plain = smx::write_image(&image, false).unwrap();
    let packed = smx::write_image(&image, true).unwrap();
    assert!(packed.len() < plain.len() / 4);
    assert_same(&image, &smx::load_image("big", &packed).unwrap());
}

#[test]
fn test_truncated_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.smx");
    let bytes = smx::write_image(&plugin(), false).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    let err = smx::load_file(&path).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileFormat);
}

#[test]
fn test_empty_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let err = smx::load_file(file.path()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileFormat);
}
