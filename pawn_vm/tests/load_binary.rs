//! Loading plugins from disk and running them.

use pawn_core::{smx, ErrorCode, Image, ImageBuilder, Opcode};
use pawn_vm::{EngineConfig, Environment};

fn greeter() -> Image {
    let mut b = ImageBuilder::new("greeter.smx");
    let greeting = b.data_string("hi there");
    let hits = b.data_cells(&[0]);
    b.pubvar("g_hits", hits);
    b.native("Print");
    b.public("OnPluginStart");
    b.begin_function("OnPluginStart");
    b.op1(Opcode::LoadPri, hits as i32);
    b.op(Opcode::IncPri);
    b.op1(Opcode::StorPri, hits as i32);
    b.op1(Opcode::PushC, greeting as i32);
    b.op2(Opcode::SysreqN, 0, 1);
    b.op(Opcode::Retn);
    b.end_function();
    b.build().unwrap()
}

#[test]
fn test_load_binary_and_run() {
    let dir = tempfile::tempdir().unwrap();
    for compress in [false, true] {
        let path = dir.path().join("greeter.smx");
        std::fs::write(&path, smx::write_image(&greeter(), compress).unwrap()).unwrap();

        let env = Environment::new(EngineConfig::default());
        let mut rt = env.load_binary(&path).unwrap();
        assert_eq!(rt.name(), "greeter.smx");
        rt.bind_native("Print", |rt, params| {
            rt.read_string(params[1] as u32).map_or(-1, |s| s.len() as i32)
        })
        .unwrap();

        for expected in 1..=3 {
            {
                let mut f = rt.find_function("OnPluginStart").unwrap();
                assert_eq!(f.execute().unwrap(), 8);
            }
            let hits = rt.find_pubvar("g_hits").unwrap();
            assert_eq!(rt.read_cell(hits).unwrap(), expected);
        }
    }
}

#[test]
fn test_load_binary_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::new(EngineConfig::interpreter_only());
    assert!(env.load_binary(dir.path().join("absent.smx")).is_err());
}

#[test]
fn test_load_binary_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.smx");
    std::fs::write(&path, vec![0xAB; 256]).unwrap();
    let env = Environment::new(EngineConfig::interpreter_only());
    let err = env.load_binary(&path).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileFormat);
}
