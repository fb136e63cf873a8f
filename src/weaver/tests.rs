use std::borrow::Cow;

use super::*;
use crate::classfile::bytes::ByteWriter;
use crate::classfile::frames::{parse_stack_map_table, FrameKind, VerificationType};
use crate::classfile::insn::{decode, opcodes, Instruction};
use crate::classfile::{
    AttributeInfo, Constant, ConstantPool, ExceptionEntry, MemberInfo, ACC_STATIC,
};

const PUBLIC: u16 = 0x0001;

/// Minimal class assembler for weaver tests.
struct TestClass {
    pool: ConstantPool,
    name: &'static str,
    major: u16,
    methods: Vec<MemberInfo>,
}

impl TestClass {
    fn new(name: &'static str, major: u16) -> Self {
        Self {
            pool: ConstantPool::new(),
            name,
            major,
            methods: Vec::new(),
        }
    }

    fn attribute(&mut self, name: &str, info: Vec<u8>) -> AttributeInfo {
        AttributeInfo {
            name_index: self.pool.add_utf8(name).unwrap(),
            info,
        }
    }

    fn method(&mut self, flags: u16, name: &str, descriptor: &str, code: Option<CodeAttribute>) {
        let name_index = self.pool.add_utf8(name).unwrap();
        let descriptor_index = self.pool.add_utf8(descriptor).unwrap();
        let attributes = match code {
            Some(code) => {
                let info = code.to_bytes().unwrap();
                vec![self.attribute("Code", info)]
            }
            None => vec![],
        };
        self.methods.push(MemberInfo {
            access_flags: flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    fn build(mut self) -> Vec<u8> {
        let this_class = self.pool.add_class(self.name).unwrap();
        let super_class = self.pool.add_class("java/lang/Object").unwrap();
        ClassFile {
            minor_version: 0,
            major_version: self.major,
            constant_pool: self.pool,
            access_flags: 0x0021,
            this_class,
            super_class,
            interfaces: vec![],
            fields: vec![],
            methods: self.methods,
            attributes: vec![],
        }
        .to_bytes()
        .unwrap()
    }
}

fn code(max_stack: u16, max_locals: u16, bytes: Vec<u8>) -> CodeAttribute {
    CodeAttribute {
        max_stack,
        max_locals,
        code: bytes,
        exception_table: vec![],
        attributes: vec![],
    }
}

/// `int compute(int)`: `return x != 0 ? 1 : 0` with a frame and line numbers.
fn add_compute(class: &mut TestClass) {
    // 0 iload_1, 1 ifeq 6, 4 iconst_1, 5 ireturn, 6 iconst_0, 7 ireturn
    let mut body = code(1, 2, vec![0x1b, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac]);
    body.attributes.push(class.attribute("StackMapTable", vec![0x00, 0x01, 6]));
    let mut lines = Vec::new();
    lines.put_u16(2);
    lines.put_u16(0);
    lines.put_u16(10);
    lines.put_u16(6);
    lines.put_u16(11);
    body.attributes.push(class.attribute("LineNumberTable", lines));
    class.method(PUBLIC, "compute", "(I)I", Some(body));
}

/// `void fail()`: `throw new IllegalStateException()`
fn add_fail(class: &mut TestClass) {
    let exception = class.pool.add_class("java/lang/IllegalStateException").unwrap();
    let init = class
        .pool
        .add_methodref("java/lang/IllegalStateException", "<init>", "()V")
        .unwrap();
    let [ch, cl] = exception.to_be_bytes();
    let [ih, il] = init.to_be_bytes();
    let body = code(2, 1, vec![opcodes::NEW, ch, cl, opcodes::DUP, 0xb7, ih, il, opcodes::ATHROW]);
    class.method(PUBLIC, "fail", "()V", Some(body));
}

fn add_untouchables(class: &mut TestClass) {
    let object_init = class.pool.add_methodref("java/lang/Object", "<init>", "()V").unwrap();
    let [h, l] = object_init.to_be_bytes();
    class.method(PUBLIC, "<init>", "()V", Some(code(1, 1, vec![0x2a, 0xb7, h, l, 0xb1])));
    class.method(PUBLIC | ACC_STATIC, "main", "([Ljava/lang/String;)V", Some(code(0, 1, vec![0xb1])));
    class.method(PUBLIC, "getMetaClass", "()Ljava/lang/Object;", Some(code(1, 1, vec![0x01, 0xb0])));
    class.method(PUBLIC | 0x0400, "plan", "()V", None);
}

fn sample_class() -> Vec<u8> {
    let mut class = TestClass::new("demo/Calc", 52);
    add_untouchables(&mut class);
    add_compute(&mut class);
    add_fail(&mut class);
    class.build()
}

fn method_code(class: &ClassFile, name: &str) -> CodeAttribute {
    let method = class
        .methods
        .iter()
        .find(|m| m.name(&class.constant_pool).unwrap() == name)
        .unwrap();
    let index = method.find_attribute(&class.constant_pool, "Code").unwrap().unwrap();
    CodeAttribute::parse(&method.attributes[index].info).unwrap()
}

fn operand(insn: &Instruction) -> u16 {
    match insn {
        Instruction::Simple(bytes) => u16::from_be_bytes([bytes[1], bytes[2]]),
        other => panic!("not a simple instruction: {:?}", other),
    }
}

/// `owner.name` of an `invokestatic`.
fn invoked(pool: &ConstantPool, insn: &Instruction) -> String {
    assert_eq!(insn.opcode(), opcodes::INVOKESTATIC);
    match pool.get(operand(insn)).unwrap() {
        Constant::Methodref { class, name_and_type } => {
            let owner = pool.class_name(*class).unwrap();
            let name = match pool.get(*name_and_type).unwrap() {
                Constant::NameAndType { name, .. } => pool.utf8(*name).unwrap(),
                other => panic!("unexpected {:?}", other),
            };
            format!("{}.{}", owner, name)
        }
        other => panic!("unexpected {:?}", other),
    }
}

fn loaded_string(pool: &ConstantPool, insn: &Instruction) -> String {
    assert_eq!(insn.opcode(), opcodes::LDC_W);
    match pool.get(operand(insn)).unwrap() {
        Constant::String(utf8) => pool.utf8(*utf8).unwrap(),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_instruments_only_weavable_methods() {
    let woven = Weaver::default().weave(&sample_class()).unwrap().unwrap();
    assert_eq!(woven.class_name, "demo.Calc");
    assert_eq!(woven.instrumented, vec!["demo.Calc.compute(int)", "demo.Calc.fail()"]);

    let class = ClassFile::parse(&woven.bytes).unwrap();
    assert_eq!(method_code(&class, "main").code, vec![0xb1]);
    assert_eq!(method_code(&class, "<init>").code.len(), 5);
    assert_eq!(method_code(&class, "getMetaClass").code, vec![0x01, 0xb0]);
}

#[test]
fn test_entry_and_every_return_are_probed() {
    let woven = Weaver::default().weave(&sample_class()).unwrap().unwrap();
    let class = ClassFile::parse(&woven.bytes).unwrap();
    let pool = &class.constant_pool;
    let body = method_code(&class, "compute");
    let insns: Vec<Instruction> = decode(&body.code).unwrap().into_iter().map(|(_, i)| i).collect();

    assert_eq!(loaded_string(pool, &insns[0]), "demo.Calc.compute(int)");
    assert_eq!(invoked(pool, &insns[1]), "spotlight/agent/TraceGate.triggerStart");

    let mut returns = 0;
    for (i, insn) in insns.iter().enumerate() {
        if insn.is_return() {
            returns += 1;
            assert_eq!(loaded_string(pool, &insns[i - 2]), "demo.Calc.compute(int)");
            assert_eq!(invoked(pool, &insns[i - 1]), "spotlight/agent/TraceGate.triggerEnd");
        }
    }
    assert_eq!(returns, 2);
}

#[test]
fn test_branches_land_on_exit_probe() {
    let woven = Weaver::default().weave(&sample_class()).unwrap().unwrap();
    let class = ClassFile::parse(&woven.bytes).unwrap();
    let body = method_code(&class, "compute");
    let insns = decode(&body.code).unwrap();

    // 0 ldc_w, 3 invokestatic, 6 iload_1, 7 ifeq, 10 iconst_1, 11 ldc_w,
    // 14 invokestatic, 17 ireturn, 18 iconst_0, 19 ldc_w, 22 invokestatic, 25 ireturn
    let (at, branch) = &insns[3];
    assert_eq!(*at, 7);
    assert_eq!(
        *branch,
        Instruction::Branch {
            opcode: opcodes::IFEQ,
            target: 18
        }
    );
    assert_eq!(insns[7].0, 18);
}

#[test]
fn test_catch_all_handler_reports_and_rethrows() {
    let woven = Weaver::default().weave(&sample_class()).unwrap().unwrap();
    let class = ClassFile::parse(&woven.bytes).unwrap();
    let pool = &class.constant_pool;
    let body = method_code(&class, "compute");

    assert_eq!(body.exception_table.len(), 1);
    let entry = body.exception_table[0];
    assert_eq!(
        entry,
        ExceptionEntry {
            start_pc: 6,
            end_pc: 26,
            handler_pc: 26,
            catch_type: 0
        }
    );

    let handler: Vec<Instruction> = decode(&body.code[26..]).unwrap().into_iter().map(|(_, i)| i).collect();
    assert_eq!(handler.len(), 4);
    assert_eq!(handler[0], Instruction::op(opcodes::DUP));
    assert_eq!(loaded_string(pool, &handler[1]), "demo.Calc.compute(int)");
    assert_eq!(invoked(pool, &handler[2]), "spotlight/agent/TraceGate.triggerEndWithError");
    assert_eq!(handler[3], Instruction::op(opcodes::ATHROW));

    assert_eq!(body.max_stack, 3);
    assert_eq!(body.max_locals, 2);
}

#[test]
fn test_frames_and_line_numbers_are_remapped() {
    let woven = Weaver::default().weave(&sample_class()).unwrap().unwrap();
    let class = ClassFile::parse(&woven.bytes).unwrap();
    let pool = &class.constant_pool;
    let body = method_code(&class, "compute");

    let mut frames = None;
    let mut lines = None;
    for attribute in &body.attributes {
        match attribute.name(pool).unwrap().as_str() {
            "StackMapTable" => frames = Some(parse_stack_map_table(&attribute.info).unwrap()),
            "LineNumberTable" => lines = Some(attribute.info.clone()),
            _ => {}
        }
    }

    let frames = frames.unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].offset, 18);
    assert_eq!(frames[0].kind, FrameKind::Same);
    assert_eq!(frames[1].offset, 26);
    match &frames[1].kind {
        FrameKind::Full { locals, stack } => {
            assert!(locals.is_empty());
            match stack.as_slice() {
                [VerificationType::Object(class_index)] => {
                    assert_eq!(pool.class_name(*class_index).unwrap(), "java/lang/Throwable")
                }
                other => panic!("unexpected stack {:?}", other),
            }
        }
        other => panic!("unexpected frame {:?}", other),
    }

    assert_eq!(lines.unwrap(), vec![0, 2, 0, 6, 0, 10, 0, 18, 0, 11]);
}

#[test]
fn test_frame_added_when_method_had_none() {
    let woven = Weaver::default().weave(&sample_class()).unwrap().unwrap();
    let class = ClassFile::parse(&woven.bytes).unwrap();
    let body = method_code(&class, "fail");

    let frames = body
        .attributes
        .iter()
        .find(|a| a.name(&class.constant_pool).unwrap() == "StackMapTable")
        .map(|a| parse_stack_map_table(&a.info).unwrap())
        .unwrap();
    assert_eq!(frames.len(), 1);
    // 6 bytes of entry probe + 8 original bytes
    assert_eq!(frames[0].offset, 14);
}

#[test]
fn test_old_class_versions_get_no_frames() {
    let mut class = TestClass::new("demo/Legacy", 49);
    add_fail(&mut class);
    let woven = Weaver::default().weave(&class.build()).unwrap().unwrap();
    let parsed = ClassFile::parse(&woven.bytes).unwrap();
    let body = method_code(&parsed, "fail");
    assert!(body
        .attributes
        .iter()
        .all(|a| a.name(&parsed.constant_pool).unwrap() != "StackMapTable"));
    assert_eq!(body.exception_table.len(), 1);
}

#[test]
fn test_existing_handlers_keep_priority() {
    let mut class = TestClass::new("demo/Guarded", 52);
    let exception = class.pool.add_class("java/lang/RuntimeException").unwrap();
    // 0 aload_0, 1 areturn, 2 astore_1, 3 aconst_null, 4 areturn
    let mut body = code(1, 2, vec![0x2a, 0xb0, 0x4c, 0x01, 0xb0]);
    body.exception_table.push(ExceptionEntry {
        start_pc: 0,
        end_pc: 2,
        handler_pc: 2,
        catch_type: exception,
    });
    class.method(PUBLIC, "guarded", "()Ljava/lang/Object;", Some(body));

    let woven = Weaver::default().weave(&class.build()).unwrap().unwrap();
    let parsed = ClassFile::parse(&woven.bytes).unwrap();
    let table = method_code(&parsed, "guarded").exception_table;

    assert_eq!(table.len(), 2);
    // original try block now spans aload_0 and the exit probe
    assert_eq!(table[0].start_pc, 6);
    assert_eq!(table[0].end_pc, 14);
    assert_eq!(table[0].handler_pc, 14);
    assert_eq!(table[0].catch_type, exception);
    assert_eq!(table[1].catch_type, 0);
}

#[test]
fn test_nothing_to_weave_is_unchanged() {
    let mut class = TestClass::new("demo/Launcher", 52);
    add_untouchables(&mut class);
    let bytes = class.build();

    assert!(Weaver::default().weave(&bytes).unwrap().is_none());
    let transformed = Weaver::default().transform("demo/Launcher", &bytes);
    assert!(matches!(transformed.outcome, TransformOutcome::Unchanged));
    assert!(matches!(transformed.bytes, Cow::Borrowed(_)));
}

#[test]
fn test_garbage_bytes_fail_open() {
    let bytes = b"definitely not a class file".to_vec();
    let transformed = Weaver::default().transform("demo/Broken", &bytes);
    assert_eq!(transformed.bytes.as_ref(), bytes.as_slice());
    assert!(matches!(
        transformed.outcome,
        TransformOutcome::Failed(WeaveError::TransformationFailure(ClassFileError::BadMagic(_)))
    ));
}

#[test]
fn test_unknown_opcode_fails_open() {
    let mut class = TestClass::new("demo/Odd", 52);
    class.method(PUBLIC, "odd", "()V", Some(code(0, 1, vec![0xcb, 0xb1])));
    let bytes = class.build();

    let transformed = Weaver::default().transform("demo/Odd", &bytes);
    assert!(matches!(transformed.bytes, Cow::Borrowed(_)));
    assert!(matches!(
        transformed.outcome,
        TransformOutcome::Failed(WeaveError::TransformationFailure(ClassFileError::UnknownOpcode { .. }))
    ));
}

#[test]
fn test_malformed_descriptor_fails_whole_class() {
    let mut class = TestClass::new("demo/BadSig", 52);
    add_fail(&mut class);
    class.method(PUBLIC, "weird", "(Q)V", Some(code(0, 1, vec![0xb1])));
    let bytes = class.build();

    let transformed = Weaver::default().transform("demo/BadSig", &bytes);
    assert_eq!(transformed.bytes.as_ref(), bytes.as_slice());
    assert!(matches!(
        transformed.outcome,
        TransformOutcome::Failed(WeaveError::MalformedDescriptor(_))
    ));
}

#[test]
fn test_custom_gate_target() {
    let gate = GateTarget {
        owner: "com/acme/Probe".to_string(),
        start: "enter".to_string(),
        end: "exit".to_string(),
        end_with_error: "fault".to_string(),
    };
    let weaver = Weaver::new(gate, MethodFilter::new(["compute"]));
    let woven = weaver.weave(&sample_class()).unwrap().unwrap();
    assert_eq!(woven.instrumented, vec!["demo.Calc.fail()"]);

    let class = ClassFile::parse(&woven.bytes).unwrap();
    let insns = decode(&method_code(&class, "fail").code).unwrap();
    assert_eq!(invoked(&class.constant_pool, &insns[1].1), "com/acme/Probe.enter");
}

#[test]
fn test_weaving_is_repeatable() {
    let bytes = sample_class();
    let first = Weaver::default().weave(&bytes).unwrap().unwrap();
    let second = Weaver::default().weave(&bytes).unwrap().unwrap();
    assert_eq!(first.bytes, second.bytes);
}
