#![allow(dead_code)]

use class_downgrader::attributes::{
    BOOTSTRAP_METHODS, BootstrapMethod, NEST_MEMBERS, RECORD, RecordComponent, encode_bootstrap_methods,
    encode_record_components,
};
use class_downgrader::builder::{CodeBuilder, add_method};
use class_downgrader::classfile::{ClassFile, FieldInfo, access};
use class_downgrader::code::{Insn, op};
use class_downgrader::constant_pool::{Constant, ref_kind};
use class_downgrader::feature::{OBJECT_METHODS, STRING_CONCAT_FACTORY};
use class_downgrader::version::JavaVersion;
use class_downgrader::writer::serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(name: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "class_downgrader_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

const OBJECT_METHODS_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/TypeDescriptor;Ljava/lang/Class;Ljava/lang/String;[Ljava/lang/invoke/MethodHandle;)Ljava/lang/Object;";
const CONCAT_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/invoke/CallSite;";

/// `record Point(int x, String name)` as javac 16 emits it: no explicit
/// accessors, object methods forwarding to `ObjectMethods.bootstrap`.
pub fn record_point() -> ClassFile {
    let mut class = ClassFile::new(
        JavaVersion::JAVA_16,
        access::PUBLIC | access::FINAL | access::SUPER,
        "demo/Point",
        Some("java/lang/Record"),
    )
    .unwrap();
    let pool = &mut class.constant_pool;
    let mut components = Vec::new();
    for (name, desc) in [("x", "I"), ("name", "Ljava/lang/String;")] {
        let name_index = pool.utf8_index(name).unwrap();
        let descriptor_index = pool.utf8_index(desc).unwrap();
        class.fields.push(FieldInfo {
            access_flags: access::PRIVATE | access::FINAL,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        components.push(RecordComponent {
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
    }

    let bootstrap = pool
        .method_ref_index(OBJECT_METHODS, "bootstrap", OBJECT_METHODS_DESC, false)
        .unwrap();
    let bootstrap = pool.method_handle_index(ref_kind::INVOKE_STATIC, bootstrap).unwrap();
    let record = pool.class_index("demo/Point").unwrap();
    let names = pool.string_index("x;name").unwrap();
    let get_x = pool.field_ref_index("demo/Point", "x", "I").unwrap();
    let get_x = pool.method_handle_index(ref_kind::GET_FIELD, get_x).unwrap();
    let get_name = pool.field_ref_index("demo/Point", "name", "Ljava/lang/String;").unwrap();
    let get_name = pool.method_handle_index(ref_kind::GET_FIELD, get_name).unwrap();
    class
        .set_attribute(
            BOOTSTRAP_METHODS,
            encode_bootstrap_methods(&[BootstrapMethod {
                method_ref: bootstrap,
                arguments: vec![record, names, get_x, get_name],
            }]),
        )
        .unwrap();

    let mut b = CodeBuilder::new(&mut class.constant_pool, 3);
    b.aload(0).invoke_special("java/lang/Record", "<init>", "()V").unwrap();
    b.aload(0).iload(1).field(op::PUTFIELD, "demo/Point", "x", "I").unwrap();
    b.aload(0).aload(2).field(op::PUTFIELD, "demo/Point", "name", "Ljava/lang/String;").unwrap();
    b.simple(op::RETURN);
    let body = b.finish().unwrap();
    add_method(&mut class, access::PUBLIC, "<init>", "(ILjava/lang/String;)V", &body).unwrap();

    for (name, site_desc, desc, ret, slots) in [
        ("equals", "(Ldemo/Point;Ljava/lang/Object;)Z", "(Ljava/lang/Object;)Z", op::IRETURN, 2),
        ("hashCode", "(Ldemo/Point;)I", "()I", op::IRETURN, 1),
        ("toString", "(Ldemo/Point;)Ljava/lang/String;", "()Ljava/lang/String;", op::ARETURN, 1),
    ] {
        let nat = class.constant_pool.name_and_type_index(name, site_desc).unwrap();
        let indy = class
            .constant_pool
            .intern(Constant::InvokeDynamic {
                bootstrap_method_attr_index: 0,
                name_and_type_index: nat,
            })
            .unwrap();
        let mut b = CodeBuilder::new(&mut class.constant_pool, slots);
        for slot in 0..slots {
            b.aload(slot);
        }
        b.insn(Insn::InvokeDynamic { index: indy }).simple(ret);
        let body = b.finish().unwrap();
        add_method(&mut class, access::PUBLIC | access::FINAL, name, desc, &body).unwrap();
    }

    class
        .set_attribute(RECORD, encode_record_components(&components))
        .unwrap();
    class
}

/// A Java 11 class with an indy string concatenation, a `List.of` call and
/// a nest member, all of which Java 8 lacks.
pub fn java11_mix() -> ClassFile {
    let mut class = ClassFile::new(JavaVersion::JAVA_11, access::PUBLIC | access::SUPER, "demo/Mix", Some("java/lang/Object")).unwrap();
    let pool = &mut class.constant_pool;
    let factory = pool
        .method_ref_index(STRING_CONCAT_FACTORY, "makeConcatWithConstants", CONCAT_DESC, false)
        .unwrap();
    let factory = pool.method_handle_index(ref_kind::INVOKE_STATIC, factory).unwrap();
    let recipe = pool.string_index("\u{1} items: \u{1}").unwrap();
    class
        .set_attribute(
            BOOTSTRAP_METHODS,
            encode_bootstrap_methods(&[BootstrapMethod {
                method_ref: factory,
                arguments: vec![recipe],
            }]),
        )
        .unwrap();
    let nat = class
        .constant_pool
        .name_and_type_index("makeConcatWithConstants", "(Ljava/lang/String;I)Ljava/lang/String;")
        .unwrap();
    let indy = class
        .constant_pool
        .intern(Constant::InvokeDynamic {
            bootstrap_method_attr_index: 0,
            name_and_type_index: nat,
        })
        .unwrap();

    let mut b = CodeBuilder::new(&mut class.constant_pool, 2);
    b.aload(0).iload(1).insn(Insn::InvokeDynamic { index: indy }).simple(op::ARETURN);
    let body = b.finish().unwrap();
    add_method(&mut class, access::PUBLIC | access::STATIC, "label", "(Ljava/lang/String;I)Ljava/lang/String;", &body).unwrap();

    let mut b = CodeBuilder::new(&mut class.constant_pool, 2);
    b.aload(0).aload(1);
    b.invoke_static("java/util/List", "of", "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/util/List;", true)
        .unwrap();
    b.simple(op::ARETURN);
    let body = b.finish().unwrap();
    add_method(
        &mut class,
        access::PRIVATE | access::STATIC,
        "pair",
        "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/util/List;",
        &body,
    )
    .unwrap();

    let inner = class.constant_pool.class_index("demo/Mix$Inner").unwrap();
    class
        .set_attribute(NEST_MEMBERS, vec![0, 1, (inner >> 8) as u8, inner as u8])
        .unwrap();
    class
}

/// A Java 9 module descriptor; Java 8 has nothing to express it with.
pub fn module_info() -> ClassFile {
    ClassFile::new(JavaVersion::JAVA_9, access::MODULE, "module-info", None).unwrap()
}

pub fn plain(name: &str, version: JavaVersion) -> Vec<u8> {
    let mut class = ClassFile::new(version, access::PUBLIC | access::SUPER, name, Some("java/lang/Object")).unwrap();
    let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
    b.aload(0).invoke_special("java/lang/Object", "<init>", "()V").unwrap();
    b.simple(op::RETURN);
    let body = b.finish().unwrap();
    add_method(&mut class, access::PUBLIC, "<init>", "()V", &body).unwrap();
    serialize(&class)
}

/// A Java 16 class that is not a record but uses `java/lang/Record` as a
/// type, next to a string literal spelling the same name.
pub fn record_user() -> ClassFile {
    let mut class = ClassFile::new(JavaVersion::JAVA_16, access::PUBLIC | access::SUPER, "demo/Inspector", Some("java/lang/Object")).unwrap();

    let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
    b.aload(0).type_insn(op::INSTANCEOF, "java/lang/Record").unwrap();
    b.simple(op::IRETURN);
    let body = b.finish().unwrap();
    add_method(&mut class, access::PUBLIC | access::STATIC, "isRecord", "(Ljava/lang/Object;)Z", &body).unwrap();

    let mut b = CodeBuilder::new(&mut class.constant_pool, 1);
    b.ldc_string("java/lang/Record").unwrap();
    b.simple(op::ARETURN);
    let body = b.finish().unwrap();
    add_method(&mut class, access::PUBLIC | access::STATIC, "describe", "(Ljava/lang/Record;)Ljava/lang/String;", &body).unwrap();
    class
}
