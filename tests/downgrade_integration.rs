mod common;

use class_downgrader::batch::{BatchOutcome, CancelToken, downgrade_all};
use class_downgrader::classfile::{ClassFile, access};
use class_downgrader::code::{CodeBody, Insn};
use class_downgrader::feature::detect_all;
use class_downgrader::reader::parse;
use class_downgrader::writer::serialize;
use class_downgrader::{Downgrader, ErrorKind, JavaVersion, TargetPolicy};

fn downgrader(version: JavaVersion) -> Downgrader {
    Downgrader::new(TargetPolicy::new(version).unwrap())
}

fn code_of(class: &ClassFile, name: &str, desc: &str) -> CodeBody {
    let method = &class.methods[class.find_method(name, desc).unwrap()];
    let code = method.code_attribute_index(&class.constant_pool).unwrap();
    CodeBody::decode(&method.attributes[code].info, &class.constant_pool).unwrap()
}

/// Every index resolves with the right tag and every method body decodes
/// with its labels in range, re-encoding to the same bytes.
fn assert_integrity(class: &ClassFile) {
    class.constant_pool.validate().unwrap();
    for method in &class.methods {
        let Some(code) = method.code_attribute_index(&class.constant_pool) else {
            continue;
        };
        let info = &method.attributes[code].info;
        let body = CodeBody::decode(info, &class.constant_pool).unwrap();
        assert_eq!(&body.encode().unwrap(), info);
    }
}

#[test]
fn record_becomes_plain_final_class_for_java_8() {
    let input = serialize(&common::record_point());
    let out = downgrader(JavaVersion::JAVA_8).downgrade(&input).unwrap();
    assert!(out.changed);
    assert_eq!(out.version, JavaVersion::JAVA_8);
    assert_eq!(out.class_name, "demo/Point");
    for pass in ["lower-records", "lower-object-methods", "strip-versioned-attributes"] {
        assert!(out.diagnostic.applied_passes.contains(&pass), "{pass} missing from {:?}", out.diagnostic.applied_passes);
    }

    let class = parse(&out.bytes).unwrap();
    assert_eq!(class.major_version, 52);
    assert_ne!(class.access_flags & access::FINAL, 0);
    assert_eq!(class.super_name().unwrap().as_deref(), Some("java/lang/Object"));
    assert!(!class.has_attribute("Record"));
    assert!(class.find_field("x", "I").is_some());
    assert!(class.find_method("x", "()I").is_some());
    assert!(class.find_method("name", "()Ljava/lang/String;").is_some());
    for (name, desc) in [
        ("equals", "(Ljava/lang/Object;)Z"),
        ("hashCode", "()I"),
        ("toString", "()Ljava/lang/String;"),
    ] {
        let body = code_of(&class, name, desc);
        assert!(!body.insns.iter().any(|i| matches!(i, Insn::InvokeDynamic { .. })), "{name} still uses indy");
    }

    let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
    assert!(detect_all(&class, &policy).unwrap().is_empty());
    assert_integrity(&class);
}

#[test]
fn record_references_outside_records_are_retargeted() {
    let input = serialize(&common::record_user());
    let out = downgrader(JavaVersion::JAVA_8).downgrade(&input).unwrap();
    assert!(out.diagnostic.applied_passes.contains(&"lower-records"));

    let class = parse(&out.bytes).unwrap();
    assert_eq!(class.access_flags & access::FINAL, 0);
    assert!(class.find_method("describe", "(Ljava/lang/Object;)Ljava/lang/String;").is_some());
    let record_classes = class
        .constant_pool
        .iter()
        .filter(|(index, _)| class.constant_pool.class_name(*index).is_ok_and(|name| name == "java/lang/Record"))
        .count();
    assert_eq!(record_classes, 0);

    let describe = code_of(&class, "describe", "(Ljava/lang/Object;)Ljava/lang/String;");
    let Insn::Ldc { index, .. } = describe.insns[0] else {
        panic!("expected the literal first");
    };
    assert_eq!(class.constant_pool.string(index).unwrap(), "java/lang/Record");

    let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
    assert!(detect_all(&class, &policy).unwrap().is_empty());
    assert_integrity(&class);
}

#[test]
fn java_11_mix_lowers_every_construct() {
    let input = serialize(&common::java11_mix());
    let out = downgrader(JavaVersion::JAVA_8).downgrade(&input).unwrap();
    assert_eq!(out.diagnostic.rounds, 1);

    let class = parse(&out.bytes).unwrap();
    assert!(!class.has_attribute("NestMembers"));
    let helpers = class
        .methods
        .iter()
        .filter(|m| class.constant_pool.utf8(m.name_index).unwrap().starts_with("downgrader$"))
        .count();
    assert_eq!(helpers, 2);
    let pair = &class.methods[class.find_method("pair", "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/util/List;").unwrap()];
    assert_eq!(pair.access_flags & access::PRIVATE, 0);
    assert_integrity(&class);
}

#[test]
fn module_descriptor_is_unsupported_for_java_8() {
    let input = serialize(&common::module_info());
    let err = downgrader(JavaVersion::JAVA_8).downgrade(&input).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedConstruct);
    assert_eq!(err.class_name(), Some("module-info"));
    assert!(err.to_string().contains("module descriptor"));
}

#[test]
fn truncated_buffer_is_malformed() {
    // Magic, version 52.0, an empty pool, then nothing.
    let bytes = [0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00, 0x00, 0x34, 0x00, 0x01];
    let err = downgrader(JavaVersion::JAVA_8).downgrade(&bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedClass);
}

#[test]
fn batch_of_100_keeps_failures_separate() {
    let malformed = [3usize, 50, 99];
    let inputs: Vec<Vec<u8>> = (0..100)
        .map(|i| {
            let bytes = common::plain(&format!("demo/C{i}"), JavaVersion::JAVA_17);
            if malformed.contains(&i) { bytes[..bytes.len() / 2].to_vec() } else { bytes }
        })
        .collect();

    let outcomes = downgrade_all(&downgrader(JavaVersion::JAVA_8), &inputs, &CancelToken::new());
    assert_eq!(outcomes.len(), 100);
    let failed: Vec<usize> = outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| o.is_failure())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(failed, malformed);
    for (i, outcome) in outcomes.iter().enumerate() {
        match outcome {
            BatchOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::MalformedClass),
            BatchOutcome::Downgraded(out) => {
                assert_eq!(out.class_name, format!("demo/C{i}"));
                assert_eq!(parse(&out.bytes).unwrap().major_version, 52);
            }
            BatchOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }
}

#[test]
fn unmodified_classes_round_trip_exactly() {
    for class in [common::record_point(), common::java11_mix(), common::module_info()] {
        let bytes = serialize(&class);
        assert_eq!(serialize(&parse(&bytes).unwrap()), bytes);
    }
}

#[test]
fn downgrading_twice_changes_nothing() {
    let d = downgrader(JavaVersion::JAVA_8);
    for input in [serialize(&common::record_point()), serialize(&common::java11_mix())] {
        let once = d.downgrade(&input).unwrap();
        let twice = d.downgrade(&once.bytes).unwrap();
        assert!(!twice.changed);
        assert_eq!(twice.bytes, once.bytes);
    }
}

#[test]
fn output_version_never_exceeds_target_or_input() {
    let input = common::plain("demo/V", JavaVersion::JAVA_11);
    for target in [JavaVersion::JAVA_8, JavaVersion::JAVA_11, JavaVersion::JAVA_17] {
        let out = downgrader(target).downgrade(&input).unwrap();
        let major = parse(&out.bytes).unwrap().major_version;
        assert!(major <= target.major());
        assert!(major <= JavaVersion::JAVA_11.major());
        if target >= JavaVersion::JAVA_11 {
            assert_eq!(out.bytes, input);
        }
    }
}
