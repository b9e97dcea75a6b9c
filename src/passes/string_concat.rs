use std::collections::HashMap;

use crate::attributes::bootstrap_methods;
use crate::builder::CodeBuilder;
use crate::classfile::ClassFile;
use crate::code::{Insn, op};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, Location, STRING_CONCAT_FACTORY, resolve_call_site};
use crate::version::TargetPolicy;

use super::{RewritePass, content_suffix, ensure_helper, instructions_at, method_location, rewrite_instructions, sites_by_method};

const BUILDER: &str = "java/lang/StringBuilder";
const TAG_ARG: u16 = 0x0001;
const TAG_CONST: u16 = 0x0002;

/// Replaces `StringConcatFactory` call sites with a static helper that
/// builds the string with `StringBuilder`, as pre-9 javac did inline.
pub struct LowerStringConcat;

impl RewritePass for LowerStringConcat {
    fn name(&self) -> &'static str {
        "lower-string-concat"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::StringConcat]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let bootstraps = bootstrap_methods(class)?;
        let mut edits = 0;
        for (method_index, offsets) in sites_by_method(class, findings) {
            let mut replacements = HashMap::new();
            for (offset, insn) in instructions_at(class, method_index, &offsets)? {
                let Insn::InvokeDynamic { index } = insn else {
                    continue;
                };
                let site = resolve_call_site(&class.constant_pool, &bootstraps, index)?;
                if site.bootstrap.member.owner != STRING_CONCAT_FACTORY {
                    continue;
                }
                let desc = MethodDescriptor::parse(&site.descriptor)?;
                let pieces = if site.bootstrap.member.name == "makeConcatWithConstants" {
                    let Some((&recipe, constants)) = site.arguments.split_first() else {
                        return Err(DowngradeError::unsupported(
                            "string concatenation without a recipe",
                            method_location(class, method_index)?,
                        ));
                    };
                    let recipe = class.constant_pool.string_units(recipe)?;
                    parse_recipe(&class.constant_pool, &recipe, constants, &desc, method_location(class, method_index)?)?
                } else {
                    desc.params.iter().cloned().map(Piece::Arg).collect()
                };

                let key: Vec<String> = pieces.iter().map(Piece::key).collect();
                let key: Vec<&str> = key.iter().map(String::as_str).collect();
                let name = format!("{}concat${}", super::HELPER_PREFIX, content_suffix(&key));
                let call = ensure_helper(class, &name, &site.descriptor, |b| emit(b, &pieces, &desc))?;
                replacements.insert(offset, vec![call]);
            }
            edits += rewrite_instructions(class, method_index, replacements)?;
        }
        Ok(edits)
    }
}

/// One step of the concatenation. Literals stay UTF-16 so lone surrogates
/// reach the output unchanged.
#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Literal(Vec<u16>),
    /// The next call-site argument.
    Arg(FieldType),
    /// A non-string constant from the bootstrap arguments.
    Constant { index: u16, ty: FieldType },
}

impl Piece {
    fn key(&self) -> String {
        match self {
            Piece::Literal(units) => format!("'{units:x?}"),
            Piece::Arg(ty) => format!("a{ty}"),
            Piece::Constant { index, ty } => format!("c{index}{ty}"),
        }
    }
}

fn parse_recipe(
    pool: &ConstantPool,
    recipe: &[u16],
    constants: &[u16],
    desc: &MethodDescriptor,
    location: Location,
) -> Result<Vec<Piece>, DowngradeError> {
    let mut pieces = Vec::new();
    let mut literal: Vec<u16> = Vec::new();
    let mut args = desc.params.iter();
    let mut constants = constants.iter();
    let malformed = || {
        let text = String::from_utf16_lossy(recipe);
        DowngradeError::unsupported(format!("string concatenation recipe {text:?}"), location.clone())
    };

    let flush = |literal: &mut Vec<u16>, pieces: &mut Vec<Piece>| {
        if !literal.is_empty() {
            pieces.push(Piece::Literal(std::mem::take(literal)));
        }
    };

    for &unit in recipe {
        match unit {
            TAG_ARG => {
                flush(&mut literal, &mut pieces);
                pieces.push(Piece::Arg(args.next().ok_or_else(malformed)?.clone()));
            }
            TAG_CONST => {
                let index = *constants.next().ok_or_else(malformed)?;
                let ty = match pool.get(index)? {
                    Constant::String { .. } => {
                        literal.extend(pool.string_units(index)?);
                        continue;
                    }
                    Constant::Integer(_) => FieldType::Int,
                    Constant::Float(_) => FieldType::Float,
                    Constant::Long(_) => FieldType::Long,
                    Constant::Double(_) => FieldType::Double,
                    Constant::Class { .. } | Constant::MethodType { .. } | Constant::MethodHandle { .. } => {
                        FieldType::object("java/lang/Object")
                    }
                    _ => return Err(malformed()),
                };
                flush(&mut literal, &mut pieces);
                pieces.push(Piece::Constant { index, ty });
            }
            other => literal.push(other),
        }
    }
    flush(&mut literal, &mut pieces);
    if args.next().is_some() {
        return Err(malformed());
    }
    Ok(pieces)
}

fn emit(b: &mut CodeBuilder<'_>, pieces: &[Piece], desc: &MethodDescriptor) -> Result<(), DowngradeError> {
    b.type_insn(op::NEW, BUILDER)?.simple(op::DUP);
    b.invoke_special(BUILDER, "<init>", "()V")?;

    let mut slot = 0;
    for piece in pieces {
        let ty = match piece {
            Piece::Literal(units) => {
                b.ldc_units(units)?;
                FieldType::object("java/lang/String")
            }
            Piece::Arg(ty) => {
                b.load(ty, slot);
                slot += ty.slots();
                ty.clone()
            }
            Piece::Constant { index, ty } => {
                let insn = match ty {
                    FieldType::Long | FieldType::Double => Insn::Ldc2 { index: *index },
                    _ => Insn::Ldc {
                        index: *index,
                        wide: false,
                    },
                };
                b.insn(insn);
                ty.clone()
            }
        };
        b.invoke_virtual(BUILDER, "append", append_descriptor(&ty))?;
    }

    b.invoke_virtual(BUILDER, "toString", "()Ljava/lang/String;")?;
    b.simple(desc.return_opcode());
    Ok(())
}

pub(super) fn append_descriptor(ty: &FieldType) -> &'static str {
    match ty {
        FieldType::Boolean => "(Z)Ljava/lang/StringBuilder;",
        FieldType::Char => "(C)Ljava/lang/StringBuilder;",
        FieldType::Byte | FieldType::Short | FieldType::Int => "(I)Ljava/lang/StringBuilder;",
        FieldType::Long => "(J)Ljava/lang/StringBuilder;",
        FieldType::Float => "(F)Ljava/lang/StringBuilder;",
        FieldType::Double => "(D)Ljava/lang/StringBuilder;",
        FieldType::Object(name) if name == "java/lang/String" => "(Ljava/lang/String;)Ljava/lang/StringBuilder;",
        _ => "(Ljava/lang/Object;)Ljava/lang/StringBuilder;",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{BOOTSTRAP_METHODS, BootstrapMethod, encode_bootstrap_methods};
    use crate::builder::add_method;
    use crate::classfile::access;
    use crate::code::CodeBody;
    use crate::constant_pool::{mutf8, ref_kind};
    use crate::feature::detect;
    use crate::version::JavaVersion;

    const FACTORY_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/invoke/CallSite;";

    fn concat_class(recipe: &str, descriptor: &str, sites: usize) -> ClassFile {
        concat_class_raw(mutf8::encode(recipe), descriptor, sites)
    }

    /// Builds the fixture from the recipe's raw modified UTF-8 bytes.
    fn concat_class_raw(recipe: Vec<u8>, descriptor: &str, sites: usize) -> ClassFile {
        let mut class = ClassFile::new(JavaVersion::JAVA_11, access::PUBLIC, "a/Concat", Some("java/lang/Object")).unwrap();
        let pool = &mut class.constant_pool;
        let factory = pool
            .method_ref_index(STRING_CONCAT_FACTORY, "makeConcatWithConstants", FACTORY_DESC, false)
            .unwrap();
        let handle = pool.method_handle_index(ref_kind::INVOKE_STATIC, factory).unwrap();
        let string_index = pool.intern(Constant::Utf8(recipe)).unwrap();
        let recipe = pool.intern(Constant::String { string_index }).unwrap();
        let nat = pool.name_and_type_index("makeConcatWithConstants", descriptor).unwrap();
        let indy = pool
            .intern(Constant::InvokeDynamic {
                bootstrap_method_attr_index: 0,
                name_and_type_index: nat,
            })
            .unwrap();
        class
            .set_attribute(
                BOOTSTRAP_METHODS,
                encode_bootstrap_methods(&[BootstrapMethod {
                    method_ref: handle,
                    arguments: vec![recipe],
                }]),
            )
            .unwrap();

        let desc = MethodDescriptor::parse(descriptor).unwrap();
        let mut b = CodeBuilder::new(&mut class.constant_pool, desc.param_slots());
        for _ in 0..sites {
            let mut slot = 0;
            for param in &desc.params {
                b.load(param, slot);
                slot += param.slots();
            }
            b.insn(Insn::InvokeDynamic { index: indy }).simple(op::POP);
        }
        b.simple(op::RETURN);
        let body = b.finish().unwrap();
        let void = format!("{}V", &descriptor[..descriptor.find(')').unwrap() + 1]);
        add_method(&mut class, access::PUBLIC | access::STATIC, "show", &void, &body).unwrap();
        class
    }

    fn run(class: &mut ClassFile) -> usize {
        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(class, &policy, &[FeatureKind::StringConcat]).unwrap();
        LowerStringConcat.apply(class, &findings, &policy).unwrap()
    }

    #[test]
    fn call_sites_share_one_helper() {
        let mut class = concat_class("x=\u{1}, y=\u{1}", "(IJ)Ljava/lang/String;", 2);
        assert_eq!(run(&mut class), 2);
        assert_eq!(class.methods.len(), 2);

        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        assert!(detect(&class, &policy, &[FeatureKind::StringConcat]).unwrap().is_empty());
        assert_eq!(run(&mut class), 0);

        let helper = &class.methods[1];
        let name = class.constant_pool.utf8(helper.name_index).unwrap();
        assert!(name.starts_with("downgrader$concat$"));
        assert_eq!(helper.access_flags, super::super::HELPER_ACCESS);
    }

    #[test]
    fn helper_appends_literals_and_arguments_in_order() {
        let mut class = concat_class("x=\u{1}!", "(I)Ljava/lang/String;", 1);
        run(&mut class);
        let helper = &class.methods[1];
        let code = helper.code_attribute_index(&class.constant_pool).unwrap();
        let body = CodeBody::decode(&helper.attributes[code].info, &class.constant_pool).unwrap();

        let appended: Vec<String> = body
            .insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Member { opcode: op::INVOKEVIRTUAL, index } => {
                    let member = class.constant_pool.member_ref(*index).unwrap();
                    (member.name == "append").then_some(member.descriptor)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            appended,
            vec![
                "(Ljava/lang/String;)Ljava/lang/StringBuilder;",
                "(I)Ljava/lang/StringBuilder;",
                "(Ljava/lang/String;)Ljava/lang/StringBuilder;",
            ]
        );
        assert_eq!(body.max_stack, 2);
    }

    #[test]
    fn lone_surrogate_in_literal_is_kept() {
        let recipe = vec![0xED, 0xA0, 0x80, b'=', 0x01];
        let mut class = concat_class_raw(recipe, "(I)Ljava/lang/String;", 1);
        assert_eq!(run(&mut class), 1);

        let helper = &class.methods[1];
        let code = helper.code_attribute_index(&class.constant_pool).unwrap();
        let body = CodeBody::decode(&helper.attributes[code].info, &class.constant_pool).unwrap();
        let literals: Vec<Vec<u16>> = body
            .insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Ldc { index, .. } => class.constant_pool.string_units(*index).ok(),
                _ => None,
            })
            .collect();
        assert_eq!(literals, vec![vec![0xD800, u16::from(b'=')]]);
    }

    #[test]
    fn recipe_with_missing_argument_is_unsupported() {
        let mut class = concat_class("\u{1}\u{1}", "(I)Ljava/lang/String;", 1);
        let policy = TargetPolicy::new(JavaVersion::JAVA_8).unwrap();
        let findings = detect(&class, &policy, &[FeatureKind::StringConcat]).unwrap();
        assert!(LowerStringConcat.apply(&mut class, &findings, &policy).is_err());
    }
}
