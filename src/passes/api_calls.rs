use std::collections::HashMap;

use crate::api::{self, ApiLowering, ApiMember};
use crate::builder::CodeBuilder;
use crate::classfile::ClassFile;
use crate::code::{Insn, Label, op};
use crate::constant_pool::{Constant, MemberKind, MemberRef, ref_kind};
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::error::DowngradeError;
use crate::feature::{FeatureFinding, FeatureKind, Location};
use crate::stackmap::{FrameKind, VerificationType};
use crate::version::TargetPolicy;

use super::{HELPER_PREFIX, RewritePass, ensure_helper, instructions_at, rewrite_instructions, sites_by_method};

const OBJECT: &str = "java/lang/Object";
const ARRAY_LIST: &str = "java/util/ArrayList";
const HASH_SET: &str = "java/util/HashSet";
const HASH_MAP: &str = "java/util/HashMap";
const COLLECTIONS: &str = "java/util/Collections";
const OBJECTS: &str = "java/util/Objects";
const BYTE_STREAM: &str = "java/io/ByteArrayOutputStream";
const OPTIONAL: &str = "java/util/Optional";
const STREAM: &str = "java/util/stream/Stream";
const COLLECTORS: &str = "java/util/stream/Collectors";
const MAP_ENTRY: &str = "java/util/Map$Entry";
const MATCHER: &str = "java/util/regex/Matcher";
const STRING_BUFFER: &str = "java/lang/StringBuffer";
const FUNCTION: &str = "java/util/function/Function";
const BI_FUNCTION: &str = "java/util/function/BiFunction";
const FUTURE: &str = "java/util/concurrent/CompletableFuture";
const METHOD_HANDLE: &str = "java/lang/invoke/MethodHandle";
const IAE: &str = "java/lang/IllegalArgumentException";
const BUFFER_SIZE: i32 = 8192;

/// `recover(fn, result, failure)` applies `fn` to the failure.
const RECOVER: &str = "(Ljava/util/function/Function;Ljava/lang/Object;Ljava/lang/Throwable;)Ljava/lang/Object;";
/// `recoverAsync(future, fn, executor, result, failure)` schedules `recover`
/// on failure and otherwise hands back `future` itself.
const RECOVER_ASYNC: &str = "(Ljava/util/concurrent/CompletableFuture;Ljava/util/function/Function;Ljava/util/concurrent/Executor;Ljava/lang/Object;Ljava/lang/Throwable;)Ljava/lang/Object;";

/// A chunked copy loop over byte or char streams.
struct Chunks {
    source: &'static str,
    sink: &'static str,
    atype: u8,
    array: &'static str,
}

impl Chunks {
    fn array_type(&self) -> FieldType {
        let element = if self.atype == op::T_CHAR { FieldType::Char } else { FieldType::Byte };
        FieldType::Array(Box::new(element))
    }
}

const BYTE_CHUNKS: Chunks = Chunks {
    source: "java/io/InputStream",
    sink: "java/io/OutputStream",
    atype: op::T_BYTE,
    array: "[B",
};

const CHAR_CHUNKS: Chunks = Chunks {
    source: "java/io/Reader",
    sink: "java/io/Writer",
    atype: op::T_CHAR,
    array: "[C",
};

/// Redirects calls to library members that the target runtime lacks into
/// private static helpers built from older APIs.
///
/// Instance members become helpers taking the receiver as the first
/// argument, so the operand stack at the call site is unchanged. Method
/// references passed to `LambdaMetafactory` are repointed at the same
/// helpers. Lowerings that need a functional object build it with
/// `MethodHandleProxies` over a handle to another helper, so no bootstrap
/// methods are added.
pub struct ReplaceApiCalls;

impl RewritePass for ReplaceApiCalls {
    fn name(&self) -> &'static str {
        "replace-api-calls"
    }

    fn consumes(&self) -> &'static [FeatureKind] {
        &[FeatureKind::MissingApi]
    }

    fn apply(&self, class: &mut ClassFile, findings: &[FeatureFinding], _: &TargetPolicy) -> Result<usize, DowngradeError> {
        let mut edits = 0;
        for (method_index, offsets) in sites_by_method(class, findings) {
            let mut replacements = HashMap::new();
            for (offset, insn) in instructions_at(class, method_index, &offsets)? {
                let index = match insn {
                    Insn::Member { opcode, index } if opcode >= op::INVOKEVIRTUAL => index,
                    Insn::InvokeInterface { index, .. } => index,
                    _ => continue,
                };
                let member = class.constant_pool.member_ref(index)?;
                let Some(api) = api::lookup(&member) else {
                    continue;
                };
                let call = match redirect(class, &member, &api) {
                    Err(DowngradeError::Unsupported { construct, .. }) => {
                        let (name, descriptor) = {
                            let method = &class.methods[method_index];
                            class.member_name(method.name_index, method.descriptor_index)?
                        };
                        let at = Location::Instruction {
                            method: name,
                            descriptor,
                            offset,
                        };
                        return Err(DowngradeError::unsupported(construct, at));
                    }
                    other => other?,
                };
                replacements.insert(offset, vec![call]);
            }
            edits += rewrite_instructions(class, method_index, replacements)?;
        }

        for finding in findings {
            let Location::Constant { index } = finding.location else {
                continue;
            };
            let target = class.constant_pool.method_handle(index)?;
            let Some(api) = api::lookup(&target.member) else {
                continue;
            };
            let Insn::Member { index: helper, .. } = redirect(class, &target.member, &api)? else {
                continue;
            };
            class.constant_pool.replace(
                index,
                Constant::MethodHandle {
                    reference_kind: ref_kind::INVOKE_STATIC,
                    reference_index: helper,
                },
            )?;
            tracing::debug!(constant = index, member = %target.member.name, "repointed method reference");
            edits += 1;
        }
        Ok(edits)
    }
}

/// An `invokestatic` to the helper standing in for `member`.
fn redirect(class: &mut ClassFile, member: &MemberRef, api: &ApiMember) -> Result<Insn, DowngradeError> {
    let simple_name = member.owner.rsplit('/').next().unwrap_or(&member.owner);
    let name = format!("{HELPER_PREFIX}{simple_name}${}", member.name);
    let descriptor = if api.is_static {
        member.descriptor.clone()
    } else {
        let params = member.descriptor.strip_prefix('(').unwrap_or(&member.descriptor);
        format!("(L{};{params}", member.owner)
    };
    let desc = MethodDescriptor::parse(&descriptor)?;
    let companion = companion_handle(class, api.lowering)?;
    ensure_helper(class, &name, &descriptor, |b| emit(b, api.lowering, member, &desc, companion))
}

/// Handle to the helper a lowering passes around as a functional object,
/// created ahead of the helper that loads it.
fn companion_handle(class: &mut ClassFile, lowering: ApiLowering) -> Result<Option<u16>, DowngradeError> {
    let (owner, name, descriptor) = match lowering {
        ApiLowering::ToUnmodifiableList => ("java/util/List", "copyOf", "(Ljava/util/Collection;)Ljava/util/List;"),
        ApiLowering::ToUnmodifiableSet => ("java/util/Set", "copyOf", "(Ljava/util/Collection;)Ljava/util/Set;"),
        ApiLowering::ToUnmodifiableMap => ("java/util/Map", "copyOf", "(Ljava/util/Map;)Ljava/util/Map;"),
        ApiLowering::ExceptionallyAsync => return recovery_stage(class),
        _ => return Ok(None),
    };
    let member = MemberRef {
        kind: MemberKind::InterfaceMethod,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    };
    let Some(api) = api::lookup(&member) else {
        return Ok(None);
    };
    let call = redirect(class, &member, &api)?;
    static_handle(class, call)
}

/// Builds the two stages behind `exceptionallyAsync` and returns a handle
/// to the outer one.
fn recovery_stage(class: &mut ClassFile) -> Result<Option<u16>, DowngradeError> {
    let recover = ensure_helper(class, &format!("{HELPER_PREFIX}CompletableFuture$recover"), RECOVER, |b| {
        b.aload(0).aload(2);
        b.invoke_interface(FUNCTION, "apply", "(Ljava/lang/Object;)Ljava/lang/Object;")?;
        b.simple(op::ARETURN);
        Ok(())
    })?;
    let Some(recover) = static_handle(class, recover)? else {
        return Ok(None);
    };
    let stage = ensure_helper(class, &format!("{HELPER_PREFIX}CompletableFuture$recoverAsync"), RECOVER_ASYNC, |b| {
        let (failed, custom) = (b.new_label(), b.new_label());
        b.aload(4).jump(op::IFNONNULL, failed);
        b.aload(0).simple(op::ARETURN);
        b.place_frame(failed, FrameKind::Same);
        b.aload(2).jump(op::IFNONNULL, custom);
        b.aload(0);
        functional_proxy(b, BI_FUNCTION, recover, &[Some(1)])?;
        b.invoke_virtual(FUTURE, "handleAsync", "(Ljava/util/function/BiFunction;)Ljava/util/concurrent/CompletableFuture;")?;
        b.simple(op::ARETURN);
        b.place_frame(custom, FrameKind::Same);
        b.aload(0);
        functional_proxy(b, BI_FUNCTION, recover, &[Some(1)])?;
        b.aload(2).invoke_virtual(
            FUTURE,
            "handleAsync",
            "(Ljava/util/function/BiFunction;Ljava/util/concurrent/Executor;)Ljava/util/concurrent/CompletableFuture;",
        )?;
        b.simple(op::ARETURN);
        Ok(())
    })?;
    static_handle(class, stage)
}

fn static_handle(class: &mut ClassFile, call: Insn) -> Result<Option<u16>, DowngradeError> {
    let Insn::Member { index, .. } = call else {
        return Ok(None);
    };
    Ok(Some(class.constant_pool.method_handle_index(ref_kind::INVOKE_STATIC, index)?))
}

fn emit(
    b: &mut CodeBuilder<'_>,
    lowering: ApiLowering,
    member: &MemberRef,
    desc: &MethodDescriptor,
    companion: Option<u16>,
) -> Result<(), DowngradeError> {
    match lowering {
        ApiLowering::ListOf => {
            b.type_insn(op::NEW, ARRAY_LIST)?.simple(op::DUP);
            element_array(b, desc)?;
            as_list(b)?;
            b.invoke_special(ARRAY_LIST, "<init>", "(Ljava/util/Collection;)V")?;
            reject_null(b, ARRAY_LIST, "contains")?;
            b.invoke_static(COLLECTIONS, "unmodifiableList", "(Ljava/util/List;)Ljava/util/List;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::SetOf => {
            b.type_insn(op::NEW, HASH_SET)?.simple(op::DUP);
            element_array(b, desc)?;
            as_list(b)?;
            b.invoke_special(HASH_SET, "<init>", "(Ljava/util/Collection;)V")?;
            reject_null(b, HASH_SET, "contains")?;

            let distinct = b.new_label();
            b.simple(op::DUP).invoke_virtual(HASH_SET, "size", "()I")?;
            if is_varargs(desc) {
                b.aload(0).simple(op::ARRAYLENGTH);
            } else {
                b.iconst(desc.params.len() as i32)?;
            }
            b.jump(op::IF_ICMPEQ, distinct);
            throw_with_message(b, IAE, "duplicate element")?;
            let set = b.object_type(HASH_SET)?;
            b.place_frame(distinct, FrameKind::SameLocals1Stack(set));
            b.invoke_static(COLLECTIONS, "unmodifiableSet", "(Ljava/util/Set;)Ljava/util/Set;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::MapOf => {
            if desc.params.len() % 2 != 0 {
                return Err(DowngradeError::unsupported(
                    format!("Map.of{} with an odd argument count", member.descriptor),
                    Location::Class,
                ));
            }
            b.type_insn(op::NEW, HASH_MAP)?.simple(op::DUP);
            b.invoke_special(HASH_MAP, "<init>", "()V")?;
            let map = b.object_type(HASH_MAP)?;
            for pair in 0..desc.params.len() / 2 {
                let fresh = b.new_label();
                let key = (2 * pair) as u16;
                b.simple(op::DUP);
                b.aload(key).invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;)Ljava/lang/Object;", false)?;
                b.aload(key + 1).invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;)Ljava/lang/Object;", false)?;
                b.invoke_virtual(HASH_MAP, "put", "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;")?;
                b.jump(op::IFNULL, fresh);
                throw_with_message(b, IAE, "duplicate key")?;
                b.place_frame(fresh, FrameKind::SameLocals1Stack(map.clone()));
            }
            b.invoke_static(COLLECTIONS, "unmodifiableMap", "(Ljava/util/Map;)Ljava/util/Map;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::MapEntry => {
            let entry = "java/util/AbstractMap$SimpleImmutableEntry";
            b.type_insn(op::NEW, entry)?.simple(op::DUP);
            b.aload(0).invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;)Ljava/lang/Object;", false)?;
            b.aload(1).invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;)Ljava/lang/Object;", false)?;
            b.invoke_special(entry, "<init>", "(Ljava/lang/Object;Ljava/lang/Object;)V")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::RequireNonNullElse | ApiLowering::RequireNonNullElseGet => {
            let fallback = b.new_label();
            b.aload(0).jump(op::IFNULL, fallback);
            b.aload(0).simple(op::ARETURN);
            b.place_frame(fallback, FrameKind::Same);
            if lowering == ApiLowering::RequireNonNullElse {
                b.aload(1).ldc_string("defaultObj")?;
            } else {
                b.aload(1).ldc_string("supplier")?;
                b.invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;", false)?;
                b.type_insn(op::CHECKCAST, "java/util/function/Supplier")?;
                b.invoke_interface("java/util/function/Supplier", "get", "()Ljava/lang/Object;")?;
                b.ldc_string("supplier.get()")?;
            }
            b.invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::ReadAllBytes => {
            let out = b.new_local(&FieldType::object(BYTE_STREAM));
            let buf = b.new_local(&BYTE_CHUNKS.array_type());
            let n = b.new_local(&FieldType::Int);
            b.type_insn(op::NEW, BYTE_STREAM)?.simple(op::DUP);
            b.invoke_special(BYTE_STREAM, "<init>", "()V")?;
            b.store(&FieldType::object(BYTE_STREAM), out);
            new_buffer(b, &BYTE_CHUNKS, buf)?;

            let (head, done) = (b.new_label(), b.new_label());
            let locals = vec![b.object_type(BYTE_STREAM)?, b.object_type(BYTE_CHUNKS.array)?];
            b.place_frame(head, FrameKind::Append(locals));
            read_chunk(b, &BYTE_CHUNKS, buf, n, done)?;
            b.aload(out).aload(buf).iconst(0)?.iload(n);
            b.invoke_virtual(BYTE_STREAM, "write", "([BII)V")?;
            b.jump(op::GOTO, head);

            b.place_frame(done, FrameKind::Append(vec![VerificationType::Integer]));
            b.aload(out).invoke_virtual(BYTE_STREAM, "toByteArray", "()[B")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::TransferTo => transfer(b, &BYTE_CHUNKS)?,
        ApiLowering::ReaderTransferTo => transfer(b, &CHAR_CHUNKS)?,
        ApiLowering::BufferCovariant => {
            let mut slot = 1;
            let mut params = String::from("(");
            b.aload(0);
            for param in &desc.params[1..] {
                b.load(param, slot);
                slot += param.slots();
                params.push_str(&param.to_string());
            }
            params.push_str(")Ljava/nio/Buffer;");
            b.invoke_virtual("java/nio/Buffer", &member.name, &params)?;
            b.type_insn(op::CHECKCAST, &member.owner)?.simple(op::ARETURN);
        }
        ApiLowering::OptionalOrElseThrow => {
            b.aload(0).invoke_virtual("java/util/Optional", "get", "()Ljava/lang/Object;")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::OptionalIsEmpty => {
            b.aload(0).invoke_virtual("java/util/Optional", "isPresent", "()Z")?;
            b.simple(op::ICONST_1).simple(op::IXOR).simple(op::IRETURN);
        }
        ApiLowering::StringIsBlank => {
            let i = b.new_local(&FieldType::Int);
            let cp = b.new_local(&FieldType::Int);
            let (head, next, blank) = (b.new_label(), b.new_label(), b.new_label());
            b.simple(op::ICONST_0).store(&FieldType::Int, i);
            b.place_frame(head, FrameKind::Append(vec![VerificationType::Integer]));
            b.iload(i).aload(0).invoke_virtual("java/lang/String", "length", "()I")?;
            b.jump(op::IF_ICMPGE, blank);
            b.aload(0).iload(i).invoke_virtual("java/lang/String", "codePointAt", "(I)I")?;
            b.store(&FieldType::Int, cp);
            b.iload(cp).invoke_static("java/lang/Character", "isWhitespace", "(I)Z", false)?;
            b.jump(op::IFNE, next);
            b.simple(op::ICONST_0).simple(op::IRETURN);
            b.place_frame(next, FrameKind::Append(vec![VerificationType::Integer]));
            b.iload(i).iload(cp).invoke_static("java/lang/Character", "charCount", "(I)I", false)?;
            b.simple(op::IADD).store(&FieldType::Int, i);
            b.jump(op::GOTO, head);
            b.place_frame(blank, FrameKind::Chop(1));
            b.simple(op::ICONST_1).simple(op::IRETURN);
        }
        ApiLowering::CharSequenceIsEmpty => {
            let non_empty = b.new_label();
            b.aload(0).invoke_interface("java/lang/CharSequence", "length", "()I")?;
            b.jump(op::IFNE, non_empty);
            b.simple(op::ICONST_1).simple(op::IRETURN);
            b.place_frame(non_empty, FrameKind::Same);
            b.simple(op::ICONST_0).simple(op::IRETURN);
        }
        ApiLowering::StreamToList => {
            b.type_insn(op::NEW, ARRAY_LIST)?.simple(op::DUP);
            b.aload(0).invoke_interface("java/util/stream/Stream", "toArray", "()[Ljava/lang/Object;")?;
            as_list(b)?;
            b.invoke_special(ARRAY_LIST, "<init>", "(Ljava/util/Collection;)V")?;
            b.invoke_static(COLLECTIONS, "unmodifiableList", "(Ljava/util/List;)Ljava/util/List;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::ListCopyOf | ApiLowering::SetCopyOf => {
            let (copy, wrap, wrapped) = if lowering == ApiLowering::ListCopyOf {
                (ARRAY_LIST, "unmodifiableList", "(Ljava/util/List;)Ljava/util/List;")
            } else {
                (HASH_SET, "unmodifiableSet", "(Ljava/util/Set;)Ljava/util/Set;")
            };
            b.type_insn(op::NEW, copy)?.simple(op::DUP);
            b.aload(0).invoke_special(copy, "<init>", "(Ljava/util/Collection;)V")?;
            reject_null(b, copy, "contains")?;
            b.invoke_static(COLLECTIONS, wrap, wrapped, false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::MapCopyOf => {
            b.type_insn(op::NEW, HASH_MAP)?.simple(op::DUP);
            b.aload(0).invoke_special(HASH_MAP, "<init>", "(Ljava/util/Map;)V")?;
            reject_null(b, HASH_MAP, "containsKey")?;
            reject_null(b, HASH_MAP, "containsValue")?;
            b.invoke_static(COLLECTIONS, "unmodifiableMap", "(Ljava/util/Map;)Ljava/util/Map;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::MapOfEntries => {
            let map = b.new_local(&FieldType::object(HASH_MAP));
            let i = b.new_local(&FieldType::Int);
            b.type_insn(op::NEW, HASH_MAP)?.simple(op::DUP);
            b.invoke_special(HASH_MAP, "<init>", "()V")?;
            b.store(&FieldType::object(HASH_MAP), map);
            b.simple(op::ICONST_0).store(&FieldType::Int, i);

            let (head, fresh, done) = (b.new_label(), b.new_label(), b.new_label());
            let locals = vec![b.object_type(HASH_MAP)?, VerificationType::Integer];
            b.place_frame(head, FrameKind::Append(locals));
            b.iload(i).aload(0).simple(op::ARRAYLENGTH);
            b.jump(op::IF_ICMPGE, done);
            b.aload(map).aload(0).iload(i).simple(op::AALOAD).simple(op::DUP);
            b.invoke_interface(MAP_ENTRY, "getKey", "()Ljava/lang/Object;")?;
            non_null(b)?;
            b.simple(op::SWAP).invoke_interface(MAP_ENTRY, "getValue", "()Ljava/lang/Object;")?;
            non_null(b)?;
            b.invoke_virtual(HASH_MAP, "put", "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;")?;
            b.jump(op::IFNULL, fresh);
            throw_with_message(b, IAE, "duplicate key")?;
            b.place_frame(fresh, FrameKind::Same);
            b.iinc(i, 1).jump(op::GOTO, head);

            b.place_frame(done, FrameKind::Same);
            b.aload(map);
            b.invoke_static(COLLECTIONS, "unmodifiableMap", "(Ljava/util/Map;)Ljava/util/Map;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::OptionalOr => {
            let absent = b.new_label();
            b.aload(1);
            non_null(b)?;
            b.simple(op::POP);
            b.aload(0).invoke_virtual(OPTIONAL, "isPresent", "()Z")?;
            b.jump(op::IFEQ, absent);
            b.aload(0).simple(op::ARETURN);
            b.place_frame(absent, FrameKind::Same);
            b.aload(1).invoke_interface("java/util/function/Supplier", "get", "()Ljava/lang/Object;")?;
            non_null(b)?;
            b.type_insn(op::CHECKCAST, OPTIONAL)?.simple(op::ARETURN);
        }
        ApiLowering::OptionalIfPresentOrElse => {
            let absent = b.new_label();
            b.aload(0).invoke_virtual(OPTIONAL, "isPresent", "()Z")?;
            b.jump(op::IFEQ, absent);
            b.aload(1).aload(0).invoke_virtual(OPTIONAL, "get", "()Ljava/lang/Object;")?;
            b.invoke_interface("java/util/function/Consumer", "accept", "(Ljava/lang/Object;)V")?;
            b.simple(op::RETURN);
            b.place_frame(absent, FrameKind::Same);
            b.aload(2).invoke_interface("java/lang/Runnable", "run", "()V")?;
            b.simple(op::RETURN);
        }
        ApiLowering::OptionalStream => {
            let absent = b.new_label();
            b.aload(0).invoke_virtual(OPTIONAL, "isPresent", "()Z")?;
            b.jump(op::IFEQ, absent);
            b.aload(0).invoke_virtual(OPTIONAL, "get", "()Ljava/lang/Object;")?;
            b.invoke_static(STREAM, "of", "(Ljava/lang/Object;)Ljava/util/stream/Stream;", true)?;
            b.simple(op::ARETURN);
            b.place_frame(absent, FrameKind::Same);
            b.invoke_static(STREAM, "empty", "()Ljava/util/stream/Stream;", true)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::MatcherAppendReplacement => {
            let buffer = string_buffer(b)?;
            b.aload(0).aload(buffer).aload(2);
            b.invoke_virtual(MATCHER, "appendReplacement", "(Ljava/lang/StringBuffer;Ljava/lang/String;)Ljava/util/regex/Matcher;")?;
            b.simple(op::POP);
            b.aload(1).aload(buffer);
            b.invoke_virtual("java/lang/StringBuilder", "append", "(Ljava/lang/StringBuffer;)Ljava/lang/StringBuilder;")?;
            b.simple(op::POP);
            b.aload(0).simple(op::ARETURN);
        }
        ApiLowering::MatcherAppendTail => {
            let buffer = string_buffer(b)?;
            b.aload(0).aload(buffer);
            b.invoke_virtual(MATCHER, "appendTail", "(Ljava/lang/StringBuffer;)Ljava/lang/StringBuffer;")?;
            b.simple(op::POP);
            b.aload(1).aload(buffer);
            b.invoke_virtual("java/lang/StringBuilder", "append", "(Ljava/lang/StringBuffer;)Ljava/lang/StringBuilder;")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::FilesReadString => {
            b.type_insn(op::NEW, "java/lang/String")?.simple(op::DUP);
            b.aload(0).invoke_static("java/nio/file/Files", "readAllBytes", "(Ljava/nio/file/Path;)[B", false)?;
            if desc.params.len() == 2 {
                b.aload(1);
            } else {
                b.field(op::GETSTATIC, "java/nio/charset/StandardCharsets", "UTF_8", "Ljava/nio/charset/Charset;")?;
            }
            b.invoke_special("java/lang/String", "<init>", "([BLjava/nio/charset/Charset;)V")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::ToUnmodifiableList | ApiLowering::ToUnmodifiableSet | ApiLowering::ToUnmodifiableMap => {
            let finisher = companion.ok_or_else(|| missing_companion(member))?;
            match lowering {
                ApiLowering::ToUnmodifiableList => {
                    b.invoke_static(COLLECTORS, "toList", "()Ljava/util/stream/Collector;", false)?;
                }
                ApiLowering::ToUnmodifiableSet => {
                    b.invoke_static(COLLECTORS, "toSet", "()Ljava/util/stream/Collector;", false)?;
                }
                _ => {
                    for i in 0..desc.params.len() {
                        b.aload(i as u16);
                    }
                    b.invoke_static(COLLECTORS, "toMap", &member.descriptor, false)?;
                }
            }
            functional_proxy(b, FUNCTION, finisher, &[])?;
            b.invoke_static(
                COLLECTORS,
                "collectingAndThen",
                "(Ljava/util/stream/Collector;Ljava/util/function/Function;)Ljava/util/stream/Collector;",
                false,
            )?;
            b.simple(op::ARETURN);
        }
        ApiLowering::CharacterToString => {
            b.iload(0).invoke_static("java/lang/Character", "toChars", "(I)[C", false)?;
            b.invoke_static("java/lang/String", "valueOf", "([C)Ljava/lang/String;", false)?;
            b.simple(op::ARETURN);
        }
        ApiLowering::ClassArrayType => {
            b.aload(0).iconst(0)?;
            b.invoke_static("java/lang/reflect/Array", "newInstance", "(Ljava/lang/Class;I)Ljava/lang/Object;", false)?;
            b.invoke_virtual(OBJECT, "getClass", "()Ljava/lang/Class;")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::CollectionToArray => {
            b.aload(0).aload(1).iconst(0)?;
            b.invoke_interface("java/util/function/IntFunction", "apply", "(I)Ljava/lang/Object;")?;
            b.type_insn(op::CHECKCAST, "[Ljava/lang/Object;")?;
            b.invoke_interface("java/util/Collection", "toArray", "([Ljava/lang/Object;)[Ljava/lang/Object;")?;
            b.simple(op::ARETURN);
        }
        ApiLowering::ParseIntRange => {
            b.aload(0).iload(1).iload(2);
            b.invoke_interface("java/lang/CharSequence", "subSequence", "(II)Ljava/lang/CharSequence;")?;
            b.invoke_virtual(OBJECT, "toString", "()Ljava/lang/String;")?;
            b.iload(3).invoke_static("java/lang/Integer", "parseInt", "(Ljava/lang/String;I)I", false)?;
            b.simple(op::IRETURN);
        }
        ApiLowering::ExceptionallyAsync => {
            let stage = companion.ok_or_else(|| missing_companion(member))?;
            let executor = desc.params.len() == 3;
            b.aload(1);
            non_null(b)?;
            b.simple(op::POP);
            if executor {
                b.aload(2);
                non_null(b)?;
                b.simple(op::POP);
            }
            b.aload(0);
            functional_proxy(b, BI_FUNCTION, stage, &[Some(0), Some(1), executor.then_some(2)])?;
            b.invoke_virtual(FUTURE, "handle", "(Ljava/util/function/BiFunction;)Ljava/util/concurrent/CompletableFuture;")?;
            b.invoke_static(FUNCTION, "identity", "()Ljava/util/function/Function;", true)?;
            b.invoke_virtual(FUTURE, "thenCompose", "(Ljava/util/function/Function;)Ljava/util/concurrent/CompletableFuture;")?;
            b.simple(op::ARETURN);
        }
    }
    Ok(())
}

/// `List.of(E...)` and `Set.of(E...)` take the elements as one array.
fn is_varargs(desc: &MethodDescriptor) -> bool {
    matches!(desc.params.as_slice(), [FieldType::Array(_)])
}

/// Pushes an `Object[]` holding the helper's arguments.
fn element_array(b: &mut CodeBuilder<'_>, desc: &MethodDescriptor) -> Result<(), DowngradeError> {
    if is_varargs(desc) {
        b.aload(0);
        return Ok(());
    }
    b.iconst(desc.params.len() as i32)?.type_insn(op::ANEWARRAY, OBJECT)?;
    for i in 0..desc.params.len() {
        b.simple(op::DUP).iconst(i as i32)?.aload(i as u16).simple(op::AASTORE);
    }
    Ok(())
}

fn as_list(b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
    b.invoke_static("java/util/Arrays", "asList", "([Ljava/lang/Object;)Ljava/util/List;", false)?;
    Ok(())
}

/// With a `collection` on the stack, throws if `query(null)` holds for it.
fn reject_null(b: &mut CodeBuilder<'_>, collection: &str, query: &str) -> Result<(), DowngradeError> {
    let ok = b.new_label();
    b.simple(op::DUP).simple(op::ACONST_NULL);
    b.invoke_virtual(collection, query, "(Ljava/lang/Object;)Z")?;
    b.jump(op::IFEQ, ok);
    let npe = "java/lang/NullPointerException";
    b.type_insn(op::NEW, npe)?.simple(op::DUP).invoke_special(npe, "<init>", "()V")?;
    b.simple(op::ATHROW);
    let ty = b.object_type(collection)?;
    b.place_frame(ok, FrameKind::SameLocals1Stack(ty));
    Ok(())
}

fn throw_with_message(b: &mut CodeBuilder<'_>, exception: &str, message: &str) -> Result<(), DowngradeError> {
    b.type_insn(op::NEW, exception)?.simple(op::DUP).ldc_string(message)?;
    b.invoke_special(exception, "<init>", "(Ljava/lang/String;)V")?;
    b.simple(op::ATHROW);
    Ok(())
}

/// Copies the stream in local 0 into the sink in local 1, returning the
/// number of units copied.
fn transfer(b: &mut CodeBuilder<'_>, chunks: &Chunks) -> Result<(), DowngradeError> {
    let total = b.new_local(&FieldType::Long);
    let buf = b.new_local(&chunks.array_type());
    let n = b.new_local(&FieldType::Int);
    b.aload(1).invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;)Ljava/lang/Object;", false)?;
    b.simple(op::POP);
    b.simple(op::LCONST_0).store(&FieldType::Long, total);
    new_buffer(b, chunks, buf)?;

    let (head, done) = (b.new_label(), b.new_label());
    let locals = vec![VerificationType::Long, b.object_type(chunks.array)?];
    b.place_frame(head, FrameKind::Append(locals));
    read_chunk(b, chunks, buf, n, done)?;
    b.aload(1).aload(buf).iconst(0)?.iload(n);
    b.invoke_virtual(chunks.sink, "write", &format!("({}II)V", chunks.array))?;
    b.load(&FieldType::Long, total).iload(n).simple(op::I2L).simple(op::LADD);
    b.store(&FieldType::Long, total);
    b.jump(op::GOTO, head);

    b.place_frame(done, FrameKind::Append(vec![VerificationType::Integer]));
    b.load(&FieldType::Long, total).simple(op::LRETURN);
    Ok(())
}

fn new_buffer(b: &mut CodeBuilder<'_>, chunks: &Chunks, local: u16) -> Result<(), DowngradeError> {
    b.iconst(BUFFER_SIZE)?.insn(Insn::NewArray { atype: chunks.atype });
    b.store(&chunks.array_type(), local);
    Ok(())
}

/// Reads from the stream in local 0 into `buf`, leaving the count in `n`
/// and jumping to `done` at end of stream.
fn read_chunk(b: &mut CodeBuilder<'_>, chunks: &Chunks, buf: u16, n: u16, done: Label) -> Result<(), DowngradeError> {
    b.aload(0).aload(buf).invoke_virtual(chunks.source, "read", &format!("({})I", chunks.array))?;
    b.simple(op::DUP).store(&FieldType::Int, n);
    b.jump(op::IFLT, done);
    Ok(())
}

fn non_null(b: &mut CodeBuilder<'_>) -> Result<(), DowngradeError> {
    b.invoke_static(OBJECTS, "requireNonNull", "(Ljava/lang/Object;)Ljava/lang/Object;", false)?;
    Ok(())
}

/// Pushes an instance of `interface` backed by the method behind `handle`,
/// with the given locals bound to its leading parameters (`None` binds null).
fn functional_proxy(b: &mut CodeBuilder<'_>, interface: &str, handle: u16, bound: &[Option<u16>]) -> Result<(), DowngradeError> {
    b.ldc_class(interface)?.insn(Insn::Ldc { index: handle, wide: false });
    for local in bound {
        match local {
            Some(index) => b.aload(*index),
            None => b.simple(op::ACONST_NULL),
        };
        b.invoke_virtual(METHOD_HANDLE, "bindTo", "(Ljava/lang/Object;)Ljava/lang/invoke/MethodHandle;")?;
    }
    b.invoke_static(
        "java/lang/invoke/MethodHandleProxies",
        "asInterfaceInstance",
        "(Ljava/lang/Class;Ljava/lang/invoke/MethodHandle;)Ljava/lang/Object;",
        false,
    )?;
    b.type_insn(op::CHECKCAST, interface)?;
    Ok(())
}

/// Pushes a new empty `StringBuffer` into a fresh local.
fn string_buffer(b: &mut CodeBuilder<'_>) -> Result<u16, DowngradeError> {
    let local = b.new_local(&FieldType::object(STRING_BUFFER));
    b.type_insn(op::NEW, STRING_BUFFER)?.simple(op::DUP);
    b.invoke_special(STRING_BUFFER, "<init>", "()V")?;
    b.store(&FieldType::object(STRING_BUFFER), local);
    Ok(local)
}

fn missing_companion(member: &MemberRef) -> DowngradeError {
    DowngradeError::unsupported(format!("{}.{} without a finishing helper", member.owner, member.name), Location::Class)
}
